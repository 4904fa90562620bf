//! Identity service client: exchanges login and password for an access token.

use base64::{engine::general_purpose, Engine as _};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT},
    Client, Method, Request, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, time::Duration};

const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_LANGUAGE_CODE: &str = "EN";
pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

const VTOKEN_HEADER: &str = "x-vtoken";
const ATOKEN_HEADER: &str = "x-atoken";
const FINGERPRINT: &str = "2dfaeb1bd6be147c176aeb44076c11e3";
const UNIQ_ID: &str = "mit9hov5mit9hov6mit9hov7mit9hov8";
const FINGERPRINT_APP_VERSION: &str = "268.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Header,
    ResultAtoken,
    /// Degraded: the service returned a session id but no access token.
    SessionId,
}

#[derive(Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub token: String,
    pub source: TokenSource,
}

impl fmt::Debug for AuthGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGrant")
            .field("token", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PassportError {
    #[error("config error: {0}")]
    Config(&'static str),
    #[error("url error: {0}")]
    Url(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error("passport error {}: {body}", .status.as_u16())]
    Api { status: StatusCode, body: String },
    #[error("authorization response has no result")]
    MissingResult,
    #[error("authorization result carries neither atoken nor session_id")]
    MissingToken,
}

#[derive(Clone)]
pub struct PassportClient {
    http: Client,
    endpoint: Url,
    login: String,
    password: String,
    language_code: String,
}

impl fmt::Debug for PassportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PassportClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone)]
pub struct PassportClientBuilder {
    base_url: String,
    login: String,
    password: String,
    language_code: String,
    timeout: Duration,
}

impl PassportClientBuilder {
    pub fn new(base_url: impl Into<String>, login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            login: login.into(),
            password: password.into(),
            language_code: DEFAULT_LANGUAGE_CODE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn language_code(mut self, language_code: impl Into<String>) -> Self {
        self.language_code = language_code.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<PassportClient, PassportError> {
        if self.login.trim().is_empty() {
            return Err(PassportError::Config("login must not be empty"));
        }
        if self.password.is_empty() {
            return Err(PassportError::Config("password must not be empty"));
        }
        let base = normalized_base(&self.base_url).map_err(PassportError::Url)?;
        let endpoint = base
            .join("passport/api")
            .map_err(|err| PassportError::Url(err.to_string()))?;
        let http = Client::builder().timeout(self.timeout).build()?;

        Ok(PassportClient {
            http,
            endpoint,
            login: self.login.trim().to_string(),
            password: self.password,
            language_code: self.language_code,
        })
    }
}

/// Parses a base URL and makes sure relative joins land under its path.
pub(crate) fn normalized_base(raw: &str) -> Result<Url, String> {
    let mut parsed = Url::parse(raw.trim()).map_err(|err| err.to_string())?;
    if !parsed.path().ends_with('/') {
        let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
        parsed.set_path(&new_path);
    }
    Ok(parsed)
}

#[derive(Serialize)]
struct RpcRequest<P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: P,
}

#[derive(Serialize)]
struct CheckLoginParams<'a> {
    login: &'a str,
    language_code: &'a str,
}

#[derive(Serialize)]
struct AuthorizationParams<'a> {
    login: &'a str,
    password: &'a str,
    forever: bool,
    language_code: &'a str,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Fingerprint {
    #[serde(rename = "VTokenKey")]
    vtoken_key: &'static str,
    finger_print: &'static str,
    uniq_id: &'static str,
    app_version: &'static str,
    service: &'static str,
}

/// Device fingerprint the identity service expects in `x-vtoken`.
pub fn fingerprint_token() -> String {
    let fingerprint = Fingerprint {
        vtoken_key: VTOKEN_HEADER,
        finger_print: FINGERPRINT,
        uniq_id: UNIQ_ID,
        app_version: FINGERPRINT_APP_VERSION,
        service: "",
    };
    let json = serde_json::to_vec(&fingerprint).unwrap_or_default();
    general_purpose::STANDARD.encode(json)
}

impl PassportClient {
    pub fn builder(
        base_url: impl Into<String>,
        login: impl Into<String>,
        password: impl Into<String>,
    ) -> PassportClientBuilder {
        PassportClientBuilder::new(base_url, login, password)
    }

    /// Runs `CheckLogin` followed by `Authorization`.
    pub async fn authenticate(&self) -> Result<AuthGrant, PassportError> {
        tracing::info!(login = %self.login, "authenticating");

        let req = self.build_check_login_request(rpc_id())?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_check_login_response(status, &body)?;

        let req = self.build_authorization_request(rpc_id())?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.text().await?;
        let grant = parse_authorization_response(status, &headers, &body)?;

        match grant.source {
            TokenSource::SessionId => {
                tracing::warn!("no access token issued, using session id as token (may not work)")
            }
            source => tracing::info!(?source, "access token acquired"),
        }
        Ok(grant)
    }

    pub fn build_check_login_request(&self, id: u64) -> Result<Request, PassportError> {
        let params = CheckLoginParams {
            login: &self.login,
            language_code: &self.language_code,
        };
        self.build_rpc_request(id, "CheckLogin", params)
    }

    pub fn build_authorization_request(&self, id: u64) -> Result<Request, PassportError> {
        let params = AuthorizationParams {
            login: &self.login,
            password: &self.password,
            forever: true,
            language_code: &self.language_code,
        };
        self.build_rpc_request(id, "Authorization", params)
    }

    fn build_rpc_request<P: Serialize>(
        &self,
        id: u64,
        method: &'static str,
        params: P,
    ) -> Result<Request, PassportError> {
        let body = serde_json::to_vec(&RpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;
        self.http
            .request(Method::POST, self.endpoint.clone())
            .headers(common_headers()?)
            .body(body)
            .build()
            .map_err(PassportError::Http)
    }
}

fn common_headers() -> Result<HeaderMap, PassportError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert(VTOKEN_HEADER, HeaderValue::from_str(&fingerprint_token())?);
    Ok(headers)
}

fn rpc_id() -> u64 {
    crate::model::now_unix_ms()
}

pub fn parse_check_login_response(status: StatusCode, body: &str) -> Result<(), PassportError> {
    if status != StatusCode::OK {
        return Err(PassportError::Api {
            status,
            body: body.to_string(),
        });
    }
    let response: RpcResponse = serde_json::from_str(body)?;
    if let Some(error) = response.error.filter(|e| !e.is_null()) {
        tracing::debug!(%error, "CheckLogin reported an error");
    }
    Ok(())
}

pub fn parse_authorization_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> Result<AuthGrant, PassportError> {
    if status != StatusCode::OK {
        return Err(PassportError::Api {
            status,
            body: body.to_string(),
        });
    }

    let header_token = headers
        .get(ATOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = header_token {
        return Ok(AuthGrant {
            token: token.to_string(),
            source: TokenSource::Header,
        });
    }

    let response: RpcResponse = serde_json::from_str(body)?;
    let result = response.result.ok_or(PassportError::MissingResult)?;

    if let Some(token) = result.get("atoken").and_then(token_text) {
        return Ok(AuthGrant {
            token,
            source: TokenSource::ResultAtoken,
        });
    }
    if let Some(token) = result.get("session_id").and_then(token_text) {
        return Ok(AuthGrant {
            token,
            source: TokenSource::SessionId,
        });
    }
    Err(PassportError::MissingToken)
}

fn token_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
