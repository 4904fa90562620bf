//! Hub control endpoints: negotiate a connection id and delete stale ones.

use crate::passport::{normalized_base, BROWSER_USER_AGENT};
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT},
    Client, Method, Request, StatusCode, Url,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 5;
pub const AUTH_ENVELOPE_TYPE: u64 = 2154785295;
pub const SIGNALR_USER_AGENT: &str = "Microsoft SignalR/7.0";

/// How this client introduces itself inside the auth envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub app_name: String,
    pub app_version: String,
    pub app_host: String,
    pub lang: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AuthEnvelope<'a> {
    #[serde(rename = "Type")]
    kind: u64,
    atoken: &'a str,
    client_data: ClientData<'a>,
    lang: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ClientData<'a> {
    app_name: &'a str,
    app_version: &'a str,
    app_host: &'a str,
    is_user_data_available: bool,
    additional_info: Map<String, Value>,
}

impl ClientIdentity {
    /// JSON envelope carried as the bearer credential and as `access_token`.
    pub fn envelope_json(&self, token: &str) -> Result<String, serde_json::Error> {
        serde_json::to_string(&AuthEnvelope {
            kind: AUTH_ENVELOPE_TYPE,
            atoken: token,
            client_data: ClientData {
                app_name: &self.app_name,
                app_version: &self.app_version,
                app_host: &self.app_host,
                is_user_data_available: true,
                additional_info: Map::new(),
            },
            lang: &self.lang,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("url error: {0}")]
    Url(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error("control api error {}: {body}", .status.as_u16())]
    Api { status: StatusCode, body: String },
    #[error("negotiate response has no connectionToken")]
    MissingConnectionToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
    Unexpected(u16),
    Failed,
}

pub fn classify_delete_status(status: StatusCode) -> DeleteOutcome {
    match status {
        StatusCode::OK | StatusCode::NO_CONTENT => DeleteOutcome::Deleted,
        StatusCode::NOT_FOUND => DeleteOutcome::AlreadyGone,
        other => DeleteOutcome::Unexpected(other.as_u16()),
    }
}

#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    base_url: Url,
    identity: ClientIdentity,
    delete_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ControlClientBuilder {
    base_url: String,
    identity: ClientIdentity,
    timeout: Duration,
    delete_timeout: Duration,
}

impl ControlClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ControlClient, ControlError> {
        let base_url = normalized_base(&self.base_url).map_err(ControlError::Url)?;
        let mut identity = self.identity;
        if identity.app_host.trim().is_empty() {
            identity.app_host = base_url.host_str().unwrap_or_default().to_string();
        }
        let http = Client::builder().timeout(self.timeout).build()?;
        Ok(ControlClient {
            http,
            base_url,
            identity,
            delete_timeout: self.delete_timeout,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    #[serde(default)]
    connection_token: Option<String>,
}

impl ControlClient {
    pub fn builder(base_url: impl Into<String>, identity: ClientIdentity) -> ControlClientBuilder {
        ControlClientBuilder {
            base_url: base_url.into(),
            identity,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            delete_timeout: Duration::from_secs(DEFAULT_DELETE_TIMEOUT_SECS),
        }
    }

    pub fn envelope_json(&self, token: &str) -> Result<String, serde_json::Error> {
        self.identity.envelope_json(token)
    }

    pub async fn negotiate(&self, token: &str) -> Result<String, ControlError> {
        tracing::info!("negotiating connection");
        let req = self.build_negotiate_request(token)?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_negotiate_response(status, &body)
    }

    /// Best-effort removal of a stale connection id. Never fails; the outcome
    /// is logged and returned for callers that care.
    pub async fn delete(&self, connection_id: &str, token: &str) -> DeleteOutcome {
        let req = match self.build_delete_request(connection_id, token) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(error = %err, "could not build delete request");
                return DeleteOutcome::Failed;
            }
        };
        let outcome = match self.http.execute(req).await {
            Ok(resp) => classify_delete_status(resp.status()),
            Err(err) => {
                tracing::warn!(error = %err, "failed to delete stale connection");
                return DeleteOutcome::Failed;
            }
        };
        match outcome {
            DeleteOutcome::Deleted | DeleteOutcome::AlreadyGone => {
                tracing::info!(?outcome, "stale connection deleted or already gone")
            }
            DeleteOutcome::Unexpected(status) => {
                tracing::warn!(status, "delete connection returned unexpected status")
            }
            DeleteOutcome::Failed => {}
        }
        outcome
    }

    pub fn build_negotiate_request(&self, token: &str) -> Result<Request, ControlError> {
        let mut url = self.endpoint("api/Control/negotiate")?;
        url.query_pairs_mut().append_pair("negotiateVersion", "1");
        self.http
            .request(Method::POST, url)
            .headers(self.common_headers(token)?)
            .build()
            .map_err(ControlError::Http)
    }

    pub fn build_delete_request(&self, connection_id: &str, token: &str) -> Result<Request, ControlError> {
        let mut url = self.endpoint("api/Control")?;
        url.query_pairs_mut().append_pair("id", connection_id);
        self.http
            .request(Method::DELETE, url)
            .headers(self.common_headers(token)?)
            .timeout(self.delete_timeout)
            .build()
            .map_err(ControlError::Http)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ControlError> {
        self.base_url
            .join(path)
            .map_err(|err| ControlError::Url(err.to_string()))
    }

    fn common_headers(&self, token: &str) -> Result<HeaderMap, ControlError> {
        let envelope = self.envelope_json(token)?;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {envelope}"))?,
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert("x-signalr-user-agent", HeaderValue::from_static(SIGNALR_USER_AGENT));
        Ok(headers)
    }
}

pub fn parse_negotiate_response(status: StatusCode, body: &str) -> Result<String, ControlError> {
    if status != StatusCode::OK {
        return Err(ControlError::Api {
            status,
            body: body.to_string(),
        });
    }
    let response: NegotiateResponse = serde_json::from_str(body)?;
    response
        .connection_token
        .filter(|token| !token.is_empty())
        .ok_or(ControlError::MissingConnectionToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ClientIdentity {
        ClientIdentity {
            app_name: "Prizrak Bridge".to_string(),
            app_version: "0.1.0".to_string(),
            app_host: String::new(),
            lang: "ru".to_string(),
        }
    }

    fn client() -> ControlClient {
        ControlClient::builder("https://monitoring.example.test", identity())
            .build()
            .unwrap()
    }

    #[test]
    fn envelope_has_expected_shape() {
        let json: Value = serde_json::from_str(&client().envelope_json("tok").unwrap()).unwrap();
        assert_eq!(json["Type"], 2154785295u64);
        assert_eq!(json["Atoken"], "tok");
        assert_eq!(json["Lang"], "ru");
        assert_eq!(json["ClientData"]["AppName"], "Prizrak Bridge");
        assert_eq!(json["ClientData"]["AppHost"], "monitoring.example.test");
        assert_eq!(json["ClientData"]["IsUserDataAvailable"], true);
        assert_eq!(json["ClientData"]["AdditionalInfo"], serde_json::json!({}));
    }

    #[test]
    fn negotiate_request_carries_envelope_as_bearer() {
        let req = client().build_negotiate_request("tok").unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(
            req.url().as_str(),
            "https://monitoring.example.test/api/Control/negotiate?negotiateVersion=1"
        );
        let auth = req.headers().get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(auth.starts_with("Bearer {"));
        assert!(auth.contains("\"Atoken\":\"tok\""));
        assert_eq!(
            req.headers().get("x-signalr-user-agent").unwrap(),
            &HeaderValue::from_static(SIGNALR_USER_AGENT)
        );
        assert_eq!(req.headers().get(ACCEPT).unwrap(), &HeaderValue::from_static("*/*"));
    }

    #[test]
    fn delete_request_targets_connection_with_short_timeout() {
        let req = client().build_delete_request("abc-123", "tok").unwrap();
        assert_eq!(req.method(), Method::DELETE);
        assert_eq!(
            req.url().as_str(),
            "https://monitoring.example.test/api/Control?id=abc-123"
        );
        assert_eq!(req.timeout(), Some(&Duration::from_secs(5)));
    }

    #[test]
    fn negotiate_response_yields_connection_token() {
        let token = parse_negotiate_response(
            StatusCode::OK,
            r#"{"negotiateVersion":1,"connectionId":"x","connectionToken":"ctok"}"#,
        )
        .unwrap();
        assert_eq!(token, "ctok");

        assert!(matches!(
            parse_negotiate_response(StatusCode::OK, r#"{"connectionId":"x"}"#),
            Err(ControlError::MissingConnectionToken)
        ));
        assert!(matches!(
            parse_negotiate_response(StatusCode::UNAUTHORIZED, ""),
            Err(ControlError::Api { .. })
        ));
    }

    #[test]
    fn delete_status_classification() {
        assert_eq!(classify_delete_status(StatusCode::OK), DeleteOutcome::Deleted);
        assert_eq!(classify_delete_status(StatusCode::NO_CONTENT), DeleteOutcome::Deleted);
        assert_eq!(classify_delete_status(StatusCode::NOT_FOUND), DeleteOutcome::AlreadyGone);
        assert_eq!(
            classify_delete_status(StatusCode::INTERNAL_SERVER_ERROR),
            DeleteOutcome::Unexpected(500)
        );
    }
}
