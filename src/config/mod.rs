use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "PRIZRAK_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("invalid {key} override: {value}")]
    Env { key: String, value: String },
    #[error("{0}")]
    Invalid(&'static str),
    #[error("{0} already exists")]
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub account: AccountConfig,
    pub service: ServiceConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AccountConfig {
    pub login: String,
    /// Vault key holding the account password.
    pub password_key: String,
    pub language_code: String,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            login: String::new(),
            password_key: "prizrak_password".to_string(),
            language_code: "EN".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub ws_url: String,
    pub origin: String,
    pub app_name: String,
    pub app_version: String,
    pub lang: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://monitoring.tecel.ru".to_string(),
            ws_url: "wss://monitoring.tecel.ru".to_string(),
            origin: "https://monitoring.tecel.ru".to_string(),
            app_name: "Prizrak Bridge".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            lang: "ru".to_string(),
        }
    }
}

/// Timings of the realtime client. Seconds unless the name says otherwise.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub http_timeout_secs: u64,
    pub delete_timeout_secs: u64,
    pub token_validity_hours: u64,
    pub reconnect_delay_secs: u64,
    pub backoff_cap_secs: u64,
    pub backoff_max_exponent: u32,
    pub reauth_retry_secs: u64,
    pub conflict_retry_secs: u64,
    pub ping_interval_secs: u64,
    pub watchdog_interval_secs: u64,
    pub message_timeout_secs: u64,
    pub event_timeout_secs: u64,
    pub handshake_grace_ms: u64,
    pub command_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub ready_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 10,
            delete_timeout_secs: 5,
            token_validity_hours: 12,
            reconnect_delay_secs: 5,
            backoff_cap_secs: 60,
            backoff_max_exponent: 5,
            reauth_retry_secs: 30,
            conflict_retry_secs: 2,
            ping_interval_secs: 15,
            watchdog_interval_secs: 10,
            message_timeout_secs: 60,
            event_timeout_secs: 120,
            handshake_grace_ms: 500,
            command_timeout_secs: 10,
            send_timeout_secs: 5,
            ready_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7080,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub path: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path = active_config_path();
        let mut config = match fs::read_to_string(&path) {
            Ok(raw) => toml::from_str::<Config>(&raw).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        // Account
        if let Some(val) = env_var("LOGIN") {
            self.account.login = val;
        }
        if let Some(val) = env_var("PASSWORD_KEY") {
            self.account.password_key = val;
        }
        if let Some(val) = env_var("LANGUAGE_CODE") {
            self.account.language_code = val;
        }

        // Service endpoints
        if let Some(val) = env_var("BASE_URL") {
            self.service.base_url = val;
        }
        if let Some(val) = env_var("WS_URL") {
            self.service.ws_url = val;
        }
        if let Some(val) = env_var("ORIGIN") {
            self.service.origin = val;
        }

        // Client timings
        if let Some(val) = env_var("COMMAND_TIMEOUT_SECS") {
            self.client.command_timeout_secs = parse_env("COMMAND_TIMEOUT_SECS", &val)?;
        }
        if let Some(val) = env_var("READY_TIMEOUT_SECS") {
            self.client.ready_timeout_secs = parse_env("READY_TIMEOUT_SECS", &val)?;
        }

        // Local API
        if let Some(val) = env_var("SERVER_ENABLED") {
            self.server.enabled = parse_env("SERVER_ENABLED", &val)?;
        }
        if let Some(val) = env_var("SERVER_PORT") {
            self.server.port = parse_env("SERVER_PORT", &val)?;
        }
        if let Some(val) = env_var("SERVER_TOKEN") {
            self.server.token = Some(val);
        }

        if let Some(val) = env_var("VAULT_PATH") {
            self.vault.path = Some(val);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account.login.trim().is_empty() {
            return Err(ConfigError::Invalid("account.login must be set"));
        }
        if self.account.password_key.trim().is_empty() {
            return Err(ConfigError::Invalid("account.password_key must be set"));
        }
        if self.service.base_url.trim().is_empty() || self.service.ws_url.trim().is_empty() {
            return Err(ConfigError::Invalid("service.base_url and service.ws_url must be set"));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero"));
        }

        let c = &self.client;
        let intervals = [
            c.http_timeout_secs,
            c.delete_timeout_secs,
            c.token_validity_hours,
            c.reconnect_delay_secs,
            c.ping_interval_secs,
            c.watchdog_interval_secs,
            c.message_timeout_secs,
            c.event_timeout_secs,
            c.command_timeout_secs,
            c.send_timeout_secs,
            c.ready_timeout_secs,
        ];
        if intervals.contains(&0) {
            return Err(ConfigError::Invalid("client intervals and timeouts must be positive"));
        }
        if c.backoff_cap_secs < c.reconnect_delay_secs {
            return Err(ConfigError::Invalid(
                "client.backoff_cap_secs must be >= client.reconnect_delay_secs",
            ));
        }
        if c.watchdog_interval_secs >= c.message_timeout_secs {
            return Err(ConfigError::Invalid(
                "client.watchdog_interval_secs must be below client.message_timeout_secs",
            ));
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: format!("{ENV_PREFIX}{key}"),
        value: value.to_string(),
    })
}

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("ru", "tecel", "prizrak-bridge")
}

fn managed_config_path() -> PathBuf {
    if let Some(path) = env_var("CONFIG_PATH") {
        return PathBuf::from(path);
    }
    match project_dirs() {
        Some(dirs) => dirs.config_dir().join(CONFIG_FILE),
        None => PathBuf::from(CONFIG_FILE),
    }
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut cfg = Config::default();
        cfg.account.login = "driver@example.test".to_string();
        cfg
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let toml = toml::to_string_pretty(&valid()).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.client.message_timeout_secs, 60);
        assert_eq!(parsed.client.event_timeout_secs, 120);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [account]
            login = "driver@example.test"

            [client]
            ping_interval_secs = 20
            "#,
        )
        .unwrap();
        assert_eq!(parsed.client.ping_interval_secs, 20);
        assert_eq!(parsed.client.reconnect_delay_secs, 5);
        assert_eq!(parsed.account.password_key, "prizrak_password");
        assert_eq!(parsed.service.ws_url, "wss://monitoring.tecel.ru");
    }

    #[test]
    fn validate_requires_login() {
        assert!(Config::default().validate().is_err());
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_port_and_intervals() {
        let mut cfg = valid();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = valid();
        cfg.client.ping_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_cap_below_base_delay() {
        let mut cfg = valid();
        cfg.client.backoff_cap_secs = 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_env_reports_bad_values() {
        assert_eq!(parse_env::<u16>("SERVER_PORT", "8081").unwrap(), 8081);
        let err = parse_env::<u16>("SERVER_PORT", "eighty").unwrap_err();
        assert!(err.to_string().contains("PRIZRAK_SERVER_PORT"));
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let path = env::temp_dir().join(format!("prizrak-config-{}.toml", std::process::id()));
        let _ = fs::remove_file(&path);
        Config::write_default(&path).unwrap();
        assert!(matches!(
            Config::write_default(&path),
            Err(ConfigError::AlreadyExists(_))
        ));
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("[client]"));
        fs::remove_file(&path).unwrap();
    }
}
