use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::supervisor::ReconnectPolicy;
use crate::transport::live::{self, LiveCredentials, SessionConfig};

pub const ENV_UID: &str = "LIVEDECK_UID";
pub const ENV_ROOM_ID: &str = "LIVEDECK_ROOM_ID";
pub const ENV_TOKEN: &str = "LIVEDECK_TOKEN";
pub const ENV_ENDPOINT: &str = "LIVEDECK_ENDPOINT";

/// Default config directory: ~/.livedeck/
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".livedeck")
}

/// Default config file path: ~/.livedeck/settings.json
pub fn default_config_path() -> PathBuf {
    config_dir().join("settings.json")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveConfig {
    #[serde(default)]
    pub uid: u64,
    #[serde(default)]
    pub room_id: Option<u64>,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_version() -> u32 {
    1
}
fn default_endpoint() -> String {
    live::DEFAULT_ENDPOINT.to_string()
}
fn default_heartbeat_secs() -> u64 {
    live::DEFAULT_HEARTBEAT_INTERVAL.as_secs()
}
fn default_connect_timeout_secs() -> u64 {
    live::DEFAULT_CONNECT_TIMEOUT.as_secs()
}
fn default_initial_delay_secs() -> u64 {
    3
}
fn default_max_delay_secs() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            live: LiveConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            uid: 0,
            room_id: None,
            token: String::new(),
            endpoint: default_endpoint(),
            heartbeat_secs: default_heartbeat_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            max_attempts: None,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {e}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Loads `path` if it exists, defaults otherwise. Either way the
    /// environment is applied on top.
    pub fn resolve(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.apply_env(|key| std::env::var(key).ok())
    }

    /// Applies `LIVEDECK_*` overrides read through `lookup`.
    pub fn apply_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(v) = lookup(ENV_UID) {
            self.live.uid = v.trim().parse().with_context(|| format!("Invalid {ENV_UID}: {v}"))?;
        }
        if let Some(v) = lookup(ENV_ROOM_ID) {
            self.live.room_id = Some(
                v.trim()
                    .parse()
                    .with_context(|| format!("Invalid {ENV_ROOM_ID}: {v}"))?,
            );
        }
        if let Some(v) = lookup(ENV_TOKEN) {
            self.live.token = v;
        }
        if let Some(v) = lookup(ENV_ENDPOINT) {
            self.live.endpoint = v;
        }
        Ok(self)
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        let endpoint = url::Url::parse(&self.live.endpoint)
            .with_context(|| format!("Invalid endpoint: {}", self.live.endpoint))?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            bail!("Endpoint must be a ws:// or wss:// URL, got {}", self.live.endpoint);
        }
        if self.live.heartbeat_secs == 0 {
            bail!("heartbeat_secs must be at least 1");
        }
        Ok(SessionConfig {
            endpoint: self.live.endpoint.clone(),
            heartbeat_interval: Duration::from_secs(self.live.heartbeat_secs),
            connect_timeout: Duration::from_secs(self.live.connect_timeout_secs.max(1)),
            ..SessionConfig::default()
        })
    }

    pub fn credentials(&self) -> Result<LiveCredentials> {
        let Some(room_id) = self.live.room_id else {
            bail!("No room id configured. Pass --room or set {ENV_ROOM_ID}.");
        };
        Ok(LiveCredentials {
            uid: self.live.uid,
            room_id,
            token: self.live.token.clone(),
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_secs(self.reconnect.initial_delay_secs),
            max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
            max_attempts: self.reconnect.max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_file_gets_defaults() {
        let config = AppConfig::parse("{}").unwrap();
        assert_eq!(config.version, 1);
        assert_eq!(config.live.endpoint, live::DEFAULT_ENDPOINT);
        assert_eq!(config.live.heartbeat_secs, 30);
        assert!(!config.reconnect.enabled);
        assert!(config.credentials().is_err());
    }

    #[test]
    fn parses_live_section() {
        let config = AppConfig::parse(
            r#"{"live":{"uid":5,"room_id":21452505,"token":"abc","heartbeat_secs":20},
                "reconnect":{"enabled":true,"max_attempts":4}}"#,
        )
        .unwrap();
        let creds = config.credentials().unwrap();
        assert_eq!((creds.uid, creds.room_id, creds.token.as_str()), (5, 21452505, "abc"));
        assert_eq!(
            config.session_config().unwrap().heartbeat_interval,
            Duration::from_secs(20)
        );
        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts, Some(4));
        assert_eq!(policy.initial_delay, Duration::from_secs(3));
    }

    #[test]
    fn env_overrides_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_ROOM_ID, "99"),
            (ENV_TOKEN, "from-env"),
            (ENV_ENDPOINT, "ws://127.0.0.1:9000/sub"),
        ]);
        let config = AppConfig::parse(r#"{"live":{"room_id":1,"token":"file"}}"#)
            .unwrap()
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.live.room_id, Some(99));
        assert_eq!(config.live.token, "from-env");
        assert_eq!(config.session_config().unwrap().endpoint, "ws://127.0.0.1:9000/sub");
    }

    #[test]
    fn bad_env_number_is_an_error() {
        let result = AppConfig::default().apply_env(|k| (k == ENV_UID).then(|| "abc".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn http_endpoint_is_rejected() {
        let mut config = AppConfig::default();
        config.live.endpoint = "https://example.com/sub".into();
        assert!(config.session_config().is_err());
    }
}
