// Client configuration: endpoints, the injected identity and connection tuning

use log::debug;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::error::{ClientError, Result};

pub const CHAT_HUB: &str = "chatHub";
pub const STATUS_HUB: &str = "statusHub";
pub const NOTIFICATION_HUB: &str = "notificationHub";

/// Who the sessions act as. Supplied once at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

/// Connection lifecycle tuning. Durations are kept in milliseconds so the struct
/// can live in a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Delays before each automatic reconnection attempt; exhausting the list gives up.
    pub reconnect_delays_ms: Vec<u64>,
    /// Fixed delay before retrying a failed initial connect. `None` means no retry.
    pub initial_retry_delay_ms: Option<u64>,
    pub handshake_timeout_ms: u64,
    pub keep_alive_interval_ms: u64,
    pub server_timeout_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            initial_retry_delay_ms: None,
            handshake_timeout_ms: 15_000,
            keep_alive_interval_ms: 15_000,
            server_timeout_ms: 30_000,
        }
    }
}

impl ConnectionOptions {
    pub fn reconnect_delays(&self) -> impl Iterator<Item = Duration> + '_ {
        self.reconnect_delays_ms.iter().map(|ms| Duration::from_millis(*ms))
    }

    pub fn initial_retry_delay(&self) -> Option<Duration> {
        self.initial_retry_delay_ms.map(Duration::from_millis)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    pub fn with_initial_retry(mut self, delay: Duration) -> Self {
        self.initial_retry_delay_ms = Some(delay.as_millis() as u64);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub hub_base_url: String,
    #[serde(default)]
    pub identity: Option<Identity>,
    #[serde(default)]
    pub connection: ConnectionOptions,
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>, hub_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            hub_base_url: hub_base_url.into(),
            identity: None,
            connection: ConnectionOptions::default(),
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_connection(mut self, connection: ConnectionOptions) -> Self {
        self.connection = connection;
        self
    }

    /// Overlay `HUBLINK_*` environment variables on top of this configuration.
    pub fn merge_env(mut self) -> Self {
        if let Ok(url) = env::var("HUBLINK_API_URL") {
            debug!("Using API base URL from environment: {}", url);
            self.api_base_url = url;
        }
        if let Ok(url) = env::var("HUBLINK_HUB_URL") {
            debug!("Using hub base URL from environment: {}", url);
            self.hub_base_url = url;
        }
        if let Ok(user_id) = env::var("HUBLINK_USER_ID") {
            let token = self.identity.take().and_then(|identity| identity.access_token);
            self.identity = Some(Identity {
                user_id,
                access_token: token,
            });
        }
        if let Ok(token) = env::var("HUBLINK_TOKEN") {
            if let Some(identity) = self.identity.as_mut() {
                identity.access_token = Some(token);
            }
        }
        self
    }

    /// Build a configuration purely from the environment.
    pub fn from_env() -> Result<Self> {
        let api = env::var("HUBLINK_API_URL")
            .map_err(|_| ClientError::Config("HUBLINK_API_URL is not set".to_string()))?;
        let hub = env::var("HUBLINK_HUB_URL").unwrap_or_else(|_| api.clone());
        Ok(Self::new(api, hub).merge_env())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.user_id.as_str())
    }

    pub fn access_token(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|identity| identity.access_token.as_deref())
    }

    /// WebSocket URL for a hub, carrying the access token as a query parameter.
    pub fn hub_url(&self, hub: &str) -> Result<String> {
        let mut url = join(&self.hub_base_url, hub)?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ClientError::Config(format!("unsupported hub URL scheme '{}'", other))),
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Config(format!("cannot use scheme '{}' for {}", scheme, url)))?;

        if let Some(token) = self.access_token() {
            url.query_pairs_mut().append_pair("access_token", token);
        }
        Ok(url.to_string())
    }

    /// Absolute URL for a REST path.
    pub fn api_url(&self, path: &str) -> Result<Url> {
        join(&self.api_base_url, path)
    }
}

fn join(base: &str, path: &str) -> Result<Url> {
    // A base without a trailing slash would lose its last segment on join
    let base = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    };
    let base = Url::parse(&base).map_err(|e| ClientError::Config(format!("invalid base URL '{}': {}", base, e)))?;
    base.join(path.trim_start_matches('/'))
        .map_err(|e| ClientError::Config(format!("invalid path '{}': {}", path, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_url_maps_scheme_and_token() {
        let config = ClientConfig::new("https://api.example.com", "https://api.example.com/hubs")
            .with_identity(Identity::new("42").with_token("abc.def"));

        assert_eq!(
            config.hub_url(CHAT_HUB).unwrap(),
            "wss://api.example.com/hubs/chatHub?access_token=abc.def"
        );
    }

    #[test]
    fn test_hub_url_without_identity() {
        let config = ClientConfig::new("http://localhost:5000", "http://localhost:5000/");
        assert_eq!(config.hub_url(STATUS_HUB).unwrap(), "ws://localhost:5000/statusHub");
    }

    #[test]
    fn test_hub_url_rejects_unknown_scheme() {
        let config = ClientConfig::new("http://localhost", "ftp://localhost");
        assert!(matches!(config.hub_url(CHAT_HUB), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_api_url_keeps_base_path() {
        let config = ClientConfig::new("https://example.com/backend", "https://example.com");
        let url = config.api_url("/api/Chat/history/1/2").unwrap();
        assert_eq!(url.as_str(), "https://example.com/backend/api/Chat/history/1/2");
    }

    #[test]
    fn test_connection_options_from_partial_json() {
        let options: ConnectionOptions = serde_json::from_str(r#"{"reconnect_delays_ms":[0,100]}"#).unwrap();
        assert_eq!(options.reconnect_delays().collect::<Vec<_>>(), vec![Duration::ZERO, Duration::from_millis(100)]);
        assert_eq!(options.handshake_timeout(), Duration::from_secs(15));
        assert_eq!(options.initial_retry_delay(), None);
    }
}
