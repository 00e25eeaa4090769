// REST reads the real-time sessions depend on: chat history and the notification backlog

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Url;
use serde::de::DeserializeOwned;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::models::{Message, Notification};

const CHAT_HISTORY_PATH: &str = "api/Chat/history";
const NOTIFICATION_BACKLOG_PATH: &str = "api/Notification/user";

#[async_trait]
pub trait BackendApi: Send + Sync + 'static {
    /// Messages exchanged between two users, oldest first.
    async fn chat_history(&self, self_id: &str, other_id: &str) -> Result<Vec<Message>>;

    /// Notifications stored for a user, in the server's order.
    async fn notification_backlog(&self, user_id: &str) -> Result<Vec<Notification>>;
}

/// [`BackendApi`] over HTTP, authenticated with the configured bearer token.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl RestClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("hublink/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    fn endpoint(&self, base_path: &str, segments: &[&str]) -> Result<Url> {
        let mut url = self.config.api_url(base_path)?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Config(format!("API base URL cannot carry a path: {}", self.config.api_base_url)))?
            .extend(segments);
        Ok(url)
    }

    /// `on_status` maps a non-success status to the error for this resource.
    async fn get_json<T: DeserializeOwned>(&self, url: Url, on_status: fn(u16) -> ClientError) -> Result<T> {
        debug!("GET {}", url);
        let mut request = self.http.get(url.clone());
        if let Some(token) = self.config.access_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("GET {} answered HTTP {}", url, status);
            return Err(on_status(status.as_u16()));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl BackendApi for RestClient {
    async fn chat_history(&self, self_id: &str, other_id: &str) -> Result<Vec<Message>> {
        let url = self.endpoint(CHAT_HISTORY_PATH, &[self_id, other_id])?;
        let messages: Vec<Message> = self
            .get_json(url, |status| ClientError::HistoryLoad { status })
            .await?;
        info!("Loaded {} messages between {} and {}", messages.len(), self_id, other_id);
        Ok(messages)
    }

    async fn notification_backlog(&self, user_id: &str) -> Result<Vec<Notification>> {
        let url = self.endpoint(NOTIFICATION_BACKLOG_PATH, &[user_id])?;
        let notifications: Vec<Notification> = self
            .get_json(url, |status| ClientError::BacklogLoad { status })
            .await?;
        info!("Loaded {} stored notifications for {}", notifications.len(), user_id);
        Ok(notifications)
    }
}
