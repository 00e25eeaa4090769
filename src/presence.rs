// Provider availability over the status hub
// The local status only changes when the server says so, never on the local request

use log::{debug, error, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, STATUS_HUB};
use crate::error::{ClientError, Result};
use crate::hub::{self, ConnectionState, HubConnection, HubEvent, Invocation, Transport, WebSocketTransport};
use crate::models::AvailabilityStatus;
use crate::session::{notify, Liveness, UPDATE_CHANNEL_CAPACITY};

// Hub methods
pub const GET_STATUS: &str = "GetStatus";
pub const UPDATE_STATUS: &str = "UpdateStatus";

// Hub events
pub const RECEIVE_CURRENT_STATUS: &str = "ReceiveCurrentStatus";
pub const RECEIVE_STATUS_UPDATE: &str = "ReceiveStatusUpdate";

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// Answer to `GetStatus` for the tracked user.
    CurrentStatus(AvailabilityStatus),
    /// Broadcast after any provider changed status.
    StatusUpdate {
        provider_id: String,
        status: AvailabilityStatus,
    },
}

impl PresenceEvent {
    pub fn decode(invocation: &Invocation) -> Result<Option<Self>> {
        let target = invocation.target.as_str();
        let event = if target.eq_ignore_ascii_case(RECEIVE_CURRENT_STATUS) {
            PresenceEvent::CurrentStatus(hub::argument(invocation, 0)?)
        } else if target.eq_ignore_ascii_case(RECEIVE_STATUS_UPDATE) {
            let provider_id: serde_json::Value = invocation.argument(0).clone();
            let provider_id = match provider_id {
                serde_json::Value::String(id) => id,
                serde_json::Value::Number(id) => id.to_string(),
                other => {
                    return Err(ClientError::InvalidPayload(format!(
                        "argument 0 of '{}': expected a provider id, got {}",
                        invocation.target, other
                    )))
                }
            };
            PresenceEvent::StatusUpdate {
                provider_id,
                status: hub::argument(invocation, 1)?,
            }
        } else {
            return Ok(None);
        };
        Ok(Some(event))
    }
}

/// Best effort like the other session updates; [`PresenceChannel::status`]
/// holds the current value.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceUpdate {
    Connection(ConnectionState),
    /// The tracked user's status changed.
    Status(AvailabilityStatus),
    /// Another provider's status was broadcast.
    ProviderStatus {
        provider_id: String,
        status: AvailabilityStatus,
    },
    Error(Option<String>),
}

#[derive(Debug, Clone, Default)]
pub struct PresenceState {
    tracked_user: Option<String>,
    status: Option<AvailabilityStatus>,
    providers: HashMap<String, AvailabilityStatus>,
    error: Option<String>,
}

impl PresenceState {
    pub fn new(tracked_user: Option<String>) -> Self {
        Self {
            tracked_user,
            ..Self::default()
        }
    }

    pub fn apply(&mut self, event: PresenceEvent) -> PresenceUpdate {
        match event {
            PresenceEvent::CurrentStatus(status) => {
                self.status = Some(status);
                if let Some(user) = &self.tracked_user {
                    self.providers.insert(user.clone(), status);
                }
                PresenceUpdate::Status(status)
            }
            PresenceEvent::StatusUpdate { provider_id, status } => {
                self.providers.insert(provider_id.clone(), status);
                if self.tracked_user.as_deref() == Some(provider_id.as_str()) {
                    self.status = Some(status);
                    PresenceUpdate::Status(status)
                } else {
                    PresenceUpdate::ProviderStatus { provider_id, status }
                }
            }
        }
    }

    pub fn status(&self) -> Option<AvailabilityStatus> {
        self.status
    }

    pub fn status_of(&self, provider_id: &str) -> Option<AvailabilityStatus> {
        self.providers.get(provider_id).copied()
    }

    pub fn tracked_user(&self) -> Option<&str> {
        self.tracked_user.as_deref()
    }
}

/// Availability of one user (the signed-in provider, or a provider being viewed)
/// over its own status hub connection.
pub struct PresenceChannel {
    connection: Arc<HubConnection>,
    user_id: Option<String>,
    state: Arc<TokioMutex<PresenceState>>,
    updates: mpsc::Sender<PresenceUpdate>,
    alive: Liveness,
    pump: JoinHandle<()>,
}

impl PresenceChannel {
    /// Track the configured user's own status over WebSocket.
    pub fn connect(config: &ClientConfig) -> Result<(Self, mpsc::Receiver<PresenceUpdate>)> {
        Self::open(config, Arc::new(WebSocketTransport::new()))
    }

    /// Track the configured user's own status.
    pub fn open(config: &ClientConfig, transport: Arc<dyn Transport>) -> Result<(Self, mpsc::Receiver<PresenceUpdate>)> {
        let tracked = config.user_id().map(str::to_string);
        Self::start(config, transport, tracked)
    }

    /// Track another provider's status, e.g. on their profile page.
    pub fn watch(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        provider_id: &str,
    ) -> Result<(Self, mpsc::Receiver<PresenceUpdate>)> {
        Self::start(config, transport, Some(provider_id.to_string()))
    }

    fn start(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        tracked: Option<String>,
    ) -> Result<(Self, mpsc::Receiver<PresenceUpdate>)> {
        let url = config.hub_url(STATUS_HUB)?;
        let (connection, events) = HubConnection::open(
            url,
            &[RECEIVE_CURRENT_STATUS, RECEIVE_STATUS_UPDATE],
            config.connection.clone(),
            transport,
        );
        let connection = Arc::new(connection);

        if tracked.is_none() {
            warn!("Presence channel opened without a user; status will stay unknown");
        }

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let state = Arc::new(TokioMutex::new(PresenceState::new(tracked)));
        let alive = Liveness::new();
        let pump = tokio::spawn(run_pump(
            events,
            connection.clone(),
            state.clone(),
            alive.clone(),
            updates_tx.clone(),
        ));

        Ok((Self {
            connection,
            user_id: config.user_id().map(str::to_string),
            state,
            updates: updates_tx,
            alive,
            pump,
        }, updates_rx))
    }

    /// Ask for a user's current status; the answer arrives as `ReceiveCurrentStatus`.
    /// Issued automatically for the tracked user on every (re)connect.
    pub fn get_status(&self, user_id: &str) -> Result<()> {
        self.connection.send(GET_STATUS, vec![json!(user_id)])
    }

    /// Ask the server to change the signed-in user's status.
    ///
    /// The local status is left alone; it follows the `ReceiveStatusUpdate`
    /// broadcast the server sends back, and stays stale if none arrives.
    pub async fn update_status(&self, status: AvailabilityStatus) -> Result<()> {
        let result = self.try_update(status).await;

        let mut state = self.state.lock().await;
        if self.alive.is_alive() {
            let error = result.as_ref().err().map(|e| e.to_string());
            if let Some(error) = &error {
                warn!("Status update to {} failed: {}", status, error);
            }
            if state.error != error {
                state.error = error.clone();
                notify(&self.updates, PresenceUpdate::Error(error));
            }
        }
        result
    }

    async fn try_update(&self, status: AvailabilityStatus) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(ClientError::NotReady);
        }
        let user_id = self.user_id.as_deref().ok_or(ClientError::MissingUser)?;
        info!("Requesting status change for {} to {}", user_id, status);
        self.connection
            .invoke(UPDATE_STATUS, vec![json!(user_id), json!(status)])
            .await
            .map(|_| ())
    }

    pub async fn status(&self) -> Option<AvailabilityStatus> {
        self.state.lock().await.status()
    }

    pub async fn status_of(&self, provider_id: &str) -> Option<AvailabilityStatus> {
        self.state.lock().await.status_of(provider_id)
    }

    pub async fn error(&self) -> Option<String> {
        self.state.lock().await.error.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// False while status changes cannot be sent.
    pub fn updates_available(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn close(&self) {
        if self.alive.end() {
            self.pump.abort();
            self.connection.close();
        }
    }
}

impl Drop for PresenceChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_pump(
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    connection: Arc<HubConnection>,
    state: Arc<TokioMutex<PresenceState>>,
    alive: Liveness,
    updates: mpsc::Sender<PresenceUpdate>,
) {
    while let Some(event) = events.recv().await {
        if !alive.is_alive() {
            break;
        }
        match event {
            HubEvent::StateChanged { previous, current } => {
                notify(&updates, PresenceUpdate::Connection(current));
                if current == ConnectionState::Connected {
                    if previous == ConnectionState::Reconnecting {
                        info!("Status hub reconnected, resynchronizing");
                    }
                    request_status(&connection, &state).await;
                }
            }
            HubEvent::Invocation(invocation) => match PresenceEvent::decode(&invocation) {
                Ok(Some(presence_event)) => {
                    let mut state = state.lock().await;
                    if !alive.is_alive() {
                        break;
                    }
                    let update = state.apply(presence_event);
                    notify(&updates, update);
                }
                Ok(None) => debug!("Presence channel ignoring '{}'", invocation.target),
                Err(e) => warn!("Dropping presence event: {}", e),
            },
        }
    }
    debug!("Presence event pump stopped");
}

async fn request_status(connection: &HubConnection, state: &TokioMutex<PresenceState>) {
    let tracked = state.lock().await.tracked_user().map(str::to_string);
    let Some(user_id) = tracked else {
        debug!("No tracked user, skipping status request");
        return;
    };
    if let Err(e) = connection.send(GET_STATUS, vec![json!(user_id)]) {
        error!("Failed to request status for {}: {}", user_id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_status_sets_local_value() {
        let mut state = PresenceState::new(Some("42".to_string()));
        assert_eq!(state.status(), None);

        let update = state.apply(PresenceEvent::CurrentStatus(AvailabilityStatus::Busy));
        assert_eq!(update, PresenceUpdate::Status(AvailabilityStatus::Busy));
        assert_eq!(state.status(), Some(AvailabilityStatus::Busy));
        assert_eq!(state.status_of("42"), Some(AvailabilityStatus::Busy));
    }

    #[test]
    fn test_broadcast_for_other_provider_leaves_own_status() {
        let mut state = PresenceState::new(Some("42".to_string()));
        state.apply(PresenceEvent::CurrentStatus(AvailabilityStatus::Available));

        let update = state.apply(PresenceEvent::StatusUpdate {
            provider_id: "7".to_string(),
            status: AvailabilityStatus::Away,
        });
        assert_eq!(update, PresenceUpdate::ProviderStatus {
            provider_id: "7".to_string(),
            status: AvailabilityStatus::Away,
        });
        assert_eq!(state.status(), Some(AvailabilityStatus::Available));
        assert_eq!(state.status_of("7"), Some(AvailabilityStatus::Away));
    }

    #[test]
    fn test_broadcast_for_tracked_user_applies() {
        let mut state = PresenceState::new(Some("42".to_string()));
        state.apply(PresenceEvent::StatusUpdate {
            provider_id: "42".to_string(),
            status: AvailabilityStatus::Offline,
        });
        assert_eq!(state.status(), Some(AvailabilityStatus::Offline));
    }

    #[test]
    fn test_decode_presence_events() {
        let event = PresenceEvent::decode(&Invocation::new(RECEIVE_STATUS_UPDATE, vec![json!(42), json!(1)])).unwrap();
        assert_eq!(event, Some(PresenceEvent::StatusUpdate {
            provider_id: "42".to_string(),
            status: AvailabilityStatus::Busy,
        }));

        let event = PresenceEvent::decode(&Invocation::new(RECEIVE_CURRENT_STATUS, vec![json!("Away")])).unwrap();
        assert_eq!(event, Some(PresenceEvent::CurrentStatus(AvailabilityStatus::Away)));

        let bad = PresenceEvent::decode(&Invocation::new(RECEIVE_STATUS_UPDATE, vec![json!(null), json!("Away")]));
        assert!(matches!(bad, Err(ClientError::InvalidPayload(_))));

        let bad_status = PresenceEvent::decode(&Invocation::new(RECEIVE_CURRENT_STATUS, vec![json!("Napping")]));
        assert!(matches!(bad_status, Err(ClientError::InvalidPayload(_))));
    }
}
