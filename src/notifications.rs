// Notification feed over the notification hub
// Stored backlog merged with live events, newest live items first

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::{BackendApi, RestClient};
use crate::config::{ClientConfig, NOTIFICATION_HUB};
use crate::error::{ClientError, Result};
use crate::hub::{self, ConnectionState, HubConnection, HubEvent, Invocation, Transport, WebSocketTransport};
use crate::models::{BookingStatus, Notification, NotificationKind, NotificationStatus};
use crate::session::{notify, Liveness, UPDATE_CHANNEL_CAPACITY};

// Hub events
pub const RECEIVE_NOTIFICATION: &str = "ReceiveNotification";

/// Fixed delay between attempts while the first connection keeps failing.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(5);

const DEFAULT_MESSAGE: &str = "You have a new notification";

/// Human-readable text for a notification that arrived without one.
pub fn describe_notification(
    kind: Option<&NotificationKind>,
    booking_status: Option<&BookingStatus>,
    booking_id: Option<&str>,
) -> String {
    let booking = booking_id.map(|id| format!(" #{}", id)).unwrap_or_default();
    match kind {
        Some(NotificationKind::NewBooking) => "You have a new booking for your service".to_string(),
        Some(NotificationKind::NewReview) => "A new review has been added for your service".to_string(),
        Some(NotificationKind::BookingStatusChange) => match booking_status {
            Some(BookingStatus::Approved) => format!("Your booking{} has been approved", booking),
            Some(BookingStatus::Rejected) => format!("Your booking{} has been rejected", booking),
            Some(BookingStatus::Completed) => format!("Your booking{} has been completed", booking),
            Some(BookingStatus::Confirmed) => format!("Your booking{} has been confirmed", booking),
            Some(BookingStatus::Pending) => format!("Your booking{} is pending", booking),
            Some(BookingStatus::Other(_)) | None => DEFAULT_MESSAGE.to_string(),
        },
        Some(NotificationKind::PaymentStatusChange) => match booking_id {
            Some(id) => format!("Payment for booking #{} has been processed successfully", id),
            None => "Payment has been processed successfully".to_string(),
        },
        Some(NotificationKind::NewMessage) => "You have a new message".to_string(),
        Some(NotificationKind::Other(_)) | None => DEFAULT_MESSAGE.to_string(),
    }
}

pub fn icon_for(kind: Option<&NotificationKind>) -> &'static str {
    match kind {
        Some(NotificationKind::NewBooking) => "calendar",
        Some(NotificationKind::NewReview) => "star",
        Some(NotificationKind::BookingStatusChange) => "clipboard-check",
        Some(NotificationKind::PaymentStatusChange) => "credit-card",
        Some(NotificationKind::NewMessage) => "message",
        Some(NotificationKind::Other(_)) | None => "bell",
    }
}

/// Payload of a live `ReceiveNotification(message, bookingId?, type?, bookingStatus?)`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveNotification {
    pub message: Option<String>,
    pub booking_id: Option<String>,
    pub kind: Option<NotificationKind>,
    pub booking_status: Option<BookingStatus>,
}

impl LiveNotification {
    pub fn decode(invocation: &Invocation) -> Result<Option<Self>> {
        if !invocation.target.eq_ignore_ascii_case(RECEIVE_NOTIFICATION) {
            return Ok(None);
        }
        let message: Option<String> = hub::argument(invocation, 0)?;
        let booking_id = match invocation.argument(1) {
            Value::Null => None,
            Value::String(id) if id.is_empty() => None,
            Value::String(id) => Some(id.clone()),
            Value::Number(id) => Some(id.to_string()),
            other => {
                return Err(ClientError::InvalidPayload(format!(
                    "argument 1 of '{}': expected a booking id, got {}",
                    invocation.target, other
                )))
            }
        };
        let kind: Option<NotificationKind> = hub::argument(invocation, 2)?;
        let booking_status: Option<BookingStatus> = hub::argument(invocation, 3)?;

        Ok(Some(Self {
            message: message.filter(|m| !m.trim().is_empty()),
            booking_id,
            kind: kind.filter(|k| !k.name().is_empty()),
            booking_status: booking_status.filter(|s| !s.name().is_empty()),
        }))
    }

    /// Build the feed item: fresh id, unread, dated now.
    pub fn into_notification(self) -> Notification {
        let message = self.message.unwrap_or_else(|| {
            describe_notification(self.kind.as_ref(), self.booking_status.as_ref(), self.booking_id.as_deref())
        });
        Notification {
            id: Uuid::new_v4().to_string(),
            message,
            date: Utc::now(),
            status: NotificationStatus::NotRead,
            icon: icon_for(self.kind.as_ref()).to_string(),
            kind: self.kind,
            booking_id: self.booking_id,
            booking_status: self.booking_status,
        }
    }
}

/// Fill in the derived fields of a stored notification.
fn normalize(mut notification: Notification) -> Notification {
    if notification.message.trim().is_empty() {
        notification.message = describe_notification(
            notification.kind.as_ref(),
            notification.booking_status.as_ref(),
            notification.booking_id.as_deref(),
        );
    }
    if notification.icon.is_empty() {
        notification.icon = icon_for(notification.kind.as_ref()).to_string();
    }
    notification
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl From<ConnectionState> for FeedStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting | ConnectionState::Reconnecting => FeedStatus::Connecting,
            ConnectionState::Connected => FeedStatus::Connected,
            ConnectionState::Disconnected => FeedStatus::Disconnected,
        }
    }
}

/// Feed changes for the UI. Dropped rather than queued past
/// the channel capacity (100); re-read [`NotificationFeed::notifications`]
/// after falling behind.
#[derive(Debug, Clone, PartialEq)]
pub enum NotificationUpdate {
    Status(FeedStatus),
    /// Backlog merged in; carries how many stored items were added.
    BacklogMerged(usize),
    Received(Notification),
}

#[derive(Debug, Clone, Default)]
pub struct NotificationState {
    notifications: Vec<Notification>,
}

impl NotificationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored items go first in server order, followed by anything that
    /// arrived live before the backlog did.
    pub fn merge_backlog(&mut self, fetched: Vec<Notification>) -> usize {
        let added = fetched.len();
        let mut merged: Vec<Notification> = fetched.into_iter().map(normalize).collect();
        merged.append(&mut self.notifications);
        self.notifications = merged;
        added
    }

    pub fn push_live(&mut self, notification: Notification) {
        self.notifications.insert(0, notification);
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    pub fn unread_count(&self) -> usize {
        self.notifications.iter().filter(|n| n.is_unread()).count()
    }
}

pub struct NotificationFeed {
    connection: HubConnection,
    state: Arc<TokioMutex<NotificationState>>,
    alive: Liveness,
    pump: JoinHandle<()>,
    backlog: Option<JoinHandle<()>>,
}

impl NotificationFeed {
    pub fn connect(config: &ClientConfig) -> Result<(Self, mpsc::Receiver<NotificationUpdate>)> {
        let api = RestClient::new(config)?;
        Self::open(config, Arc::new(WebSocketTransport::new()), Arc::new(api))
    }

    /// Start the hub connection and, when a user is configured, the backlog fetch.
    /// Neither blocks the other.
    pub fn open(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn BackendApi>,
    ) -> Result<(Self, mpsc::Receiver<NotificationUpdate>)> {
        let url = config.hub_url(NOTIFICATION_HUB)?;
        let options = config.connection.clone().with_initial_retry(INITIAL_RETRY_DELAY);
        let (connection, events) = HubConnection::open(url, &[RECEIVE_NOTIFICATION], options, transport);

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let state = Arc::new(TokioMutex::new(NotificationState::new()));
        let alive = Liveness::new();
        let pump = tokio::spawn(run_pump(events, state.clone(), alive.clone(), updates_tx.clone()));

        let backlog = match config.user_id() {
            Some(user_id) => Some(tokio::spawn(fetch_backlog(
                api,
                user_id.to_string(),
                state.clone(),
                alive.clone(),
                updates_tx,
            ))),
            None => {
                warn!("Notification feed opened without a user; skipping stored notifications");
                None
            }
        };

        Ok((Self {
            connection,
            state,
            alive,
            pump,
            backlog,
        }, updates_rx))
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.lock().await.notifications().to_vec()
    }

    pub async fn unread_count(&self) -> usize {
        self.state.lock().await.unread_count()
    }

    pub async fn mark_as_read(&self, notification_id: &str) -> Result<()> {
        // TODO: call the notification read endpoint once the backend exposes one; until then the unread count stays unchanged
        debug!("Mark as read requested for notification {}", notification_id);
        Ok(())
    }

    pub fn connection_status(&self) -> FeedStatus {
        self.connection.state().into()
    }

    pub fn close(&self) {
        if self.alive.end() {
            self.pump.abort();
            if let Some(backlog) = &self.backlog {
                backlog.abort();
            }
            self.connection.close();
        }
    }
}

impl Drop for NotificationFeed {
    fn drop(&mut self) {
        self.close();
    }
}

async fn fetch_backlog(
    api: Arc<dyn BackendApi>,
    user_id: String,
    state: Arc<TokioMutex<NotificationState>>,
    alive: Liveness,
    updates: mpsc::Sender<NotificationUpdate>,
) {
    match api.notification_backlog(&user_id).await {
        Ok(fetched) => {
            let mut state = state.lock().await;
            if !alive.is_alive() {
                return;
            }
            let added = state.merge_backlog(fetched);
            info!("Merged {} stored notifications", added);
            notify(&updates, NotificationUpdate::BacklogMerged(added));
        }
        Err(e) => warn!("Failed to load stored notifications for {}: {}", user_id, e),
    }
}

async fn run_pump(
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    state: Arc<TokioMutex<NotificationState>>,
    alive: Liveness,
    updates: mpsc::Sender<NotificationUpdate>,
) {
    while let Some(event) = events.recv().await {
        if !alive.is_alive() {
            break;
        }
        match event {
            HubEvent::StateChanged { previous, current } => {
                let (before, after) = (FeedStatus::from(previous), FeedStatus::from(current));
                if before != after {
                    notify(&updates, NotificationUpdate::Status(after));
                }
            }
            HubEvent::Invocation(invocation) => match LiveNotification::decode(&invocation) {
                Ok(Some(live)) => {
                    let notification = live.into_notification();
                    let mut state = state.lock().await;
                    if !alive.is_alive() {
                        break;
                    }
                    debug!("Notification received: {}", notification.message);
                    state.push_live(notification.clone());
                    notify(&updates, NotificationUpdate::Received(notification));
                }
                Ok(None) => debug!("Notification feed ignoring '{}'", invocation.target),
                Err(e) => warn!("Dropping notification: {}", e),
            },
        }
    }
    debug!("Notification pump stopped");
}
