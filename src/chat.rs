// Chat session over the chat hub
// Ordered message log for the active conversation with send, receive and read tracking

use log::{debug, info, warn};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::api::{BackendApi, RestClient};
use crate::config::{ClientConfig, Identity, CHAT_HUB};
use crate::error::{ClientError, Result};
use crate::hub::{self, ConnectionState, HubConnection, HubEvent, Invocation, Transport, WebSocketTransport};
use crate::models::{group_conversations, Conversation, Message};
use crate::session::{notify, Liveness, UPDATE_CHANNEL_CAPACITY};

// Hub methods
pub const SEND_MESSAGE: &str = "SendMessage";
pub const MARK_AS_READ: &str = "MarkAsRead";

// Hub events
pub const RECEIVE_MESSAGE: &str = "ReceiveMessage";
pub const RECEIVE_CHAT_HISTORY: &str = "ReceiveChatHistory";
pub const MESSAGES_MARKED_AS_READ: &str = "MessagesMarkedAsRead";

/// Inbound chat hub events, validated at the connection boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageReceived(Message),
    HistoryReceived(Vec<Message>),
    MarkedAsRead { sender_id: String },
}

impl ChatEvent {
    /// `Ok(None)` for targets this session does not handle.
    pub fn decode(invocation: &Invocation) -> Result<Option<Self>> {
        let target = invocation.target.as_str();
        let event = if target.eq_ignore_ascii_case(RECEIVE_MESSAGE) {
            ChatEvent::MessageReceived(hub::argument(invocation, 0)?)
        } else if target.eq_ignore_ascii_case(RECEIVE_CHAT_HISTORY) {
            ChatEvent::HistoryReceived(hub::argument(invocation, 0)?)
        } else if target.eq_ignore_ascii_case(MESSAGES_MARKED_AS_READ) {
            ChatEvent::MarkedAsRead {
                sender_id: hub::argument(invocation, 0)?,
            }
        } else {
            return Ok(None);
        };
        Ok(Some(event))
    }
}

/// What changed in a chat session, for the UI.
///
/// Delivery is best effort: once 100 updates are waiting, newer ones are
/// dropped. The session state is always complete, so a consumer that falls
/// behind should re-read [`ChatSession::messages`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    Connection(ConnectionState),
    MessageAppended(Message),
    /// The whole list was replaced; carries the new length.
    HistoryReplaced(usize),
    MarkedAsRead { sender_id: String, updated: usize },
    Error(Option<String>),
}

/// Message list plus the last error. Append-only except for wholesale replacement.
#[derive(Debug, Clone, Default)]
pub struct ChatState {
    messages: Vec<Message>,
    error: Option<String>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: ChatEvent) -> ChatUpdate {
        match event {
            ChatEvent::MessageReceived(message) => {
                self.messages.push(message.clone());
                ChatUpdate::MessageAppended(message)
            }
            ChatEvent::HistoryReceived(messages) => self.replace(messages),
            ChatEvent::MarkedAsRead { sender_id } => {
                let updated = self.mark_read_from(&sender_id);
                ChatUpdate::MarkedAsRead { sender_id, updated }
            }
        }
    }

    pub fn replace(&mut self, messages: Vec<Message>) -> ChatUpdate {
        self.messages = messages;
        ChatUpdate::HistoryReplaced(self.messages.len())
    }

    /// Flag every message from `sender_id` as read. Returns how many changed.
    pub fn mark_read_from(&mut self, sender_id: &str) -> usize {
        let mut updated = 0;
        for message in self.messages.iter_mut().filter(|m| m.sender_id == sender_id && !m.is_read) {
            message.is_read = true;
            updated += 1;
        }
        updated
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn unread_from(&self, sender_id: &str) -> usize {
        self.messages
            .iter()
            .filter(|m| m.sender_id == sender_id && !m.is_read)
            .count()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_error(&mut self, error: Option<String>) -> ChatUpdate {
        self.error = error.clone();
        ChatUpdate::Error(error)
    }
}

/// A chat session bound to its own chat hub connection.
///
/// Sent messages are not inserted locally: they show up when the server echoes
/// them back as `ReceiveMessage`.
pub struct ChatSession {
    connection: HubConnection,
    api: Arc<dyn BackendApi>,
    identity: Option<Identity>,
    state: Arc<TokioMutex<ChatState>>,
    updates: mpsc::Sender<ChatUpdate>,
    alive: Liveness,
    pump: JoinHandle<()>,
}

impl ChatSession {
    /// Open a session over WebSocket and HTTP.
    pub fn connect(config: &ClientConfig) -> Result<(Self, mpsc::Receiver<ChatUpdate>)> {
        let api = RestClient::new(config)?;
        Self::open(config, Arc::new(WebSocketTransport::new()), Arc::new(api))
    }

    pub fn open(
        config: &ClientConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn BackendApi>,
    ) -> Result<(Self, mpsc::Receiver<ChatUpdate>)> {
        let url = config.hub_url(CHAT_HUB)?;
        let (connection, events) = HubConnection::open(
            url,
            &[RECEIVE_MESSAGE, RECEIVE_CHAT_HISTORY, MESSAGES_MARKED_AS_READ],
            config.connection.clone(),
            transport,
        );

        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);
        let state = Arc::new(TokioMutex::new(ChatState::new()));
        let alive = Liveness::new();
        let pump = tokio::spawn(run_pump(events, state.clone(), alive.clone(), updates_tx.clone()));

        Ok((Self {
            connection,
            api,
            identity: config.identity.clone(),
            state,
            updates: updates_tx,
            alive,
            pump,
        }, updates_rx))
    }

    /// Fetch the conversation between two users and replace the message list with it.
    /// The new list reaches the UI as a single [`ChatUpdate::HistoryReplaced`].
    pub async fn load_history(&self, self_id: &str, other_id: &str) -> Result<()> {
        info!("Loading chat history between {} and {}", self_id, other_id);
        let result = self.api.chat_history(self_id, other_id).await;

        let mut state = self.state.lock().await;
        if !self.alive.is_alive() {
            return Ok(());
        }
        match result {
            Ok(messages) => {
                notify(&self.updates, state.replace(messages));
                if state.error().is_some() {
                    notify(&self.updates, state.set_error(None));
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to load chat history: {}", e);
                notify(&self.updates, state.set_error(Some(e.to_string())));
                Err(e)
            }
        }
    }

    /// Send a message. Blank content is ignored.
    pub async fn send(&self, receiver_id: &str, content: &str) -> Result<()> {
        if content.trim().is_empty() {
            debug!("Ignoring blank message to {}", receiver_id);
            return Ok(());
        }
        let result = self.try_send(receiver_id, content).await;
        self.record(&result).await;
        result
    }

    async fn try_send(&self, receiver_id: &str, content: &str) -> Result<()> {
        if !self.connection.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let sender_id = self.user_id()?;
        self.connection
            .invoke(SEND_MESSAGE, vec![json!(sender_id), json!(receiver_id), json!(content)])
            .await?;
        debug!("Message to {} accepted by the hub", receiver_id);
        Ok(())
    }

    /// Ask the server to mark everything `counterpart_id` sent us as read. The
    /// local list changes when `MessagesMarkedAsRead` arrives.
    pub async fn mark_as_read(&self, counterpart_id: &str) -> Result<()> {
        let result = async {
            let self_id = self.user_id()?;
            self.connection
                .invoke(MARK_AS_READ, vec![json!(counterpart_id), json!(self_id)])
                .await
                .map(|_| ())
        }
        .await;
        self.record(&result).await;
        result
    }

    async fn record(&self, result: &Result<()>) {
        let mut state = self.state.lock().await;
        if !self.alive.is_alive() {
            return;
        }
        let error = result.as_ref().err().map(|e| e.to_string());
        if let Some(error) = &error {
            warn!("Chat operation failed: {}", error);
        }
        if state.error().map(str::to_string) != error {
            notify(&self.updates, state.set_error(error));
        }
    }

    fn user_id(&self) -> Result<&str> {
        self.identity
            .as_ref()
            .map(|identity| identity.user_id.as_str())
            .ok_or(ClientError::MissingUser)
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.state.lock().await.messages().to_vec()
    }

    pub async fn conversations(&self) -> Result<Vec<Conversation>> {
        let self_id = self.user_id()?;
        Ok(group_conversations(self_id, self.state.lock().await.messages()))
    }

    pub async fn unread_from(&self, sender_id: &str) -> usize {
        self.state.lock().await.unread_from(sender_id)
    }

    pub async fn error(&self) -> Option<String> {
        self.state.lock().await.error().map(str::to_string)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Whether the send affordance should be enabled.
    pub fn can_send(&self) -> bool {
        self.connection.is_connected()
    }

    /// Tear the session down; queued events no longer touch the state.
    pub fn close(&self) {
        if self.alive.end() {
            self.pump.abort();
            self.connection.close();
        }
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_pump(
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    state: Arc<TokioMutex<ChatState>>,
    alive: Liveness,
    updates: mpsc::Sender<ChatUpdate>,
) {
    while let Some(event) = events.recv().await {
        if !alive.is_alive() {
            break;
        }
        match event {
            HubEvent::StateChanged { current, .. } => notify(&updates, ChatUpdate::Connection(current)),
            HubEvent::Invocation(invocation) => match ChatEvent::decode(&invocation) {
                Ok(Some(chat_event)) => {
                    let mut state = state.lock().await;
                    if !alive.is_alive() {
                        break;
                    }
                    let update = state.apply(chat_event);
                    notify(&updates, update);
                }
                Ok(None) => debug!("Chat session ignoring '{}'", invocation.target),
                Err(e) => warn!("Dropping chat event: {}", e),
            },
        }
    }
    debug!("Chat event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(id: i64, from: &str, to: &str) -> Message {
        Message {
            id,
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            content: format!("message {}", id),
            sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            is_read: false,
        }
    }

    #[test]
    fn test_received_messages_append_in_arrival_order() {
        let mut state = ChatState::new();
        state.replace(vec![message(10, "u2", "me")]);

        // Out-of-order ids stay in arrival order
        for id in [3, 1, 2] {
            state.apply(ChatEvent::MessageReceived(message(id, "u2", "me")));
        }

        let ids: Vec<i64> = state.messages().iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![10, 3, 1, 2]);
    }

    #[test]
    fn test_history_event_replaces_list() {
        let mut state = ChatState::new();
        state.apply(ChatEvent::MessageReceived(message(1, "u2", "me")));

        let update = state.apply(ChatEvent::HistoryReceived(vec![message(5, "me", "u2"), message(6, "u2", "me")]));
        assert_eq!(update, ChatUpdate::HistoryReplaced(2));
        assert_eq!(state.messages().iter().map(|m| m.id).collect::<Vec<_>>(), vec![5, 6]);
    }

    #[test]
    fn test_marked_as_read_only_touches_that_sender() {
        let mut state = ChatState::new();
        state.replace(vec![
            message(1, "u2", "me"),
            message(2, "me", "u2"),
            message(3, "u3", "me"),
            message(4, "u2", "me"),
        ]);

        let update = state.apply(ChatEvent::MarkedAsRead { sender_id: "u2".to_string() });
        assert_eq!(update, ChatUpdate::MarkedAsRead { sender_id: "u2".to_string(), updated: 2 });

        let read: Vec<(i64, bool)> = state.messages().iter().map(|m| (m.id, m.is_read)).collect();
        assert_eq!(read, vec![(1, true), (2, false), (3, false), (4, true)]);
        assert_eq!(state.unread_from("u2"), 0);
        assert_eq!(state.unread_from("u3"), 1);
    }

    #[test]
    fn test_decode_chat_events() {
        let payload = json!({
            "id": 9,
            "senderId": "u2",
            "receiverId": "me",
            "content": "hello",
            "sentAt": "2024-05-01T12:00:00Z",
            "isRead": false
        });
        let event = ChatEvent::decode(&Invocation::new("receivemessage", vec![payload])).unwrap();
        assert!(matches!(event, Some(ChatEvent::MessageReceived(m)) if m.id == 9));

        let event = ChatEvent::decode(&Invocation::new(MESSAGES_MARKED_AS_READ, vec![json!("u2")])).unwrap();
        assert_eq!(event, Some(ChatEvent::MarkedAsRead { sender_id: "u2".to_string() }));

        assert_eq!(ChatEvent::decode(&Invocation::new("Typing", vec![])).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        let missing = ChatEvent::decode(&Invocation::new(RECEIVE_MESSAGE, vec![]));
        assert!(matches!(missing, Err(ClientError::InvalidPayload(_))));

        let wrong_shape = ChatEvent::decode(&Invocation::new(RECEIVE_CHAT_HISTORY, vec![json!({"id": 1})]));
        assert!(matches!(wrong_shape, Err(ClientError::InvalidPayload(_))));
    }
}
