// Common test utilities for integration tests
// An in-memory hub transport with a scriptable server side, and a fake REST backend
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use log::{debug, LevelFilter};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;

use hublink::api::BackendApi;
use hublink::error::{ClientError, Result};
use hublink::hub::protocol::{CloseInfo, Completion, HubMessage, Invocation, RecordBuffer};
use hublink::hub::{Link, Transport};
use hublink::{ClientConfig, ConnectionOptions, Identity, Message, Notification, NotificationStatus};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

// Initialize logging once
static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Fast reconnects and no keep-alive traffic.
pub fn test_options() -> ConnectionOptions {
    ConnectionOptions {
        reconnect_delays_ms: vec![0, 0, 0],
        initial_retry_delay_ms: None,
        handshake_timeout_ms: 2_000,
        keep_alive_interval_ms: 0,
        server_timeout_ms: 0,
    }
}

pub fn test_config(user_id: Option<&str>) -> ClientConfig {
    let config = ClientConfig::new("http://api.test", "http://hub.test/hubs").with_connection(test_options());
    match user_id {
        Some(user_id) => config.with_identity(Identity::new(user_id).with_token("test-token")),
        None => config,
    }
}

pub fn message(id: i64, from: &str, to: &str) -> Message {
    Message {
        id,
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        content: format!("message {}", id),
        sent_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, id as u32 % 60).unwrap(),
        is_read: false,
    }
}

pub fn message_json(id: i64, from: &str, to: &str) -> Value {
    serde_json::to_value(message(id, from, to)).unwrap()
}

pub fn stored_notification(id: &str, message: &str, status: NotificationStatus) -> Notification {
    serde_json::from_value(json!({
        "id": id,
        "message": message,
        "date": "2024-05-01T09:00:00",
        "status": status,
        "type": "NewReview",
    }))
    .unwrap()
}

/// Await `future`, failing the test if it takes longer than [`WAIT`].
pub async fn within<F: Future>(what: &str, future: F) -> F::Output {
    match timeout(WAIT, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Receive updates until one matches, returning it.
pub async fn wait_for<T, P>(updates: &mut mpsc::Receiver<T>, what: &str, mut predicate: P) -> T
where
    T: std::fmt::Debug,
    P: FnMut(&T) -> bool,
{
    within(what, async {
        loop {
            match updates.recv().await {
                Some(update) if predicate(&update) => return update,
                Some(update) => debug!("Skipping update while waiting for {}: {:?}", what, update),
                None => panic!("update channel closed while waiting for {}", what),
            }
        }
    })
    .await
}

/// Poll `condition` until it holds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut condition: F) {
    within(what, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

enum Step {
    Accept,
    Fail,
}

/// Transport whose links are wired to [`MockPeer`]s handed out by a [`PeerQueue`].
/// Connection attempts succeed unless a failure has been scripted.
pub struct MockTransport {
    script: Mutex<VecDeque<Step>>,
    peers: mpsc::UnboundedSender<MockPeer>,
    attempts: AtomicUsize,
    urls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, PeerQueue) {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            peers: peers_tx,
            attempts: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
        });
        (transport, PeerQueue { peers: peers_rx })
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: usize) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Step::Fail);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn Link>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Accept);
        match step {
            Step::Fail => Err(ClientError::Transport("connection refused".to_string())),
            Step::Accept => {
                let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
                let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
                let peer = MockPeer {
                    to_client: to_client_tx,
                    from_client: to_server_rx,
                    buffer: RecordBuffer::new(),
                    records: VecDeque::new(),
                };
                self.peers
                    .send(peer)
                    .map_err(|_| ClientError::Transport("test dropped the peer queue".to_string()))?;
                Ok(Box::new(MockLink {
                    to_server: Some(to_server_tx),
                    from_server: to_client_rx,
                }))
            }
        }
    }
}

struct MockLink {
    to_server: Option<mpsc::UnboundedSender<String>>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Link for MockLink {
    async fn send(&mut self, frame: String) -> Result<()> {
        match &self.to_server {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| ClientError::Transport("peer went away".to_string())),
            None => Err(ClientError::Transport("link closed".to_string())),
        }
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.to_server = None;
        self.from_server.close();
    }
}

/// Links opened through a [`MockTransport`], in connection order.
pub struct PeerQueue {
    peers: mpsc::UnboundedReceiver<MockPeer>,
}

impl PeerQueue {
    pub async fn next(&mut self) -> MockPeer {
        within("a connection attempt", self.peers.recv())
            .await
            .expect("transport dropped")
    }

    /// Next connection with the handshake already accepted.
    pub async fn accept(&mut self) -> MockPeer {
        let mut peer = self.next().await;
        peer.accept_handshake().await;
        peer
    }
}

/// Server end of one mock link. Dropping it drops the link.
pub struct MockPeer {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
    buffer: RecordBuffer,
    records: VecDeque<String>,
}

impl MockPeer {
    /// Next record from the client; `None` once the client closed the link.
    pub async fn next_record(&mut self) -> Option<String> {
        loop {
            if let Some(record) = self.records.pop_front() {
                return Some(record);
            }
            let frame = within("a record from the client", self.from_client.recv()).await?;
            self.records.extend(self.buffer.push(&frame).unwrap());
        }
    }

    pub async fn accept_handshake(&mut self) {
        let request = self.next_record().await.expect("client closed before the handshake");
        let request: Value = serde_json::from_str(&request).unwrap();
        assert_eq!(request["protocol"], "json");
        assert_eq!(request["version"], 1);
        self.send_raw("{}\u{1e}");
    }

    pub async fn reject_handshake(&mut self, error: &str) {
        self.next_record().await.expect("client closed before the handshake");
        self.send_raw(&format!("{}\u{1e}", json!({ "error": error })));
    }

    /// Next invocation from the client, skipping pings.
    pub async fn expect_invocation(&mut self, target: &str) -> Invocation {
        loop {
            let record = self.next_record().await.expect("client closed the link");
            match HubMessage::decode(&record).unwrap() {
                HubMessage::Ping => continue,
                HubMessage::Invocation(invocation) => {
                    assert_eq!(invocation.target, target, "unexpected invocation {:?}", invocation);
                    return invocation;
                }
                other => panic!("expected invocation of {}, got {:?}", target, other),
            }
        }
    }

    /// Assert the client sends nothing but pings for `period`.
    pub async fn expect_silence(&mut self, period: Duration) {
        let deadline = tokio::time::Instant::now() + period;
        loop {
            if let Some(record) = self.records.pop_front() {
                match HubMessage::decode(&record).unwrap() {
                    HubMessage::Ping => continue,
                    other => panic!("expected silence, got {:?}", other),
                }
            }
            match tokio::time::timeout_at(deadline, self.from_client.recv()).await {
                Ok(Some(frame)) => {
                    let records = self.buffer.push(&frame).unwrap();
                    self.records.extend(records);
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    pub fn invoke(&self, target: &str, arguments: Vec<Value>) {
        self.send(HubMessage::Invocation(Invocation::new(target, arguments)));
    }

    pub fn complete(&self, invocation: &Invocation, result: Value) {
        self.send(HubMessage::Completion(Completion {
            invocation_id: invocation.invocation_id.clone().expect("invocation expects no completion"),
            result: Some(result),
            error: None,
        }));
    }

    pub fn fail(&self, invocation: &Invocation, error: &str) {
        self.send(HubMessage::Completion(Completion {
            invocation_id: invocation.invocation_id.clone().expect("invocation expects no completion"),
            result: None,
            error: Some(error.to_string()),
        }));
    }

    pub fn close(&self, allow_reconnect: Option<bool>) {
        self.send(HubMessage::Close(CloseInfo {
            error: Some("server shutting down".to_string()),
            allow_reconnect,
        }));
    }

    fn send(&self, message: HubMessage) {
        self.send_raw(&message.encode().unwrap());
    }

    pub fn send_raw(&self, frame: &str) {
        // The client may already have hung up
        let _ = self.to_client.send(frame.to_string());
    }
}

/// In-memory [`BackendApi`].
#[derive(Default)]
pub struct FakeApi {
    pub history: Mutex<Vec<Message>>,
    pub backlog: Mutex<Vec<Notification>>,
    /// HTTP status every request fails with, when set.
    pub failure: Mutex<Option<u16>>,
    /// When set, backlog requests wait for `release_backlog`.
    pub hold_backlog: bool,
    release: Notify,
    pub calls: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn with_history(messages: Vec<Message>) -> Arc<Self> {
        Arc::new(Self {
            history: Mutex::new(messages),
            ..Self::default()
        })
    }

    pub fn with_backlog(notifications: Vec<Notification>, hold_backlog: bool) -> Arc<Self> {
        Arc::new(Self {
            backlog: Mutex::new(notifications),
            hold_backlog,
            ..Self::default()
        })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            failure: Mutex::new(Some(status)),
            ..Self::default()
        })
    }

    pub fn release_backlog(&self) {
        self.release.notify_one();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn failure(&self) -> Option<u16> {
        *self.failure.lock().unwrap()
    }
}

#[async_trait]
impl BackendApi for FakeApi {
    async fn chat_history(&self, self_id: &str, other_id: &str) -> Result<Vec<Message>> {
        self.calls.lock().unwrap().push(format!("history {} {}", self_id, other_id));
        if let Some(status) = self.failure() {
            return Err(ClientError::HistoryLoad { status });
        }
        Ok(self.history.lock().unwrap().clone())
    }

    async fn notification_backlog(&self, user_id: &str) -> Result<Vec<Notification>> {
        self.calls.lock().unwrap().push(format!("backlog {}", user_id));
        if self.hold_backlog {
            self.release.notified().await;
        }
        if let Some(status) = self.failure() {
            return Err(ClientError::BacklogLoad { status });
        }
        Ok(self.backlog.lock().unwrap().clone())
    }
}
