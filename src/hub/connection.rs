// Hub connection management
// Owns one link to a named hub: connect, handshake, keep-alive, reconnect and dispatch

use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::ConnectionOptions;
use crate::error::{ClientError, Result};
use super::protocol::{self, HubMessage, Invocation, RecordBuffer};
use super::transport::{redact, Link, Transport};

/// Lifecycle of a hub connection. Observed by consumers, only changed by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Everything a consumer learns from its connection, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    Invocation(Invocation),
}

impl HubEvent {
    /// True for the `Reconnecting -> Connected` transition.
    pub fn is_reconnected(&self) -> bool {
        matches!(
            self,
            HubEvent::StateChanged {
                previous: ConnectionState::Reconnecting,
                current: ConnectionState::Connected,
            }
        )
    }
}

enum Command {
    Invoke {
        invocation: Invocation,
        reply: Option<oneshot::Sender<Result<Value>>>,
    },
    Close,
}

/// Client side of one hub. Dropping it closes the connection.
pub struct HubConnection {
    url: String,
    state_rx: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
    targets: Arc<RwLock<HashSet<String>>>,
    closed: AtomicBool,
    driver: JoinHandle<()>,
}

impl HubConnection {
    /// Start connecting in the background and return immediately, together with
    /// the receiver for this connection's events. `targets` are registered before
    /// the first connection attempt. Must be called inside a Tokio runtime.
    pub fn open(
        url: impl Into<String>,
        targets: &[&str],
        options: ConnectionOptions,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<HubEvent>) {
        let url = url.into();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let targets: HashSet<String> = targets.iter().map(|target| target.to_ascii_lowercase()).collect();
        let targets = Arc::new(RwLock::new(targets));

        let driver = Driver {
            url: url.clone(),
            options,
            transport,
            state_tx,
            events: event_tx,
            targets: targets.clone(),
            commands: command_rx,
            pending: HashMap::new(),
            next_invocation_id: 0,
        };
        let driver = tokio::spawn(driver.run());

        (Self {
            url,
            state_rx,
            commands: command_tx,
            targets,
            closed: AtomicBool::new(false),
            driver,
        }, event_rx)
    }

    /// Register interest in an inbound target after opening. Registering the same
    /// name twice keeps a single registration. Names match case-insensitively.
    pub fn on(&self, target: &str) {
        match self.targets.write() {
            Ok(mut targets) => {
                if !targets.insert(target.to_ascii_lowercase()) {
                    debug!("Target '{}' already registered", target);
                }
            }
            Err(_) => error!("Failed to lock hub target registry"),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Invoke a hub method and wait for its completion.
    ///
    /// Not queued: fails with [`ClientError::NotConnected`] unless the connection
    /// is currently connected. There is no timeout.
    pub async fn invoke(&self, target: &str, arguments: Vec<Value>) -> Result<Value> {
        self.ensure_connected()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Invoke {
                invocation: Invocation::new(target, arguments),
                reply: Some(reply_tx),
            })
            .map_err(|_| ClientError::NotConnected)?;
        reply_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Fire-and-forget invocation; the server sends no completion.
    pub fn send(&self, target: &str, arguments: Vec<Value>) -> Result<()> {
        self.ensure_connected()?;
        self.commands
            .send(Command::Invoke {
                invocation: Invocation::new(target, arguments),
                reply: None,
            })
            .map_err(|_| ClientError::NotConnected)
    }

    /// Release the connection. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing hub connection to {}", redact(&self.url));
        if self.commands.send(Command::Close).is_err() {
            debug!("Hub driver for {} already stopped", redact(&self.url));
        }
    }

    /// Wait until the driver has released the link. Only meaningful after `close`.
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        while !self.driver.is_finished() {
            if state_rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct Established {
    link: Box<dyn Link>,
    buffer: RecordBuffer,
    leftover: Vec<String>,
}

enum LinkOutcome {
    Closed,
    Lost { allow_reconnect: bool },
}

struct Driver {
    url: String,
    options: ConnectionOptions,
    transport: Arc<dyn Transport>,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<HubEvent>,
    targets: Arc<RwLock<HashSet<String>>>,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: HashMap<String, oneshot::Sender<Result<Value>>>,
    next_invocation_id: u64,
}

impl Driver {
    async fn run(mut self) {
        self.drive().await;
        self.fail_pending();
        self.set_state(ConnectionState::Disconnected);
        debug!("Hub driver for {} stopped", redact(&self.url));
    }

    async fn drive(&mut self) {
        let mut established = match self.connect_initial().await {
            Some(established) => established,
            None => return,
        };

        loop {
            self.set_state(ConnectionState::Connected);
            match self.serve(established).await {
                LinkOutcome::Closed => return,
                LinkOutcome::Lost { allow_reconnect } => {
                    self.fail_pending();
                    if !allow_reconnect {
                        info!("Server closed {} without allowing reconnection", redact(&self.url));
                        self.set_state(ConnectionState::Disconnected);
                        self.wait_for_close().await;
                        return;
                    }
                    self.set_state(ConnectionState::Reconnecting);
                    established = match self.reconnect().await {
                        Ok(Some(established)) => established,
                        Ok(None) => {
                            error!("Giving up reconnecting to {}", redact(&self.url));
                            self.set_state(ConnectionState::Disconnected);
                            self.wait_for_close().await;
                            return;
                        }
                        Err(()) => return,
                    };
                }
            }
        }
    }

    /// First connection. Without an initial retry delay a failure leaves the
    /// connection disconnected until it is closed.
    async fn connect_initial(&mut self) -> Option<Established> {
        loop {
            self.set_state(ConnectionState::Connecting);
            match self.establish().await? {
                Ok(established) => return Some(established),
                Err(e) => {
                    error!("Failed to connect to {}: {}", redact(&self.url), e);
                    self.set_state(ConnectionState::Disconnected);
                    match self.options.initial_retry_delay() {
                        Some(delay) => {
                            info!("Retrying connection to {} in {:?}", redact(&self.url), delay);
                            self.guarded(time::sleep(delay)).await?;
                        }
                        None => {
                            self.wait_for_close().await;
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// `Ok(None)` when the delay schedule is exhausted, `Err(())` when closed meanwhile.
    async fn reconnect(&mut self) -> std::result::Result<Option<Established>, ()> {
        let delays: Vec<Duration> = self.options.reconnect_delays().collect();
        for (attempt, delay) in delays.iter().enumerate() {
            info!("Reconnecting to {} (attempt {}/{}) in {:?}", redact(&self.url), attempt + 1, delays.len(), delay);
            self.guarded(time::sleep(*delay)).await.ok_or(())?;
            match self.establish().await.ok_or(())? {
                Ok(established) => {
                    info!("Reconnected to {}", redact(&self.url));
                    return Ok(Some(established));
                }
                Err(e) => warn!("Reconnect attempt {} to {} failed: {}", attempt + 1, redact(&self.url), e),
            }
        }
        Ok(None)
    }

    /// Connect and handshake; `None` if a close was requested meanwhile.
    async fn establish(&mut self) -> Option<Result<Established>> {
        let transport = self.transport.clone();
        let url = self.url.clone();
        let handshake_timeout = self.options.handshake_timeout();
        self.guarded(async move {
            match time::timeout(handshake_timeout, handshake(transport.as_ref(), &url)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Handshake(format!("timed out after {:?}", handshake_timeout))),
            }
        })
        .await
    }

    /// Exchange records over an established link until it closes or is lost.
    async fn serve(&mut self, established: Established) -> LinkOutcome {
        let Established { mut link, mut buffer, leftover } = established;

        for record in leftover {
            if let Some(outcome) = self.handle_record(&record) {
                link.close().await;
                return outcome;
            }
        }

        let keep_alive = effective(self.options.keep_alive_interval());
        let server_timeout = effective(self.options.server_timeout());
        let mut ping = time::interval_at(Instant::now() + keep_alive, keep_alive);
        let mut last_received = Instant::now();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Invoke { mut invocation, reply }) => {
                        if let Some(reply) = reply {
                            self.next_invocation_id += 1;
                            let id = self.next_invocation_id.to_string();
                            invocation.invocation_id = Some(id.clone());
                            self.pending.insert(id, reply);
                        }
                        let target = invocation.target.clone();
                        match HubMessage::Invocation(invocation).encode() {
                            Ok(record) => {
                                debug!("Invoking '{}' on {}", target, redact(&self.url));
                                if let Err(e) = link.send(record).await {
                                    warn!("Failed to send invocation '{}': {}", target, e);
                                    return LinkOutcome::Lost { allow_reconnect: true };
                                }
                            }
                            Err(e) => error!("Failed to encode invocation '{}': {}", target, e),
                        }
                    }
                    Some(Command::Close) | None => {
                        link.close().await;
                        return LinkOutcome::Closed;
                    }
                },
                frame = link.recv() => match frame {
                    Some(Ok(text)) => {
                        last_received = Instant::now();
                        let records = match buffer.push(&text) {
                            Ok(records) => records,
                            Err(e) => {
                                warn!("Dropping link to {}: {}", redact(&self.url), e);
                                link.close().await;
                                return LinkOutcome::Lost { allow_reconnect: true };
                            }
                        };
                        for record in records {
                            if let Some(outcome) = self.handle_record(&record) {
                                link.close().await;
                                return outcome;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Link to {} failed: {}", redact(&self.url), e);
                        return LinkOutcome::Lost { allow_reconnect: true };
                    }
                    None => {
                        warn!("Link to {} closed by the server", redact(&self.url));
                        return LinkOutcome::Lost { allow_reconnect: true };
                    }
                },
                _ = ping.tick() => {
                    let record = match HubMessage::Ping.encode() {
                        Ok(record) => record,
                        Err(e) => {
                            error!("Failed to encode ping: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = link.send(record).await {
                        warn!("Keep-alive to {} failed: {}", redact(&self.url), e);
                        return LinkOutcome::Lost { allow_reconnect: true };
                    }
                },
                _ = time::sleep_until(last_received + server_timeout) => {
                    warn!("No data from {} for {:?}, dropping link", redact(&self.url), server_timeout);
                    link.close().await;
                    return LinkOutcome::Lost { allow_reconnect: true };
                }
            }
        }
    }

    fn handle_record(&mut self, record: &str) -> Option<LinkOutcome> {
        match HubMessage::decode(record) {
            Ok(HubMessage::Invocation(invocation)) => self.dispatch(invocation),
            Ok(HubMessage::Completion(completion)) => match self.pending.remove(&completion.invocation_id) {
                Some(reply) => {
                    let result = match completion.error {
                        Some(error) => Err(ClientError::SendFailed(error)),
                        None => Ok(completion.result.unwrap_or(Value::Null)),
                    };
                    // The caller may have given up waiting
                    let _ = reply.send(result);
                }
                None => debug!("Completion for unknown invocation {}", completion.invocation_id),
            },
            Ok(HubMessage::Ping) => {}
            Ok(HubMessage::Close(info)) => {
                if let Some(error) = &info.error {
                    warn!("Server closed {} with error: {}", redact(&self.url), error);
                }
                return Some(LinkOutcome::Lost {
                    allow_reconnect: info.allow_reconnect.unwrap_or(false),
                });
            }
            Ok(HubMessage::Unsupported(kind)) => debug!("Ignoring record type {}", kind),
            Err(e) => warn!("Dropping malformed record from {}: {}", redact(&self.url), e),
        }
        None
    }

    fn dispatch(&self, invocation: Invocation) {
        let registered = match self.targets.read() {
            Ok(targets) => targets.contains(&invocation.target.to_ascii_lowercase()),
            Err(_) => {
                error!("Failed to lock hub target registry");
                false
            }
        };
        if !registered {
            warn!("No handler registered for '{}' on {}", invocation.target, redact(&self.url));
            return;
        }
        if self.events.send(HubEvent::Invocation(invocation)).is_err() {
            debug!("Event receiver for {} dropped", redact(&self.url));
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous == next {
            return;
        }
        info!("Hub {} {:?} -> {:?}", redact(&self.url), previous, next);
        let _ = self.events.send(HubEvent::StateChanged {
            previous,
            current: next,
        });
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(ClientError::ConnectionClosed));
        }
    }

    /// Run `fut` while answering commands. `None` if a close was requested first.
    async fn guarded<T>(&mut self, fut: impl Future<Output = T>) -> Option<T> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                command = self.commands.recv() => match command {
                    Some(Command::Invoke { invocation, reply }) => {
                        debug!("Rejecting '{}' while not connected", invocation.target);
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(ClientError::NotConnected));
                        }
                    }
                    Some(Command::Close) | None => return None,
                },
            }
        }
    }

    async fn wait_for_close(&mut self) {
        self.guarded(std::future::pending::<()>()).await;
    }
}

async fn handshake(transport: &dyn Transport, url: &str) -> Result<Established> {
    let mut link = transport.connect(url).await?;
    link.send(protocol::handshake_request()).await?;

    let mut buffer = RecordBuffer::new();
    loop {
        let frame = match link.recv().await {
            Some(frame) => frame?,
            None => return Err(ClientError::Handshake("connection closed during handshake".to_string())),
        };
        let mut records = match buffer.push(&frame) {
            Ok(records) => records.into_iter(),
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };
        if let Some(response) = records.next() {
            if let Err(e) = protocol::parse_handshake_response(&response) {
                link.close().await;
                return Err(e);
            }
            debug!("Handshake with {} complete", redact(url));
            return Ok(Established {
                link,
                buffer,
                leftover: records.collect(),
            });
        }
    }
}

// A zero interval disables the timer
fn effective(interval: Duration) -> Duration {
    if interval.is_zero() {
        Duration::from_secs(60 * 60 * 24 * 365)
    } else {
        interval
    }
}
