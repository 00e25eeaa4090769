// Plumbing shared by the chat, presence and notification sessions

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the update channel each session hands to its UI.
pub const UPDATE_CHANNEL_CAPACITY: usize = 100;

/// Cleared when a session is torn down; checked before every state mutation so
/// events still queued at teardown are discarded.
#[derive(Debug, Clone)]
pub(crate) struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns false if the session was already ended.
    pub(crate) fn end(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Forward an update to the UI without ever blocking the event pump. A full
/// channel drops the update; consumers recover by re-reading session state.
pub(crate) fn notify<T>(updates: &mpsc::Sender<T>, update: T) {
    match updates.try_send(update) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("Update channel full, dropping update"),
        Err(TrySendError::Closed(_)) => debug!("Update receiver dropped"),
    }
}
