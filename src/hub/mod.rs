// Real-time hub client
// Wire protocol, transport seam and the connection driver shared by all sessions

pub mod connection;
pub mod protocol;
pub mod transport;

pub use connection::{ConnectionState, HubConnection, HubEvent};
pub use protocol::Invocation;
pub use transport::{Link, Transport, WebSocketTransport};

use serde::de::DeserializeOwned;

use crate::error::{ClientError, Result};

/// Decode one positional argument of an inbound invocation into a typed value.
pub fn argument<T: DeserializeOwned>(invocation: &Invocation, index: usize) -> Result<T> {
    serde_json::from_value(invocation.argument(index).clone()).map_err(|e| {
        ClientError::InvalidPayload(format!(
            "argument {} of '{}': {}",
            index, invocation.target, e
        ))
    })
}
