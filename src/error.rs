use thiserror::Error;

/// Errors surfaced by the hub connection, the REST client and the sessions built on them.
#[derive(Debug, Error)]
pub enum ClientError {
    /// An invocation was attempted while the connection was not in the connected state.
    #[error("hub connection is not connected")]
    NotConnected,

    /// A presence update was attempted before the connection was ready.
    #[error("status updates are unavailable until the hub connection is ready")]
    NotReady,

    /// The operation needs an identity and none was configured.
    #[error("no user identity is configured")]
    MissingUser,

    /// The chat history read answered with a non-success status.
    #[error("failed to load history: HTTP {status}")]
    HistoryLoad { status: u16 },

    /// The stored notifications read answered with a non-success status.
    #[error("failed to load notifications: HTTP {status}")]
    BacklogLoad { status: u16 },

    /// The server rejected an invocation.
    #[error("hub invocation failed: {0}")]
    SendFailed(String),

    /// The link was lost while an invocation was waiting for its completion.
    #[error("hub connection closed before the invocation completed")]
    ConnectionClosed,

    #[error("hub handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// An inbound event whose arguments do not match the expected shape.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;
