// Real-time client state for the marketplace: chat, provider presence and notifications
pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod hub;
pub mod models;
pub mod notifications;
pub mod presence;
mod session;

// Re-export main types for convenience
pub use chat::{ChatSession, ChatUpdate};
pub use config::{ClientConfig, ConnectionOptions, Identity};
pub use error::{ClientError, Result};
pub use hub::{ConnectionState, HubConnection};
pub use models::*;
pub use notifications::{FeedStatus, NotificationFeed, NotificationUpdate};
pub use presence::{PresenceChannel, PresenceUpdate};
