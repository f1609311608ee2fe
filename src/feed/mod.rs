//! Exchange feed: wire format, connection signing and the connection manager.

pub mod auth;
pub mod connection;
pub mod messages;

pub use auth::Credentials;
pub use connection::{
    Backoff, ConnectionManager, ConnectionStats, FeedCommand, FeedHandle, InboundFrame,
};
pub use messages::{parse_frame, FeedMessage};
