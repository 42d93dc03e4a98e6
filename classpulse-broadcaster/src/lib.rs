//! Live fan-out of telemetry to dashboard subscribers
//!
//! Subscribers join rooms keyed by device id. Publishing goes through a
//! [`Relay`] so that every process instance sharing the relay delivers the
//! payload to its own local subscribers.
//!
//! # Components
//!
//! - [`RoomRegistry`] - room → subscriber set, dead subscribers removed after each pass
//! - [`Relay`] / [`LocalRelay`] / [`RedisRelay`] - cross-instance channel
//! - [`LiveBroadcaster`] - one forwarding task per room with local subscribers
//! - [`LiveServer`] - Unix socket endpoint speaking newline-delimited JSON
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use classpulse_broadcaster::{LiveBroadcaster, LiveServer, LocalRelay};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broadcaster = Arc::new(LiveBroadcaster::new(Arc::new(LocalRelay::new())));
//!     let server = LiveServer::new("/tmp/classpulse_live.sock", broadcaster.clone());
//!     server.start().await?;
//!
//!     broadcaster.publish("room-101", "{\"hello\":1}".to_string()).await?;
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod client;
pub mod error;
pub mod events;
pub mod redis_relay;
pub mod relay;
pub mod server;

// Re-exports
pub use broadcaster::LiveBroadcaster;
pub use client::{ChannelSubscriber, RoomRegistry, SocketSubscriber, Subscriber};
pub use error::{BroadcasterError, Result};
pub use events::LiveEvent;
pub use redis_relay::RedisRelay;
pub use relay::{LocalRelay, Relay, RelaySubscription};
pub use server::LiveServer;
