//! Client for a Redis-backed channel layer.
//!
//! A channel layer is a set of named, bounded, expiring message queues that a
//! gateway and its application workers use to talk to each other without ever
//! sharing a socket. This crate holds the wire codec ([`message`]), the typed
//! message schemas exchanged with workers ([`schema`]), and the Redis client
//! implementing send/receive with capacity and expiry ([`layer`]).

pub mod error;
pub mod layer;
pub mod message;
pub mod schema;

pub use error::{ChannelError, is_channel_full};
pub use layer::{ChannelLayer, ChannelLayerConfig, RedisChannelLayer};
pub use message::{ASGI_CHANNEL_KEY, Message, Value};
