pub mod actor;
pub mod connection;
pub mod handler;
pub mod inbound;
pub mod protocol;
pub mod registry;

use uuid::Uuid;

/// Owner of a connection. A user may hold several connections at once (devices/tabs).
pub type UserId = Uuid;

/// Broadcast scope a connection can observe. Maps to a conversation id in the domain layer.
pub type TopicId = Uuid;

pub use connection::{ConnectionHandle, ConnectionId, ConnectionOptions, EnqueueError};
pub use inbound::{InboundHandler, RateLimitedInbound};
pub use protocol::{InboundMessage, Notification};
pub use registry::ConnectionRegistry;
