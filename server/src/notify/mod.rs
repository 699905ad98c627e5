pub mod batcher;
pub mod dedup;
pub mod events;
pub mod service;

pub use batcher::{BatchFlusher, BatchKey, NotificationBatcher};
pub use dedup::MessageDeduplicator;
pub use events::{DomainEvent, NotificationEventHandler};
pub use service::{DispatchError, DispatchLoop, NotificationService, Submission};
