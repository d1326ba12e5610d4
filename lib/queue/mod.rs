pub mod durable;
mod store;
pub mod types;

pub use store::QueueStore;
pub use types::{
    EnqueueError, ItemStatus, NewSubmission, QueueCounts, QueueError, QueueEvent, QueueItem,
};
