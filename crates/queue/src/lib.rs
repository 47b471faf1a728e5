pub mod error;
pub mod memory;
pub mod queue;
pub mod sqs;

pub use error::QueueError;
pub use memory::MemoryQueue;
pub use queue::{DurableQueue, QueueHealth, QueueMessage};
pub use sqs::SqsQueue;
