//! Job tickets: the caller-visible handle for an asynchronous job.
//!
//! A ticket is three independently stored JSON records (status, request,
//! result) keyed by a [`TicketId`]. The same ID is the payload of the queue
//! message that carries the job to a worker.

pub mod client;
pub mod error;
pub mod lifecycle;
pub mod memory;
pub mod redis_store;
pub mod store;
pub mod types;

pub use client::JobClient;
pub use error::TicketError;
pub use lifecycle::{claim_transition, is_orphaned};
pub use memory::MemoryTicketStore;
pub use redis_store::RedisTicketStore;
pub use store::{Keys, TicketStore};
pub use types::{JobRequest, JobView, StatusKind, TicketId, TicketMeta, TicketStatus};
