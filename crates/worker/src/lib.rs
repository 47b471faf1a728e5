//! Ticket workers.
//!
//! Each claim loop polls the durable queue, claims the ticket named by the
//! message with a compare-and-swap on its status, runs the requested endpoint
//! from the [`DispatchTable`] and settles the ticket according to the
//! returned [`Outcome`].

pub mod claim;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod names;
pub mod outcome;
pub mod pool;
pub mod protection;
pub mod registry;

pub use claim::{Claimer, Disposition};
pub use dispatch::{Dispatch, DispatchTable, Endpoint};
pub use error::WorkerError;
pub use names::generate_name;
pub use outcome::{Action, Outcome};
pub use pool::WorkerPool;
pub use protection::{LogOnlyProtection, ScaleInProtection};
pub use registry::{MemoryWorkerRegistry, PgWorkerRegistry, Registration, WorkerRecord, WorkerRegistry};
