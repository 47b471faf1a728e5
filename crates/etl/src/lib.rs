//! Content-addressed dataset synchronization.
//!
//! A source snapshot is parsed into a staging table where every row is
//! identified by the SHA-256 of its values. The live dataset table is then
//! reconciled against staging by hash: rows whose hash vanished are deleted,
//! rows with new hashes are inserted, and nothing is ever updated in place.

pub mod columns;
pub mod dates;
pub mod derive;
pub mod engine;
pub mod error;
pub mod hashing;
pub mod memory;
pub mod meta;
pub mod postgres;
pub mod roles;
pub mod source;
pub mod staging;
pub mod store;

pub use columns::{ColumnDef, ColumnType};
pub use engine::{SyncEngine, SyncReport};
pub use error::EtlError;
pub use memory::{MemoryDatasetStore, MemoryMetaStore};
pub use meta::{BBox, DatasetMeta, IngestExtent, MetaStore, NewDataset};
pub use postgres::{PgDatasetStore, PgMetaStore};
pub use roles::ColumnRoles;
pub use source::SourceFile;
pub use staging::{StagedRow, StagingTable};
pub use store::DatasetStore;
