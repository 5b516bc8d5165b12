//! Durable cross-run memory of outstanding failures.

pub mod backend;
pub mod export;
pub mod failure_store;
pub mod record;

pub use backend::{FailureBackend, JsonFileBackend, LoadSource, Loaded, MemoryBackend, RecordMap};
pub use export::export_csv;
pub use failure_store::{FailureStats, FailureStore, StoreError};
pub use record::FailureRecord;
