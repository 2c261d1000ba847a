//! Backend implementations for the shared job/test store.

mod base;
mod memory;
mod postgres;

pub use base::{
    BackendError, BackendResult, ClaimedTest, JobSource, JobStatusBackend, JobStatusEntry,
    NewTest, RetentionBackend, RetentionResult, StalenessBackend, TestIntakeBackend,
    TestLeaseBackend,
};
pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;
