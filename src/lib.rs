//! vmtest - GUI acceptance tests on disposable VMs.
//!
//! Three daemons cooperate only through the `jobs` and `tests` tables:
//! the scheduler expands jobs into tests and keeps state consistent, the
//! spawner boots a VM per test and the runner drives the harness against it.

pub mod backends;
pub mod config;
pub mod db;
pub mod git;
pub mod plan;
pub mod polling;
pub mod process;
pub mod runner;
pub mod scheduler;
pub mod spawner;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use backends::{MemoryBackend, PostgresBackend};
pub use config::{LeaseConfig, PollInterval, RunnerConfig, SchedulerConfig, SpawnerConfig};
pub use runner::RunnerTask;
pub use scheduler::SchedulerTask;
pub use spawner::SpawnerTask;
