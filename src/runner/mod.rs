//! Runner daemon: executes the harness for each spawned test and publishes
//! its artifacts.

mod archive;
mod harness;
mod task;

pub use archive::{archive_dir, archive_dir_blocking};
pub use harness::{Harness, VncTarget};
pub use task::{RunOutcome, RunnerTask};
