mod config;
mod output;
mod runner;
pub mod snapshots;

pub use config::ContainerConfig;
pub use output::WorkerOutput;
pub use runner::{ContainerRunner, RunError, WorkerInput, WorkerRunner, check_runtime};
