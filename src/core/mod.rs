pub mod config;
pub mod container;
pub mod groups;
pub mod ipc;
pub mod kernel;
pub mod lifecycle;
pub mod mounts;
pub mod router;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod terminal;

#[cfg(test)]
pub mod testing;
