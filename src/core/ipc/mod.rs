//! File-based requests from workers.
//!
//! Each conversation's worker can only write into its own
//! `ipc/<folder>/inbox/{messages,tasks}` directories, so the directory a file
//! was found in is the caller's identity. Payload contents never grant privileges.

mod payload;
mod watcher;

pub use watcher::IpcWatcher;
