use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Send a termination signal to the process identified by `pid`.
    fn kill_process(pid: &str) -> std::io::Result<std::process::Output>;

    /// Whether a process with this pid is still alive.
    fn process_alive(pid: &str) -> bool;

    /// Spawn a child that tails / follows a log file.
    fn tail_file(path: &Path) -> std::io::Result<std::process::Child>;

    /// Set restrictive *directory* permissions (0o700 on Unix, no-op elsewhere).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op elsewhere).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory for kestrel.
    /// Unix: `~/.kestrel`, overridable with `KESTREL_DATA_DIR`.
    fn data_dir() -> PathBuf;

    /// Directory holding operator-owned configuration that workers can never mount.
    fn operator_config_dir() -> PathBuf;
}

/// Honour `KESTREL_DATA_DIR` when set, otherwise fall back to the platform default.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    match std::env::var("KESTREL_DATA_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => default,
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
pub use fallback::NativePlatform;
