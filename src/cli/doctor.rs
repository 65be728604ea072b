use anyhow::Result;
use console::style;
use std::path::Path;

use crate::core::config::KernelConfig;
use crate::core::container::check_runtime;
use crate::core::mounts::MountAllowlist;
use crate::core::terminal::{GuideSection, print_error, print_info, print_success, print_warn};

/// Returns `true` when every critical check passed.
pub async fn run_doctor(config: &KernelConfig) -> Result<bool> {
    GuideSection::new("kestrel Doctor")
        .status("Data", &config.data_dir.display().to_string())
        .print();
    println!();

    let mut healthy = true;

    // 1. Container runtime
    match check_runtime(&config.container.runtime).await {
        Ok(()) => print_success(&format!(
            "Container runtime '{}' is reachable",
            config.container.runtime
        )),
        Err(e) => {
            print_error(&format!(
                "Container runtime '{}' is not reachable: {:#}",
                config.container.runtime, e
            ));
            healthy = false;
        }
    }

    // 2. Mount allowlist
    let allowlist = config.allowlist_path();
    if allowlist.exists() {
        match MountAllowlist::load(&allowlist) {
            Ok(parsed) => print_success(&format!(
                "Mount allowlist parses: {} root(s), {} blocked pattern(s)",
                parsed.allowed_roots.len(),
                parsed.blocked_patterns.len()
            )),
            Err(e) => {
                print_error(&format!("Mount allowlist is invalid: {:#}", e));
                healthy = false;
            }
        }
    } else {
        print_info(&format!(
            "No mount allowlist at {} (additional mounts are disabled)",
            style(allowlist.display()).dim()
        ));
    }

    // 3. Data directory
    match check_writable(&config.data_dir) {
        Ok(()) => print_success("Data directory is writable"),
        Err(e) => {
            print_error(&format!(
                "Data directory {} is not writable: {:#}",
                config.data_dir.display(),
                e
            ));
            healthy = false;
        }
    }

    if config.bridge.command.is_empty() {
        print_warn("No [bridge] command configured; the kernel will run without a transport");
    }

    println!();
    if healthy {
        print_success("All checks passed.");
    } else {
        print_warn("Some checks failed. See above.");
    }
    Ok(healthy)
}

fn check_writable(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let probe = dir.join(".doctor-probe");
    std::fs::write(&probe, b"ok")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_dir_passes_and_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("data");
        check_writable(&nested).unwrap();
        assert_eq!(std::fs::read_dir(&nested).unwrap().count(), 0);
    }
}
