use anyhow::Result;
use console::style;
use std::path::Path;

use crate::core::config::KernelConfig;
use crate::core::kernel::Kernel;
use crate::core::terminal::{GuideSection, print_error, print_info, print_warn};
use crate::logging;
use crate::platform::{NativePlatform, Platform};

pub const PID_FILE: &str = "kestrel.pid";
pub const LOG_FILE: &str = "kestrel.log";

/// Boots the kernel in this process. A detached daemon logs to the run directory only.
pub async fn run_kernel(config: KernelConfig, detached: bool) -> Result<()> {
    let log_file = config.run_dir().join(LOG_FILE);
    logging::init(
        &config.log_level,
        detached.then_some(log_file.as_path()),
        detached,
    );
    if !detached {
        GuideSection::new("Kernel")
            .status("Assistant", &config.assistant_name)
            .status("Data", &config.data_dir.display().to_string())
            .status("Runtime", &config.container.runtime)
            .blank()
            .info(&format!("Press {} to stop.", style("Ctrl+C").bold().yellow()))
            .print();
        println!();
    }
    Kernel::boot(config).await?.run().await
}

/// Reads the pid file, removing it when the process it names is gone.
fn live_pid(pid_file: &Path) -> Option<String> {
    let pid = std::fs::read_to_string(pid_file).ok()?.trim().to_string();
    if !pid.is_empty() && NativePlatform::process_alive(&pid) {
        Some(pid)
    } else {
        std::fs::remove_file(pid_file).ok();
        None
    }
}

pub async fn gateway_start(run_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(run_dir)?;
    NativePlatform::restrict_dir_permissions(run_dir);
    let pid_file = run_dir.join(PID_FILE);
    if let Some(pid) = live_pid(&pid_file) {
        print_warn(&format!(
            "Daemon is already running (PID {}). Use 'kestrel gateway stop' first.",
            pid
        ));
        return Ok(());
    }

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(run_dir.join(LOG_FILE))?;

    let exe = std::env::current_exe()?;
    let child = std::process::Command::new(exe)
        .arg("daemon-run")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(log_file)
        .spawn()?;

    std::fs::write(&pid_file, child.id().to_string())?;

    GuideSection::new("Gateway Started")
        .status(
            "Status",
            &format!(
                "{} (PID {})",
                style("RUNNING").green().bold(),
                style(child.id()).dim()
            ),
        )
        .status("Log", &run_dir.join(LOG_FILE).display().to_string())
        .blank()
        .info(&format!(
            "Run {} to follow it.",
            style("kestrel logs").cyan().bold()
        ))
        .print();
    println!();

    Ok(())
}

pub async fn gateway_stop(run_dir: &Path) -> Result<()> {
    let pid_file = run_dir.join(PID_FILE);
    match live_pid(&pid_file) {
        Some(pid) => {
            NativePlatform::kill_process(&pid)?;
            std::fs::remove_file(&pid_file).ok();
            GuideSection::new("Gateway Stopped")
                .status(
                    "Status",
                    &format!(
                        "{} (was PID {})",
                        style("STOPPED").red().bold(),
                        style(&pid).dim()
                    ),
                )
                .print();
        }
        None => print_info("Gateway is not currently running."),
    }
    println!();
    Ok(())
}

pub async fn gateway_status(run_dir: &Path) -> Result<()> {
    match live_pid(&run_dir.join(PID_FILE)) {
        Some(pid) => {
            GuideSection::new("Gateway Status")
                .status(
                    "Gateway",
                    &format!(
                        "{} (PID {})",
                        style("RUNNING").green().bold(),
                        style(pid).dim()
                    ),
                )
                .print();
        }
        None => {
            GuideSection::new("Gateway Status")
                .status("Gateway", &style("STOPPED").red().bold().to_string())
                .blank()
                .info(&format!(
                    "Run {} to start the daemon.",
                    style("kestrel gateway start").cyan().bold()
                ))
                .print();
        }
    }
    println!();
    Ok(())
}

pub async fn follow_logs(run_dir: &Path) -> Result<()> {
    let log_file = run_dir.join(LOG_FILE);
    if !log_file.exists() {
        print_error(&format!(
            "Log file not found at {}",
            style(log_file.display()).dim()
        ));
        return Ok(());
    }
    if live_pid(&run_dir.join(PID_FILE)).is_none() {
        print_warn("Gateway is not running; showing the last log lines.");
    }
    GuideSection::new("Live Logs")
        .text(&format!(
            "Following {} - press {} to stop.",
            style(LOG_FILE).cyan(),
            style("Ctrl+C").bold().yellow()
        ))
        .print();
    println!();
    let mut child = NativePlatform::tail_file(&log_file)?;
    child.wait()?;
    Ok(())
}
