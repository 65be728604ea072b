use std::path::{Path, PathBuf};

use super::{Platform, home_dir, resolve_data_dir};

pub struct NativePlatform;

impl Platform for NativePlatform {
    fn kill_process(pid: &str) -> std::io::Result<std::process::Output> {
        std::process::Command::new("taskkill")
            .args(["/PID", pid, "/F"])
            .output()
    }

    fn process_alive(pid: &str) -> bool {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid)])
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(pid))
            .unwrap_or(false)
    }

    fn tail_file(path: &Path) -> std::io::Result<std::process::Child> {
        std::process::Command::new("powershell")
            .arg("-Command")
            .arg(format!("Get-Content -Path '{}' -Tail 200 -Wait", path.display()))
            .spawn()
    }

    fn restrict_dir_permissions(_path: &Path) {}

    fn restrict_file_permissions(_path: &Path) {}

    fn data_dir() -> PathBuf {
        resolve_data_dir(
            dirs::data_dir()
                .unwrap_or_else(home_dir)
                .join("kestrel"),
        )
    }

    fn operator_config_dir() -> PathBuf {
        dirs::config_dir().unwrap_or_else(home_dir).join("kestrel")
    }
}
