use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::container::ContainerConfig;
use crate::interfaces::bridge::BridgeConfig;
use crate::platform::{NativePlatform, Platform};

/// Kernel settings loaded from `<data>/kernel.toml`, then overridden from the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub assistant_name: String,
    pub main_folder: String,
    pub timezone: String,
    pub log_level: String,
    pub router_poll_ms: u64,
    pub ipc_poll_ms: u64,
    pub scheduler_poll_ms: u64,
    pub state_flush_secs: u64,
    pub mount_allowlist: Option<PathBuf>,
    pub container: ContainerConfig,
    pub bridge: BridgeConfig,

    #[serde(skip)]
    pub data_dir: PathBuf,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Andy".to_string(),
            main_folder: "main".to_string(),
            timezone: "UTC".to_string(),
            log_level: "info".to_string(),
            router_poll_ms: 2_000,
            ipc_poll_ms: 1_000,
            scheduler_poll_ms: 60_000,
            state_flush_secs: 5,
            mount_allowlist: None,
            container: ContainerConfig::default(),
            bridge: BridgeConfig::default(),
            data_dir: NativePlatform::data_dir(),
        }
    }
}

impl KernelConfig {
    pub async fn load<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let config_path = data_dir.join("kernel.toml");

        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("reading {}", config_path.display()))?;
            toml::from_str::<KernelConfig>(&content)
                .with_context(|| format!("parsing {}", config_path.display()))?
        } else {
            info!("No kernel.toml found in {:?}, using defaults.", data_dir);
            KernelConfig::default()
        };
        config.data_dir = data_dir;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(name) = non_empty("KESTREL_ASSISTANT_NAME") {
            self.assistant_name = name.trim().to_string();
        }
        if let Some(tz) = non_empty("KESTREL_TIMEZONE").or_else(|| non_empty("TZ")) {
            self.timezone = tz.trim().to_string();
        }
        if let Some(level) = non_empty("KESTREL_LOG_LEVEL") {
            self.log_level = level.trim().to_string();
        }
        if let Some(image) = non_empty("KESTREL_CONTAINER_IMAGE") {
            self.container.image = image.trim().to_string();
        }
    }

    /// Prefix the assistant puts on its own replies; rows carrying it are never routed.
    pub fn reply_prefix(&self) -> String {
        format!("{}:", self.assistant_name)
    }

    pub fn default_trigger(&self) -> String {
        format!("@{}", self.assistant_name)
    }

    pub fn tz(&self) -> Tz {
        match self.timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                warn!("Unknown timezone '{}', falling back to UTC", self.timezone);
                Tz::UTC
            }
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("state")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store").join("messages.db")
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.data_dir.join("groups")
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir().join(folder)
    }

    pub fn global_dir(&self) -> PathBuf {
        self.groups_dir().join(GLOBAL_FOLDER)
    }

    pub fn sessions_dir(&self, folder: &str) -> PathBuf {
        self.data_dir.join("sessions").join(folder)
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.data_dir.join("ipc")
    }

    pub fn ipc_folder_dir(&self, folder: &str) -> PathBuf {
        self.ipc_dir().join(folder)
    }

    /// Quarantine root for IPC files that could not be processed.
    pub fn ipc_errors_dir(&self) -> PathBuf {
        self.ipc_dir().join(IPC_ERRORS_FOLDER)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.data_dir.join("run")
    }

    pub fn allowlist_path(&self) -> PathBuf {
        self.mount_allowlist
            .clone()
            .unwrap_or_else(|| NativePlatform::operator_config_dir().join("mount-allowlist.json"))
    }
}

const GLOBAL_FOLDER: &str = "global";
const IPC_ERRORS_FOLDER: &str = "errors";

/// Folder names become path components on the host; only plain names are accepted.
/// Names that collide with shared directories under `groups/` or `ipc/` are reserved.
pub fn is_valid_folder_name(folder: &str) -> bool {
    if folder == GLOBAL_FOLDER || folder == IPC_ERRORS_FOLDER {
        return false;
    }
    let mut chars = folder.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    folder.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
