//! Conversation registration and group metadata sync, shared by IPC, bridge ingest and the CLI.

use anyhow::{Result, bail};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::config::{KernelConfig, is_valid_folder_name};
use crate::core::container::snapshots;
use crate::core::mounts::MountRequest;
use crate::core::state::{Conversation, KernelState, MountConfig};
use crate::core::store::{MessageStore, now_timestamp};
use crate::interfaces::bridge::Bridge;

/// Unforced syncs are skipped when the last one is more recent than this.
const SYNC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default)]
pub struct GroupRegistration {
    pub chat_id: String,
    pub name: String,
    pub folder: String,
    pub trigger: Option<String>,
    pub additional_mounts: Vec<MountRequest>,
}

/// Register (or re-register) a conversation and lay out its directories.
/// Main status follows the folder: only `main_folder` is main.
pub fn register_group(
    config: &KernelConfig,
    state: &KernelState,
    registration: GroupRegistration,
) -> Result<Conversation> {
    let chat_id = registration.chat_id.trim();
    if chat_id.is_empty() {
        bail!("chat id must not be empty");
    }
    if !is_valid_folder_name(&registration.folder) {
        bail!("invalid folder name '{}'", registration.folder);
    }

    let trigger = registration
        .trigger
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| config.default_trigger());
    let existing = state.conversation(chat_id);

    let conversation = Conversation {
        chat_id: chat_id.to_string(),
        name: if registration.name.trim().is_empty() {
            registration.folder.clone()
        } else {
            registration.name.trim().to_string()
        },
        is_main: registration.folder == config.main_folder,
        folder: registration.folder,
        trigger,
        mount_config: MountConfig {
            additional_mounts: registration.additional_mounts,
        },
        added_at: existing
            .map(|c| c.added_at)
            .unwrap_or_else(now_timestamp),
    };

    std::fs::create_dir_all(config.group_dir(&conversation.folder).join("logs"))?;
    let ipc = config.ipc_folder_dir(&conversation.folder);
    std::fs::create_dir_all(ipc.join("inbox").join("messages"))?;
    std::fs::create_dir_all(ipc.join("inbox").join("tasks"))?;

    state.register_conversation(conversation.clone())?;
    Ok(conversation)
}

/// Pulls group names from the bridge and refreshes main's `availableGroups.json`.
pub struct GroupSync {
    config: Arc<KernelConfig>,
    store: MessageStore,
    state: Arc<KernelState>,
    bridge: Arc<dyn Bridge>,
    last_sync: Mutex<Option<Instant>>,
}

impl GroupSync {
    pub fn new(
        config: Arc<KernelConfig>,
        store: MessageStore,
        state: Arc<KernelState>,
        bridge: Arc<dyn Bridge>,
    ) -> Self {
        Self {
            config,
            store,
            state,
            bridge,
            last_sync: Mutex::new(None),
        }
    }

    /// Returns how many group names were refreshed; `None` when skipped as recent.
    pub async fn sync_groups(&self, force: bool) -> Result<Option<usize>> {
        if !force
            && let Some(last) = *self.last_sync.lock()
            && last.elapsed() < SYNC_INTERVAL
        {
            return Ok(None);
        }

        let groups = self.bridge.fetch_groups().await?;
        self.update_names(&groups).await?;
        *self.last_sync.lock() = Some(Instant::now());
        info!("[groups] Synced {} group name(s)", groups.len());

        if let Err(e) = self.write_main_snapshot().await {
            warn!("[groups] Could not refresh groups snapshot: {:#}", e);
        }
        Ok(Some(groups.len()))
    }

    pub async fn update_names(&self, groups: &HashMap<String, String>) -> Result<()> {
        for (chat_id, name) in groups {
            let chat_id = self.state.resolve_alias(chat_id);
            self.store.update_chat_name(&chat_id, name).await?;
        }
        Ok(())
    }

    async fn write_main_snapshot(&self) -> Result<()> {
        let ipc_dir = self.config.ipc_folder_dir(&self.config.main_folder);
        std::fs::create_dir_all(&ipc_dir)?;
        let chats = self.store.list_chats().await?;
        let registered: HashSet<String> = self.state.registered_chat_ids().into_iter().collect();
        snapshots::write_groups_snapshot(&ipc_dir, true, &chats, &registered)
    }
}
