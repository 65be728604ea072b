use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::payload::IpcPayload;
use crate::core::config::KernelConfig;
use crate::core::groups::{GroupRegistration, GroupSync, register_group};
use crate::core::scheduler::{Caller, NewTask, TaskControl, TaskMutationError};
use crate::core::state::KernelState;
use crate::interfaces::bridge::Bridge;

const INBOX_KINDS: [&str; 2] = ["messages", "tasks"];

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed payload: {0}")]
    Parse(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("dispatch failed: {0:#}")]
    Dispatch(anyhow::Error),
}

impl From<TaskMutationError> for IpcError {
    fn from(e: TaskMutationError) -> Self {
        match e {
            TaskMutationError::Forbidden { .. } => IpcError::Unauthorized(e.to_string()),
            TaskMutationError::Store(inner) => IpcError::Dispatch(inner),
            other => IpcError::Rejected(other.to_string()),
        }
    }
}

pub struct IpcWatcher {
    config: Arc<KernelConfig>,
    state: Arc<KernelState>,
    bridge: Arc<dyn Bridge>,
    tasks: Arc<TaskControl>,
    groups: Arc<GroupSync>,
}

impl IpcWatcher {
    pub fn new(
        config: Arc<KernelConfig>,
        state: Arc<KernelState>,
        bridge: Arc<dyn Bridge>,
        tasks: Arc<TaskControl>,
        groups: Arc<GroupSync>,
    ) -> Self {
        Self {
            config,
            state,
            bridge,
            tasks,
            groups,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let poll = Duration::from_millis(self.config.ipc_poll_ms.max(1));
        info!("[ipc] Watching {:?} every {} ms", self.config.ipc_dir(), poll.as_millis());
        loop {
            let handled = self.poll_once().await;
            if handled > 0 {
                debug!("[ipc] Handled {} file(s)", handled);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }
        info!("[ipc] Stopped");
    }

    /// One pass over every known inbox. Returns how many files were consumed.
    pub async fn poll_once(&self) -> usize {
        let mut folders: Vec<String> = self
            .state
            .conversations()
            .into_iter()
            .map(|c| c.folder)
            .collect();
        folders.push(self.config.main_folder.clone());
        folders.sort();
        folders.dedup();

        let mut handled = 0;
        for folder in folders {
            let caller = Caller::new(folder.clone(), folder == self.config.main_folder);
            for kind in INBOX_KINDS {
                let inbox = self
                    .config
                    .ipc_folder_dir(&folder)
                    .join("inbox")
                    .join(kind);
                for path in pending_files(&inbox) {
                    self.process_file(&caller, &path).await;
                    handled += 1;
                }
            }
        }
        handled
    }

    async fn process_file(&self, caller: &Caller, path: &Path) {
        let outcome = match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<IpcPayload>(&content) {
                Ok(payload) => {
                    let kind = payload.kind();
                    self.dispatch(caller, payload).await.map(|_| kind)
                }
                Err(e) => Err(IpcError::Parse(e.to_string())),
            },
            Err(e) => {
                warn!("[ipc] Could not read {:?}: {}", path, e);
                return;
            }
        };

        match outcome {
            Ok(kind) => {
                debug!("[ipc] {} from '{}' handled", kind, caller.folder);
                remove(path).await;
            }
            Err(e @ (IpcError::Unauthorized(_) | IpcError::Rejected(_))) => {
                warn!("[ipc] {:?} from '{}': {}", file_name(path), caller.folder, e);
                remove(path).await;
            }
            Err(e @ (IpcError::Parse(_) | IpcError::Dispatch(_))) => {
                error!("[ipc] {:?} from '{}': {}", file_name(path), caller.folder, e);
                self.quarantine(&caller.folder, path).await;
            }
        }
    }

    pub async fn dispatch(&self, caller: &Caller, payload: IpcPayload) -> Result<(), IpcError> {
        match payload {
            IpcPayload::Message { chat_id, text } => {
                let chat_id = self.authorize_chat(caller, &chat_id)?;
                if text.trim().is_empty() {
                    return Err(IpcError::Rejected("empty message text".to_string()));
                }
                let text = format!("{} {}", self.config.reply_prefix(), text);
                self.bridge
                    .send_message(&chat_id, &text)
                    .await
                    .map_err(IpcError::Dispatch)?;
                info!("[ipc] Message from '{}' sent to {}", caller.folder, chat_id);
                Ok(())
            }
            IpcPayload::PhoneCall { chat_id, reason } => {
                let chat_id = self.authorize_chat(caller, &chat_id)?;
                self.bridge
                    .place_call(&chat_id, &reason)
                    .await
                    .map_err(IpcError::Dispatch)?;
                info!("[ipc] Call from '{}' placed to {}", caller.folder, chat_id);
                Ok(())
            }
            IpcPayload::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                target_chat_id,
                target_folder,
            } => {
                self.tasks
                    .schedule_task(
                        caller,
                        NewTask {
                            prompt,
                            schedule_type,
                            schedule_value,
                            context_mode,
                            target_chat_id,
                            target_folder,
                        },
                    )
                    .await?;
                Ok(())
            }
            IpcPayload::PauseTask { task_id } => Ok(self.tasks.pause_task(caller, &task_id).await?),
            IpcPayload::ResumeTask { task_id } => {
                Ok(self.tasks.resume_task(caller, &task_id).await?)
            }
            IpcPayload::CancelTask { task_id } => {
                Ok(self.tasks.cancel_task(caller, &task_id).await?)
            }
            IpcPayload::RefreshGroups {} => {
                self.require_main(caller, "refresh groups")?;
                self.groups
                    .sync_groups(true)
                    .await
                    .map_err(IpcError::Dispatch)?;
                Ok(())
            }
            IpcPayload::RegisterGroup {
                chat_id,
                name,
                folder,
                trigger,
            } => {
                self.require_main(caller, "register groups")?;
                let chat_id = self.state.resolve_alias(&chat_id);
                // workers cannot grant mounts; keep whatever the operator configured
                let additional_mounts = self
                    .state
                    .conversation(&chat_id)
                    .map(|c| c.mount_config.additional_mounts)
                    .unwrap_or_default();
                let conversation = register_group(
                    &self.config,
                    &self.state,
                    GroupRegistration {
                        chat_id,
                        name,
                        folder,
                        trigger,
                        additional_mounts,
                    },
                )
                .map_err(|e| IpcError::Rejected(format!("{:#}", e)))?;
                info!(
                    "[ipc] '{}' registered {} as '{}'",
                    caller.folder, conversation.chat_id, conversation.folder
                );
                Ok(())
            }
        }
    }

    /// Main may address any chat; everyone else only the chat registered to its own folder.
    fn authorize_chat(&self, caller: &Caller, chat_id: &str) -> Result<String, IpcError> {
        let chat_id = self.state.resolve_alias(chat_id);
        if caller.is_main {
            return Ok(chat_id);
        }
        match self.state.conversation(&chat_id) {
            Some(conversation) if conversation.folder == caller.folder => Ok(chat_id),
            _ => Err(IpcError::Unauthorized(format!(
                "'{}' may not address {}",
                caller.folder, chat_id
            ))),
        }
    }

    fn require_main(&self, caller: &Caller, action: &str) -> Result<(), IpcError> {
        if caller.is_main {
            Ok(())
        } else {
            Err(IpcError::Unauthorized(format!(
                "only the main conversation may {} (asked by '{}')",
                action, caller.folder
            )))
        }
    }

    async fn quarantine(&self, folder: &str, path: &Path) {
        let errors_dir = self.config.ipc_errors_dir().join(folder);
        if let Err(e) = tokio::fs::create_dir_all(&errors_dir).await {
            error!("[ipc] Could not create {:?}: {}", errors_dir, e);
            remove(path).await;
            return;
        }
        let name = file_name(path);
        let mut target = errors_dir.join(&name);
        if target.exists() {
            target = errors_dir.join(format!(
                "{}-{}",
                chrono::Utc::now().timestamp_millis(),
                name
            ));
        }
        match tokio::fs::rename(path, &target).await {
            Ok(()) => warn!("[ipc] Quarantined {:?}", target),
            Err(e) => {
                // never leave it in the inbox to be retried
                error!("[ipc] Could not quarantine {:?}: {}", path, e);
                remove(path).await;
            }
        }
    }
}

/// `*.json` files in `dir`, oldest name first. A missing directory has none.
fn pending_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "payload.json".to_string())
}

async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("[ipc] Could not delete {:?}: {}", path, e);
    }
}

#[cfg(test)]
mod tests;
