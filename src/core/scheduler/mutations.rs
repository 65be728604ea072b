use chrono::Utc;
use chrono_tz::Tz;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::next_run::{compute_next_run, first_run};
use crate::core::state::KernelState;
use crate::core::store::{
    ContextMode, MessageStore, ScheduleType, ScheduledTask, TaskStatus, format_timestamp,
    now_timestamp,
};

#[derive(Debug, Error)]
pub enum TaskMutationError {
    #[error("task {0} not found")]
    NotFound(String),
    #[error("'{caller}' may not manage tasks of '{owner}'")]
    Forbidden { caller: String, owner: String },
    #[error("invalid {schedule_type} schedule '{value}'")]
    InvalidSchedule {
        schedule_type: ScheduleType,
        value: String,
    },
    #[error("no registered conversation for '{0}'")]
    UnknownConversation(String),
    #[error("task prompt is empty")]
    EmptyPrompt,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Who asked for a task mutation. Derived from the IPC directory, never from the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub folder: String,
    pub is_main: bool,
}

impl Caller {
    pub fn new(folder: impl Into<String>, is_main: bool) -> Self {
        Self {
            folder: folder.into(),
            is_main,
        }
    }

    fn may_manage(&self, owner_folder: &str) -> bool {
        self.is_main || self.folder == owner_folder
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub target_chat_id: Option<String>,
    pub target_folder: Option<String>,
}

/// Create, pause, resume and cancel tasks on behalf of a conversation.
pub struct TaskControl {
    store: MessageStore,
    state: Arc<KernelState>,
    tz: Tz,
}

impl TaskControl {
    pub fn new(store: MessageStore, state: Arc<KernelState>, tz: Tz) -> Self {
        Self { store, state, tz }
    }

    pub async fn schedule_task(
        &self,
        caller: &Caller,
        request: NewTask,
    ) -> Result<ScheduledTask, TaskMutationError> {
        if request.prompt.trim().is_empty() {
            return Err(TaskMutationError::EmptyPrompt);
        }

        let target = if let Some(chat_id) = request.target_chat_id.as_deref() {
            let chat_id = self.state.resolve_alias(chat_id);
            self.state
                .conversation(&chat_id)
                .ok_or(TaskMutationError::UnknownConversation(chat_id))?
        } else {
            let folder = request.target_folder.as_deref().unwrap_or(&caller.folder);
            self.state
                .conversation_by_folder(folder)
                .ok_or_else(|| TaskMutationError::UnknownConversation(folder.to_string()))?
        };
        if !caller.may_manage(&target.folder) {
            return Err(TaskMutationError::Forbidden {
                caller: caller.folder.clone(),
                owner: target.folder,
            });
        }

        let value = request.schedule_value.trim().to_string();
        let next_run = first_run(request.schedule_type, &value, self.tz, Utc::now()).ok_or_else(
            || TaskMutationError::InvalidSchedule {
                schedule_type: request.schedule_type,
                value: value.clone(),
            },
        )?;

        let task = ScheduledTask {
            id: new_task_id(),
            group_folder: target.folder,
            chat_id: target.chat_id,
            prompt: request.prompt,
            schedule_type: request.schedule_type,
            schedule_value: value,
            context_mode: request.context_mode,
            next_run: Some(format_timestamp(next_run)),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_timestamp(),
        };
        self.store.create_task(&task).await?;
        info!(
            "[scheduler] Task {} scheduled for '{}' ({} {}), first run {}",
            task.id,
            task.group_folder,
            task.schedule_type,
            task.schedule_value,
            task.next_run.as_deref().unwrap_or("-")
        );
        Ok(task)
    }

    pub async fn pause_task(&self, caller: &Caller, id: &str) -> Result<(), TaskMutationError> {
        let task = self.owned_task(caller, id).await?;
        self.store.set_task_status(&task.id, TaskStatus::Paused).await?;
        info!("[scheduler] Task {} paused by '{}'", id, caller.folder);
        Ok(())
    }

    /// Reactivates a task. A recurring task that lost its `next_run` gets a fresh one.
    pub async fn resume_task(&self, caller: &Caller, id: &str) -> Result<(), TaskMutationError> {
        let task = self.owned_task(caller, id).await?;
        if task.next_run.is_none() && task.schedule_type != ScheduleType::Once {
            let next = compute_next_run(task.schedule_type, &task.schedule_value, self.tz, Utc::now())
                .ok_or_else(|| TaskMutationError::InvalidSchedule {
                    schedule_type: task.schedule_type,
                    value: task.schedule_value.clone(),
                })?;
            self.store
                .set_task_next_run(&task.id, Some(&format_timestamp(next)))
                .await?;
        }
        self.store.set_task_status(&task.id, TaskStatus::Active).await?;
        info!("[scheduler] Task {} resumed by '{}'", id, caller.folder);
        Ok(())
    }

    pub async fn cancel_task(&self, caller: &Caller, id: &str) -> Result<(), TaskMutationError> {
        let task = self.owned_task(caller, id).await?;
        self.store.delete_task(&task.id).await?;
        info!("[scheduler] Task {} cancelled by '{}'", id, caller.folder);
        Ok(())
    }

    async fn owned_task(&self, caller: &Caller, id: &str) -> Result<ScheduledTask, TaskMutationError> {
        let task = self
            .store
            .get_task(id)
            .await?
            .ok_or_else(|| TaskMutationError::NotFound(id.to_string()))?;
        if !caller.may_manage(&task.group_folder) {
            return Err(TaskMutationError::Forbidden {
                caller: caller.folder.clone(),
                owner: task.group_folder,
            });
        }
        Ok(task)
    }
}

/// `task-<unix ms>-<6 alphanumerics>`
pub fn new_task_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("task-{}-{}", Utc::now().timestamp_millis(), suffix)
}
