//! Timer-driven worker runs.
//!
//! Every tick selects active tasks whose `next_run` has passed and runs each one
//! on its own tokio task, so a slow or failing task never holds up the others.
//! A task that is still running is not started again by the next tick.

mod mutations;
mod next_run;

pub use mutations::{Caller, NewTask, TaskControl, TaskMutationError};
pub use next_run::compute_next_run;

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::config::KernelConfig;
use crate::core::container::{WorkerInput, WorkerRunner};
use crate::core::state::KernelState;
use crate::core::store::{
    ContextMode, MessageStore, RunStatus, ScheduleType, ScheduledTask, TaskRunLog, TaskStatus,
    format_timestamp, now_timestamp,
};

const RESULT_SUMMARY_CHARS: usize = 200;

pub struct TaskScheduler {
    config: Arc<KernelConfig>,
    store: MessageStore,
    state: Arc<KernelState>,
    runner: Arc<dyn WorkerRunner>,
    in_flight: Mutex<HashSet<String>>,
}

impl TaskScheduler {
    pub fn new(
        config: Arc<KernelConfig>,
        store: MessageStore,
        state: Arc<KernelState>,
        runner: Arc<dyn WorkerRunner>,
    ) -> Self {
        Self {
            config,
            store,
            state,
            runner,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let poll = Duration::from_millis(self.config.scheduler_poll_ms.max(1));
        info!("[scheduler] Polling every {} ms", poll.as_millis());
        let mut running = JoinSet::new();

        loop {
            while running.try_join_next().is_some() {}
            if let Err(e) = self.tick(&mut running).await {
                error!("[scheduler] Tick failed: {:#}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        if !running.is_empty() {
            info!("[scheduler] Waiting for {} running task(s)", running.len());
        }
        while running.join_next().await.is_some() {}
        info!("[scheduler] Stopped");
    }

    /// Start every due task that is not already running. Returns how many were started.
    pub async fn tick(self: &Arc<Self>, running: &mut JoinSet<()>) -> anyhow::Result<usize> {
        let due = self.store.get_due_tasks(&now_timestamp()).await?;
        let mut started = 0;
        for task in due {
            if !self.in_flight.lock().insert(task.id.clone()) {
                debug!("[scheduler] Task {} still running, skipping", task.id);
                continue;
            }
            let scheduler = Arc::clone(self);
            running.spawn(async move {
                let id = task.id.clone();
                scheduler.run_task(task).await;
                scheduler.in_flight.lock().remove(&id);
            });
            started += 1;
        }
        if started > 0 {
            info!("[scheduler] Started {} due task(s)", started);
        }
        Ok(started)
    }

    /// Execute one task, record the run and reschedule it. Errors are logged, never raised.
    pub async fn run_task(&self, task: ScheduledTask) {
        let run_at = now_timestamp();
        let started = Instant::now();
        info!(
            "[scheduler] Running task {} for '{}'",
            task.id, task.group_folder
        );

        let outcome = self.execute(&task).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, result, error, summary) = match outcome {
            Ok(result) => {
                let summary = if result.trim().is_empty() {
                    "Completed".to_string()
                } else {
                    truncate_chars(&result, RESULT_SUMMARY_CHARS)
                };
                (RunStatus::Success, Some(result), None, summary)
            }
            Err(message) => {
                error!("[scheduler] Task {} failed: {}", task.id, message);
                let summary = truncate_chars(&format!("Error: {}", message), RESULT_SUMMARY_CHARS);
                (RunStatus::Error, None, Some(message), summary)
            }
        };

        let log = TaskRunLog {
            task_id: task.id.clone(),
            run_at,
            duration_ms,
            status,
            result,
            error,
        };
        if let Err(e) = self.record(&task, log, &summary).await {
            error!("[scheduler] Could not record run of task {}: {:#}", task.id, e);
        }
    }

    async fn execute(&self, task: &ScheduledTask) -> Result<String, String> {
        let conversation = self
            .state
            .conversation_by_folder(&task.group_folder)
            .ok_or_else(|| format!("folder '{}' is not registered", task.group_folder))?;

        // group-context tasks resume the conversation's session and must not race the router
        let lock = self.state.run_lock(&task.group_folder);
        let _guard = match task.context_mode {
            ContextMode::Group => Some(lock.lock().await),
            ContextMode::Isolated => None,
        };
        let session_id = match task.context_mode {
            ContextMode::Group => self.state.session(&task.group_folder),
            ContextMode::Isolated => None,
        };

        let input = WorkerInput {
            prompt: task.prompt.clone(),
            session_id,
            workspace_folder: task.group_folder.clone(),
            chat_id: task.chat_id.clone(),
            is_main: conversation.is_main,
            is_scheduled_task: true,
        };
        let output = self
            .runner
            .run(input, &conversation.mount_config.additional_mounts)
            .await
            .map_err(|e| e.to_string())?;

        if task.context_mode == ContextMode::Group
            && let Some(session) = output.new_session_id.as_deref()
        {
            self.state.set_session(&task.group_folder, session);
        }
        Ok(output.result.unwrap_or_default())
    }

    async fn record(&self, task: &ScheduledTask, log: TaskRunLog, summary: &str) -> anyhow::Result<()> {
        // the task may have been paused or cancelled while it ran
        let Some(current) = self.store.get_task(&task.id).await? else {
            warn!("[scheduler] Task {} was cancelled during its run", task.id);
            return Ok(());
        };

        self.store.log_task_run(&log).await?;

        let (next_run, new_status) = match task.schedule_type {
            ScheduleType::Once => (None, TaskStatus::Completed),
            _ => {
                let next = compute_next_run(
                    task.schedule_type,
                    &task.schedule_value,
                    self.config.tz(),
                    Utc::now(),
                )
                .map(format_timestamp);
                if next.is_none() {
                    warn!(
                        "[scheduler] Task {} schedule '{}' yields no next run; it will not fire again",
                        task.id, task.schedule_value
                    );
                }
                (next, current.status)
            }
        };

        self.store
            .update_task_after_run(&task.id, next_run.as_deref(), &log.run_at, summary, new_status)
            .await?;
        debug!(
            "[scheduler] Task {} next run {}",
            task.id,
            next_run.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
