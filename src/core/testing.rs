//! In-process fakes for the runner and bridge seams.

use anyhow::{Result, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::container::{RunError, WorkerInput, WorkerOutput, WorkerRunner};
use crate::core::mounts::MountRequest;
use crate::interfaces::bridge::{Bridge, Presence};

#[derive(Default)]
pub struct FakeRunner {
    pub calls: Mutex<Vec<WorkerInput>>,
    outcomes: Mutex<VecDeque<Result<WorkerOutput, RunError>>>,
    delay: Mutex<Duration>,
    active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl FakeRunner {
    /// Queue the outcome of the next run. With nothing queued a run replies "ok".
    pub fn push(&self, outcome: Result<WorkerOutput, RunError>) {
        self.outcomes.lock().push_back(outcome);
    }

    pub fn reply(&self, result: &str, session: Option<&str>) {
        self.push(Ok(WorkerOutput::success(Some(result), session)));
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn inputs(&self) -> Vec<WorkerInput> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WorkerRunner for FakeRunner {
    async fn run(
        &self,
        input: WorkerInput,
        _additional_mounts: &[MountRequest],
    ) -> Result<WorkerOutput, RunError> {
        self.calls.lock().push(input);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.outcomes
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(WorkerOutput::success(Some("ok"), None)))
    }
}

#[derive(Default)]
pub struct RecordingBridge {
    pub sent: Mutex<Vec<(String, String)>>,
    pub presence: Mutex<Vec<(String, Presence)>>,
    pub calls: Mutex<Vec<(String, String)>>,
    pub groups: Mutex<HashMap<String, String>>,
    pub fail_sends: AtomicBool,
}

impl RecordingBridge {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Bridge for RecordingBridge {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            bail!("send failed");
        }
        self.sent.lock().push((chat_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_presence(&self, chat_id: &str, presence: Presence) -> Result<()> {
        self.presence.lock().push((chat_id.to_string(), presence));
        Ok(())
    }

    async fn fetch_groups(&self) -> Result<HashMap<String, String>> {
        Ok(self.groups.lock().clone())
    }

    async fn place_call(&self, chat_id: &str, reason: &str) -> Result<()> {
        self.calls.lock().push((chat_id.to_string(), reason.to_string()));
        Ok(())
    }
}
