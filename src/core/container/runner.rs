use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::output::{WorkerOutput, WorkerStatus, parse_worker_output};
use super::snapshots;
use crate::core::config::KernelConfig;
use crate::core::mounts::{MountGuard, MountRequest};
use crate::core::state::KernelState;
use crate::core::store::MessageStore;

const GROUP_MOUNT: &str = "/workspace/group";
const PROJECT_MOUNT: &str = "/workspace/project";
const GLOBAL_MOUNT: &str = "/workspace/global";
const IPC_MOUNT: &str = "/workspace/ipc";
const SESSION_MOUNT: &str = "/home/node/.claude";
const CREDENTIALS_MOUNT: &str = "/workspace/env/credentials";

/// Engines use exit code 125 when they could not start the container at all.
const ENGINE_START_FAILURE: i32 = 125;

/// The single JSON line written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub workspace_folder: String,
    pub chat_id: String,
    pub is_main: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_scheduled_task: bool,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start worker: {0}")]
    Spawn(String),
    #[error("worker timed out after {0} ms")]
    Timeout(u64),
    #[error("process exited with code {code}")]
    Exited { code: i32 },
    #[error("unparseable worker output: {0}")]
    Parse(String),
    #[error("worker i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker reported an error: {0}")]
    WorkerReported(String),
}

/// Seam between the poll loops and the sandbox. Implementations never panic into the caller.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    async fn run(
        &self,
        input: WorkerInput,
        additional_mounts: &[MountRequest],
    ) -> Result<WorkerOutput, RunError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub readonly: bool,
}

impl VolumeMount {
    fn new(host_path: PathBuf, container_path: &str, readonly: bool) -> Self {
        Self {
            host_path,
            container_path: container_path.to_string(),
            readonly,
        }
    }

    fn to_arg(&self) -> String {
        let mode = if self.readonly { ":ro" } else { "" };
        format!("{}:{}{}", self.host_path.display(), self.container_path, mode)
    }
}

struct RunRecord {
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    truncated: bool,
    timed_out: bool,
    duration: Duration,
}

/// Runs one worker per invocation inside the configured container engine.
pub struct ContainerRunner {
    config: Arc<KernelConfig>,
    store: MessageStore,
    state: Arc<KernelState>,
    mounts: Arc<MountGuard>,
}

impl ContainerRunner {
    pub fn new(
        config: Arc<KernelConfig>,
        store: MessageStore,
        state: Arc<KernelState>,
        mounts: Arc<MountGuard>,
    ) -> Self {
        Self {
            config,
            store,
            state,
            mounts,
        }
    }

    /// Core mounts plus the validated subset of `additional`. Creates the host directories.
    pub fn build_mounts(
        &self,
        input: &WorkerInput,
        additional: &[MountRequest],
    ) -> std::io::Result<Vec<VolumeMount>> {
        let folder = &input.workspace_folder;
        let group_dir = self.config.group_dir(folder);
        let ipc_dir = self.config.ipc_folder_dir(folder);
        let sessions_dir = self.config.sessions_dir(folder);

        std::fs::create_dir_all(group_dir.join("logs"))?;
        std::fs::create_dir_all(ipc_dir.join("inbox").join("messages"))?;
        std::fs::create_dir_all(ipc_dir.join("inbox").join("tasks"))?;
        std::fs::create_dir_all(&sessions_dir)?;

        let mut mounts = vec![VolumeMount::new(group_dir, GROUP_MOUNT, false)];
        if input.is_main {
            mounts.push(VolumeMount::new(
                self.config.container.project_root(),
                PROJECT_MOUNT,
                false,
            ));
        } else {
            let global = self.config.global_dir();
            if global.is_dir() {
                mounts.push(VolumeMount::new(global, GLOBAL_MOUNT, true));
            }
        }
        mounts.push(VolumeMount::new(ipc_dir, IPC_MOUNT, false));
        mounts.push(VolumeMount::new(sessions_dir, SESSION_MOUNT, false));
        if let Some(credentials) = &self.config.container.credentials_file
            && credentials.is_file()
        {
            mounts.push(VolumeMount::new(credentials.clone(), CREDENTIALS_MOUNT, true));
        }

        for validated in self
            .mounts
            .validate_additional_mounts(additional, folder, input.is_main)
        {
            mounts.push(VolumeMount::new(
                validated.host_path,
                &validated.container_path,
                validated.effective_readonly,
            ));
        }
        Ok(mounts)
    }

    pub fn build_args(&self, container_name: &str, mounts: &[VolumeMount]) -> Vec<String> {
        let container = &self.config.container;
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            container_name.to_string(),
        ];
        for mount in mounts {
            args.push("-v".to_string());
            args.push(mount.to_arg());
        }
        args.push("-e".to_string());
        args.push(format!("TZ={}", self.config.timezone));
        for (key, value) in &container.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend(container.extra_args.iter().cloned());
        args.push(container.image.clone());
        args
    }

    async fn write_snapshots(&self, input: &WorkerInput) -> anyhow::Result<()> {
        let ipc_dir = self.config.ipc_folder_dir(&input.workspace_folder);
        let tasks = self.store.list_tasks().await?;
        snapshots::write_tasks_snapshot(&ipc_dir, &input.workspace_folder, input.is_main, &tasks)?;

        let chats = if input.is_main {
            self.store.list_chats().await?
        } else {
            Vec::new()
        };
        let registered: HashSet<String> = self.state.registered_chat_ids().into_iter().collect();
        snapshots::write_groups_snapshot(&ipc_dir, input.is_main, &chats, &registered)?;
        Ok(())
    }

    async fn execute(
        &self,
        input: &WorkerInput,
        container_name: &str,
        mounts: &[VolumeMount],
    ) -> Result<RunRecord, RunError> {
        let container = &self.config.container;
        let args = self.build_args(container_name, mounts);
        debug!("[runner] {} {}", container.runtime, args.join(" "));

        let mut child = Command::new(&container.runtime)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RunError::Spawn(format!("{}: {}", container.runtime, e)))?;
        let started = Instant::now();

        let cap = container.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(child.stdout.take(), cap));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take(), cap));

        // the write shares the wait's deadline: a worker that never reads stdin can fill the pipe
        let payload = serde_json::to_string(input).map_err(std::io::Error::other)?;
        let stdin_task = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // the worker may exit before reading; its exit status is reported below
                if let Err(e) = stdin.write_all(format!("{}\n", payload).as_bytes()).await {
                    warn!("[runner] Could not write worker input: {}", e);
                }
            })
        });

        let timeout = container.timeout();
        let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?.code(),
            Err(_) => {
                error!(
                    "[runner] Worker {} exceeded {} ms, killing it",
                    container_name, container.timeout_ms
                );
                child.kill().await.ok();
                stop_container(&container.runtime, container_name);
                if let Some(task) = stdin_task {
                    task.abort();
                }
                stdout_task.abort();
                stderr_task.abort();
                return Ok(RunRecord {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: String::new(),
                    truncated: false,
                    timed_out: true,
                    duration: started.elapsed(),
                });
            }
        };
        if let Some(task) = stdin_task {
            task.abort();
        }

        let (stdout, stdout_truncated) = join_reader(stdout_task).await;
        let (stderr, stderr_truncated) = join_reader(stderr_task).await;
        Ok(RunRecord {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            truncated: stdout_truncated || stderr_truncated,
            timed_out: false,
            duration: started.elapsed(),
        })
    }

    async fn write_run_log(
        &self,
        input: &WorkerInput,
        mounts: &[VolumeMount],
        record: &RunRecord,
        outcome: &Result<WorkerOutput, RunError>,
    ) {
        let logs_dir = self.config.group_dir(&input.workspace_folder).join("logs");
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = logs_dir.join(format!("worker-{}.log", stamp));

        let mut text = String::new();
        let _ = writeln!(text, "=== worker run ===");
        let _ = writeln!(text, "folder: {}", input.workspace_folder);
        let _ = writeln!(text, "chat: {}", input.chat_id);
        let _ = writeln!(text, "main: {}", input.is_main);
        let _ = writeln!(text, "scheduled: {}", input.is_scheduled_task);
        let _ = writeln!(text, "session: {}", input.session_id.as_deref().unwrap_or("-"));
        let _ = writeln!(text, "prompt bytes: {}", input.prompt.len());
        let _ = writeln!(text, "duration: {} ms", record.duration.as_millis());
        let _ = writeln!(
            text,
            "exit: {}",
            record
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        let _ = writeln!(text, "timed out: {}", record.timed_out);
        let _ = writeln!(text, "output truncated: {}", record.truncated);
        let _ = writeln!(text, "\n=== mounts ===");
        for mount in mounts {
            let _ = writeln!(text, "{}", mount.to_arg());
        }
        let _ = writeln!(text, "\n=== stderr ===\n{}", record.stderr);
        let failed = outcome.is_err();
        if failed || tracing::enabled!(tracing::Level::DEBUG) {
            let _ = writeln!(text, "\n=== stdout ===\n{}", record.stdout);
        }

        if let Err(e) = tokio::fs::write(&path, text).await {
            warn!("[runner] Could not write run log {:?}: {}", path, e);
        }
    }
}

#[async_trait]
impl WorkerRunner for ContainerRunner {
    async fn run(
        &self,
        input: WorkerInput,
        additional_mounts: &[MountRequest],
    ) -> Result<WorkerOutput, RunError> {
        let mounts = self.build_mounts(&input, additional_mounts)?;
        if let Err(e) = self.write_snapshots(&input).await {
            warn!(
                "[runner] Could not write snapshots for '{}': {:#}",
                input.workspace_folder, e
            );
        }

        let container_name = container_name(&input.workspace_folder);
        info!(
            "[runner] Spawning worker {} for '{}' ({} mount(s), main: {}, scheduled: {})",
            container_name,
            input.workspace_folder,
            mounts.len(),
            input.is_main,
            input.is_scheduled_task
        );

        let record = match self.execute(&input, &container_name, &mounts).await {
            Ok(record) => record,
            Err(e) => {
                error!("[runner] {}", e);
                return Err(e);
            }
        };

        let outcome = if record.timed_out {
            Err(RunError::Timeout(self.config.container.timeout_ms))
        } else {
            if record.truncated {
                warn!(
                    "[runner] Worker output for '{}' exceeded {} bytes and was truncated",
                    input.workspace_folder, self.config.container.max_output_bytes
                );
            }
            classify(record.exit_code, &record.stdout)
        };
        self.write_run_log(&input, &mounts, &record, &outcome).await;

        match &outcome {
            Ok(_) => info!(
                "[runner] Worker for '{}' finished in {} ms",
                input.workspace_folder,
                record.duration.as_millis()
            ),
            Err(e) => error!("[runner] Worker for '{}' failed: {}", input.workspace_folder, e),
        }
        outcome
    }
}

/// Map exit status and stdout onto the tagged result. A parseable payload wins over the exit code.
fn classify(exit_code: Option<i32>, stdout: &str) -> Result<WorkerOutput, RunError> {
    match parse_worker_output(stdout) {
        Ok(output) if output.status == WorkerStatus::Success => Ok(output),
        Ok(output) => Err(RunError::WorkerReported(
            output
                .error
                .unwrap_or_else(|| "no error message".to_string()),
        )),
        Err(_) if exit_code == Some(ENGINE_START_FAILURE) => Err(RunError::Spawn(format!(
            "container engine exited with code {}",
            ENGINE_START_FAILURE
        ))),
        Err(reason) => match exit_code {
            Some(0) => Err(RunError::Parse(reason)),
            Some(code) => Err(RunError::Exited { code }),
            None => Err(RunError::Exited { code: -1 }),
        },
    }
}

fn container_name(folder: &str) -> String {
    format!(
        "kestrel-{}-{}",
        folder.to_ascii_lowercase().replace('_', "-"),
        chrono::Utc::now().timestamp_millis()
    )
}

fn stop_container(runtime: &str, name: &str) {
    let runtime = runtime.to_string();
    let name = name.to_string();
    tokio::spawn(async move {
        let stop = Command::new(&runtime)
            .args(["stop", &name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(Duration::from_secs(15), stop).await {
            Ok(Ok(status)) if status.success() => debug!("[runner] Stopped {}", name),
            Ok(Ok(status)) => debug!("[runner] Stopping {} exited with {}", name, status),
            Ok(Err(e)) => warn!("[runner] Could not stop {}: {}", name, e),
            Err(_) => warn!("[runner] Timed out stopping {}", name),
        }
    });
}

/// Keep the first `cap` bytes and drain the rest so the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(
    reader: Option<R>,
    cap: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let mut truncated = false;
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..n.min(room)]);
        if n > room {
            truncated = true;
        }
    }
    Ok((buf, truncated))
}

async fn join_reader(
    task: tokio::task::JoinHandle<std::io::Result<(Vec<u8>, bool)>>,
) -> (Vec<u8>, bool) {
    match task.await {
        Ok(Ok(read)) => read,
        Ok(Err(e)) => {
            warn!("[runner] Reading worker output failed: {}", e);
            (Vec::new(), false)
        }
        Err(e) => {
            warn!("[runner] Output reader task failed: {}", e);
            (Vec::new(), false)
        }
    }
}

/// Confirm the container engine answers before the kernel starts dispatching.
pub async fn check_runtime(runtime: &str) -> anyhow::Result<()> {
    let probe = Command::new(runtime)
        .arg("info")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(Duration::from_secs(10), probe)
        .await
        .map_err(|_| anyhow::anyhow!("'{} info' did not answer within 10s", runtime))?
        .map_err(|e| anyhow::anyhow!("'{}' is not runnable: {}", runtime, e))?;
    if !output.status.success() {
        anyhow::bail!(
            "'{} info' failed: {}",
            runtime,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
