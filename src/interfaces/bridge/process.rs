use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Bridge, BridgeConfig, BridgeEvent, Presence};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Connecting,
    Connected,
    /// Waiting before restart attempt `n`.
    BackingOff(u32),
}

/// Exponential delay for restart `attempt` (1-based), capped at `max_ms`, plus up to 10% jitter.
pub fn backoff_delay(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(30);
    let raw = base_ms.saturating_mul(1u64 << exponent).min(max_ms);
    let jitter = if raw >= 10 {
        rand::thread_rng().gen_range(0..=raw / 10)
    } else {
        0
    };
    Duration::from_millis(raw.saturating_add(jitter).min(max_ms.max(base_ms)))
}

type Pending = HashMap<String, oneshot::Sender<std::result::Result<Value, String>>>;

/// A bridge running as a supervised child process speaking JSON lines on stdio.
pub struct ProcessBridge {
    config: BridgeConfig,
    state_tx: watch::Sender<BridgeState>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pending: Mutex<Pending>,
    next_request: AtomicU64,
}

impl ProcessBridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(BridgeState::Stopped);
        Arc::new(Self {
            config,
            state_tx,
            stdin: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        })
    }

    pub fn state(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    /// Start the supervisor. It restarts the child on exit until `cancel` fires.
    pub fn spawn(
        self: &Arc<Self>,
        events: mpsc::Sender<BridgeEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let bridge = Arc::clone(self);
        tokio::spawn(async move { bridge.supervise(events, cancel).await })
    }

    async fn supervise(self: Arc<Self>, events: mpsc::Sender<BridgeEvent>, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        let stable_after = Duration::from_millis(self.config.backoff_max_ms);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.state_tx.send_replace(BridgeState::Connecting);
            let started = Instant::now();

            match self.spawn_child() {
                Ok(child) => {
                    info!("[bridge] Started {:?}", self.config.command);
                    if self.run_child(child, &events, &cancel).await {
                        break;
                    }
                    if started.elapsed() >= stable_after {
                        attempt = 0;
                    }
                }
                Err(e) => error!("[bridge] Could not start {:?}: {:#}", self.config.command, e),
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff_delay(attempt, self.config.backoff_base_ms, self.config.backoff_max_ms);
            self.state_tx.send_replace(BridgeState::BackingOff(attempt));
            warn!(
                "[bridge] Restarting in {} ms (attempt {})",
                delay.as_millis(),
                attempt
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state_tx.send_replace(BridgeState::Stopped);
        info!("[bridge] Supervisor stopped");
    }

    fn spawn_child(&self) -> Result<Child> {
        let Some((program, args)) = self.config.command.split_first() else {
            bail!("bridge command is empty");
        };
        Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {}", program))
    }

    /// Pump one child until its stdout closes. Returns `true` when stopped by cancellation.
    async fn run_child(
        &self,
        mut child: Child,
        events: &mpsc::Sender<BridgeEvent>,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(stdout) = child.stdout.take() else {
            error!("[bridge] Child has no stdout pipe");
            let _ = child.start_kill();
            return false;
        };
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[bridge] stderr: {}", line);
                }
            });
        }
        *self.stdin.lock().await = child.stdin.take();
        self.state_tx.send_replace(BridgeState::Connected);

        let mut lines = BufReader::new(stdout).lines();
        let cancelled = loop {
            tokio::select! {
                _ = cancel.cancelled() => break true,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line, events).await,
                    Ok(None) => break false,
                    Err(e) => {
                        warn!("[bridge] Reading stdout failed: {}", e);
                        break false;
                    }
                },
            }
        };

        *self.stdin.lock().await = None;
        // dropping the senders fails every in-flight request
        self.pending.lock().clear();

        let _ = child.start_kill();
        match child.wait().await {
            Ok(status) if !cancelled => warn!("[bridge] Process exited ({})", status),
            Ok(_) => info!("[bridge] Process stopped"),
            Err(e) => warn!("[bridge] Waiting for process failed: {}", e),
        }
        cancelled
    }

    async fn handle_line(&self, line: &str, events: &mpsc::Sender<BridgeEvent>) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(_) => {
                debug!("[bridge] {}", line);
                return;
            }
        };

        if value.get("type").and_then(Value::as_str) == Some("response") {
            self.complete_request(&value);
            return;
        }

        match serde_json::from_value::<BridgeEvent>(value) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    debug!("[bridge] Event receiver gone, dropping event");
                }
            }
            Err(e) => warn!("[bridge] Ignoring unrecognized line: {}", e),
        }
    }

    fn complete_request(&self, value: &Value) {
        let Some(id) = value.get("requestId").and_then(Value::as_str) else {
            warn!("[bridge] Response without requestId");
            return;
        };
        let Some(sender) = self.pending.lock().remove(id) else {
            debug!("[bridge] Late response for {}", id);
            return;
        };
        let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
        let outcome = if ok {
            Ok(value.get("data").cloned().unwrap_or(Value::Null))
        } else {
            Err(value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("bridge reported failure")
                .to_string())
        };
        let _ = sender.send(outcome);
    }

    async fn request(&self, op: &str, mut body: Value) -> Result<Value> {
        if *self.state_tx.borrow() != BridgeState::Connected {
            bail!("bridge is not connected");
        }

        let request_id = format!("req-{}", self.next_request.fetch_add(1, Ordering::Relaxed));
        if let Some(obj) = body.as_object_mut() {
            obj.insert("op".to_string(), Value::String(op.to_string()));
            obj.insert("requestId".to_string(), Value::String(request_id.clone()));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.as_mut() {
                Some(stdin) => {
                    let line = format!("{}\n", body);
                    match stdin.write_all(line.as_bytes()).await {
                        Ok(()) => stdin.flush().await.map_err(anyhow::Error::from),
                        Err(e) => Err(e.into()),
                    }
                }
                None => Err(anyhow!("bridge is not connected")),
            }
        };
        if let Err(e) = written {
            self.pending.lock().remove(&request_id);
            return Err(e.context(format!("sending {} to bridge", op)));
        }

        let timeout = Duration::from_millis(self.config.request_timeout_ms.max(1));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(message))) => bail!("bridge {} failed: {}", op, message),
            Ok(Err(_)) => bail!("bridge exited before answering {}", op),
            Err(_) => {
                self.pending.lock().remove(&request_id);
                bail!("bridge did not answer {} within {} ms", op, timeout.as_millis())
            }
        }
    }
}

#[async_trait]
impl Bridge for ProcessBridge {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<()> {
        self.request("send_message", json!({ "chatId": chat_id, "text": text }))
            .await
            .map(|_| ())
    }

    async fn send_presence(&self, chat_id: &str, presence: Presence) -> Result<()> {
        self.request(
            "send_presence",
            json!({ "chatId": chat_id, "presence": presence }),
        )
        .await
        .map(|_| ())
    }

    async fn fetch_groups(&self) -> Result<HashMap<String, String>> {
        let data = self.request("fetch_groups", json!({})).await?;
        let groups = data.get("groups").cloned().unwrap_or(data);
        serde_json::from_value(groups).context("decoding fetch_groups response")
    }

    async fn place_call(&self, chat_id: &str, reason: &str) -> Result<()> {
        self.request("place_call", json!({ "chatId": chat_id, "reason": reason }))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::bridge::ConnectionStatus;

    fn config(command: &[&str]) -> BridgeConfig {
        BridgeConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            request_timeout_ms: 5_000,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..20 {
            let first = backoff_delay(1, 1_000, 60_000).as_millis();
            assert!((1_000..=1_100).contains(&first), "{first}");
            let third = backoff_delay(3, 1_000, 60_000).as_millis();
            assert!((4_000..=4_400).contains(&third), "{third}");
            assert_eq!(backoff_delay(40, 1_000, 60_000).as_millis(), 60_000);
        }
    }

    #[tokio::test]
    async fn requests_fail_fast_when_disconnected() {
        let bridge = ProcessBridge::new(config(&["true"]));
        let err = bridge.send_message("a@s", "hi").await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn relays_events_and_answers_requests() {
        let script = r#"echo '{"type":"connection","status":"open"}'
while read line; do
  id=$(echo "$line" | sed -n 's/.*"requestId":"\([^"]*\)".*/\1/p')
  echo "{\"type\":\"response\",\"requestId\":\"$id\",\"ok\":true,\"data\":{\"groups\":{\"g@g.us\":\"Family\"}}}"
done"#;
        let bridge = ProcessBridge::new(config(&["sh", "-c", script]));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = bridge.spawn(tx, cancel.clone());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            BridgeEvent::Connection {
                status: ConnectionStatus::Open
            }
        );

        let groups = bridge.fetch_groups().await.unwrap();
        assert_eq!(groups.get("g@g.us").map(String::as_str), Some("Family"));
        bridge.send_message("g@g.us", "hello").await.unwrap();

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(*bridge.state().borrow(), BridgeState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crashing_child_is_restarted_with_backoff() {
        let bridge = ProcessBridge::new(config(&["sh", "-c", "exit 1"]));
        let mut state = bridge.state();
        let (tx, _rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = bridge.spawn(tx, cancel.clone());

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, BridgeState::BackingOff(n) if *n >= 2)),
        )
        .await
        .unwrap()
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
    }
}
