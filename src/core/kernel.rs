//! Boot, run and shutdown wiring for the daemon.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::core::config::KernelConfig;
use crate::core::container::{ContainerRunner, WorkerRunner, check_runtime};
use crate::core::groups::GroupSync;
use crate::core::ipc::IpcWatcher;
use crate::core::lifecycle::{LifecycleManager, ServiceLoop, StateFlusher};
use crate::core::mounts::MountGuard;
use crate::core::router::MessageRouter;
use crate::core::scheduler::{TaskControl, TaskScheduler};
use crate::core::state::KernelState;
use crate::core::store::MessageStore;
use crate::interfaces::bridge::{Bridge, BridgeIngest, NullBridge, ProcessBridge};

const BRIDGE_EVENT_BUFFER: usize = 256;

pub struct Kernel {
    config: Arc<KernelConfig>,
    state: Arc<KernelState>,
    lifecycle: LifecycleManager,
}

impl Kernel {
    /// Opens persistent state and wires every loop into the lifecycle. Nothing runs yet.
    pub async fn boot(config: KernelConfig) -> Result<Self> {
        let config = Arc::new(config);
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("creating {}", config.data_dir.display()))?;

        let store = MessageStore::open(config.store_path()).await?;
        let state = Arc::new(KernelState::load(config.state_dir())?);
        let mounts = Arc::new(MountGuard::load(&config.allowlist_path()));
        info!(
            "[kernel] {} conversation(s) registered, allowlist {}",
            state.conversations().len(),
            if mounts.allowlist().is_some() {
                "loaded"
            } else {
                "absent (additional mounts denied)"
            }
        );

        let mut lifecycle = LifecycleManager::new().await?;
        lifecycle.attach(Arc::new(Mutex::new(StateFlusher::new(state.clone()))));
        lifecycle
            .add_state_heartbeat(state.clone(), Duration::from_secs(config.state_flush_secs))
            .await?;

        let process = if config.bridge.command.is_empty() {
            warn!("[kernel] No bridge command configured; outbound messages are dropped");
            None
        } else {
            Some(ProcessBridge::new(config.bridge.clone()))
        };
        let bridge: Arc<dyn Bridge> = match &process {
            Some(process) => process.clone(),
            None => Arc::new(NullBridge),
        };
        let groups = Arc::new(GroupSync::new(
            config.clone(),
            store.clone(),
            state.clone(),
            bridge.clone(),
        ));

        if let Some(process) = process {
            let (tx, rx) = mpsc::channel(BRIDGE_EVENT_BUFFER);
            let ingest = Arc::new(BridgeIngest::new(store.clone(), state.clone(), groups.clone()));
            lifecycle.attach(
                ServiceLoop::new("bridge", move |cancel| async move {
                    let consumer = ingest.spawn(rx, cancel.clone());
                    if let Err(e) = process.spawn(tx, cancel).await {
                        warn!("[bridge] Supervisor ended abnormally: {}", e);
                    }
                    consumer.await.ok();
                })
                .shared(),
            );
        }

        let runner: Arc<dyn WorkerRunner> = Arc::new(ContainerRunner::new(
            config.clone(),
            store.clone(),
            state.clone(),
            mounts,
        ));
        let tasks = Arc::new(TaskControl::new(store.clone(), state.clone(), config.tz()));

        let router = Arc::new(MessageRouter::new(
            config.clone(),
            store.clone(),
            state.clone(),
            bridge.clone(),
            runner.clone(),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            config.clone(),
            store,
            state.clone(),
            runner,
        ));
        let watcher = Arc::new(IpcWatcher::new(
            config.clone(),
            state.clone(),
            bridge,
            tasks,
            groups,
        ));

        lifecycle.attach(ServiceLoop::new("router", move |cancel| router.run(cancel)).shared());
        lifecycle.attach(ServiceLoop::new("scheduler", move |cancel| scheduler.run(cancel)).shared());
        lifecycle.attach(ServiceLoop::new("ipc", move |cancel| watcher.run(cancel)).shared());

        Ok(Self {
            config,
            state,
            lifecycle,
        })
    }

    /// Runs until Ctrl-C, then stops every loop and flushes state.
    pub async fn run(mut self) -> Result<()> {
        if let Err(e) = check_runtime(&self.config.container.runtime).await {
            warn!(
                "[kernel] Container runtime '{}' is not reachable, workers will fail: {:#}",
                self.config.container.runtime, e
            );
        }

        self.lifecycle.start().await?;
        info!(
            "[kernel] {} is up (data dir {:?})",
            self.config.assistant_name, self.config.data_dir
        );

        tokio::signal::ctrl_c().await?;
        info!("[kernel] Shutting down");
        self.lifecycle.shutdown().await?;
        self.state.flush()?;
        Ok(())
    }
}
