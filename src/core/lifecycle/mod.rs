use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::state::KernelState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LifecycleState {
    Init,
    Starting,
    Ready,
    Shutdown,
}

#[async_trait::async_trait]
pub trait LifecycleComponent {
    fn name(&self) -> &str;
    async fn on_init(&mut self) -> Result<()> {
        Ok(())
    }
    async fn on_start(&mut self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }
    async fn on_shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

pub type SharedComponent = Arc<Mutex<dyn LifecycleComponent + Send + Sync>>;

type LoopFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
type LoopStarter = Box<dyn FnOnce(CancellationToken) -> LoopFuture + Send + Sync>;

/// A poll loop owned by the lifecycle: spawned on start, awaited on shutdown.
pub struct ServiceLoop {
    name: String,
    starter: Option<LoopStarter>,
    handle: Option<JoinHandle<()>>,
}

impl ServiceLoop {
    pub fn new<F, Fut>(name: &str, starter: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            starter: Some(Box::new(move |cancel| Box::pin(starter(cancel)))),
            handle: None,
        }
    }

    pub fn shared(self) -> SharedComponent {
        Arc::new(Mutex::new(self))
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for ServiceLoop {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self, cancel: CancellationToken) -> Result<()> {
        if let Some(starter) = self.starter.take() {
            self.handle = Some(tokio::spawn(starter(cancel)));
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.await?;
        }
        Ok(())
    }
}

/// Flushes State last, after every loop that writes to it has stopped.
pub struct StateFlusher {
    state: Arc<KernelState>,
}

impl StateFlusher {
    pub fn new(state: Arc<KernelState>) -> Self {
        Self { state }
    }
}

#[async_trait::async_trait]
impl LifecycleComponent for StateFlusher {
    fn name(&self) -> &str {
        "state"
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.state.flush()
    }
}

pub struct LifecycleManager {
    state: LifecycleState,
    components: Vec<SharedComponent>,
    cancel: CancellationToken,
    pub scheduler: JobScheduler,
}

impl LifecycleManager {
    pub async fn new() -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            state: LifecycleState::Init,
            components: Vec::new(),
            cancel: CancellationToken::new(),
            scheduler,
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Components start in attach order and shut down in reverse.
    pub fn attach(&mut self, component: SharedComponent) {
        self.components.push(component);
    }

    /// Registers the periodic State flush on the job scheduler.
    pub async fn add_state_heartbeat(&mut self, state: Arc<KernelState>, every: Duration) -> Result<()> {
        let job = Job::new_repeated_async(every.max(Duration::from_secs(1)), move |_uuid, _l| {
            let state = state.clone();
            Box::pin(async move {
                if let Err(e) = state.flush() {
                    warn!("[state] Heartbeat flush failed: {:#}", e);
                }
            })
        })?;
        self.scheduler.add(job).await?;
        debug!("[lifecycle] State heartbeat every {:?}", every);
        Ok(())
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Init");
        self.state = LifecycleState::Init;
        for comp in &self.components {
            comp.lock().await.on_init().await?;
        }

        info!("Lifecycle Phase: Starting");
        self.state = LifecycleState::Starting;
        for comp in &self.components {
            let mut comp = comp.lock().await;
            debug!("[lifecycle] Starting {}", comp.name());
            comp.on_start(self.cancel.child_token()).await?;
        }

        info!("Lifecycle Phase: Ready (Starting Scheduler)");
        self.scheduler.start().await?;
        self.state = LifecycleState::Ready;

        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Lifecycle Phase: Shutdown");
        self.state = LifecycleState::Shutdown;
        self.cancel.cancel();

        if let Err(e) = self.scheduler.shutdown().await {
            warn!("Job scheduler shutdown error: {}", e);
        }
        for comp in self.components.iter().rev() {
            let mut comp = comp.lock().await;
            if let Err(e) = comp.on_shutdown().await {
                warn!("Component {} shutdown error: {}", comp.name(), e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn loops_stop_on_shutdown_and_state_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(KernelState::load(dir.path()).unwrap());
        state.set_session("main", "sess-9");

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let mut lifecycle = LifecycleManager::new().await.unwrap();
        lifecycle.attach(Arc::new(Mutex::new(StateFlusher::new(state.clone()))));
        lifecycle.attach(
            ServiceLoop::new("idle", move |cancel| async move {
                cancel.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            })
            .shared(),
        );

        lifecycle.start().await.unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Ready);
        lifecycle.shutdown().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(lifecycle.state(), LifecycleState::Shutdown);

        let reloaded = KernelState::load(dir.path()).unwrap();
        assert_eq!(reloaded.session("main").as_deref(), Some("sess-9"));
    }
}
