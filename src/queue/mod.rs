//! The coordinator: admission, scheduling, heartbeats and recovery.

mod rehydrate;
mod stream;
mod worker;

pub use rehydrate::{recover_stale_runs, RecoveryReport};
pub use stream::FOLLOW_POLL_INTERVAL;

use crate::config::EngineConfig;
use crate::configuration::DirectoryConfigurationSource;
use crate::db::{Admission, RunStore};
use crate::environment::{EnvironmentBuilder, PythonVenvInstaller};
use crate::error::{EngineError, Result};
use crate::hooks::HookRegistry;
use crate::runner::{CancelSignal, ExecutionRunner, RunnerSettings};
use crate::types::{
    ActivationState, ConfigurationEnvironment, ConfigurationVersionId, NewRunEvent, Run, RunEvent,
    RunEventType, RunId, RunState, RunStatusView, SubmitRequest,
};
use chrono::Utc;
use futures_util::stream::BoxStream;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1_024;
const MAX_IDLE_POLL: Duration = Duration::from_millis(500);

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancelAck {
    /// The run had not started and is now cancelled.
    Cancelled,
    /// The run is executing; its worker stops at the next safe point.
    Requested,
    /// Nothing to do.
    AlreadyTerminal { state: RunState },
}

pub(crate) struct QueueInner {
    store: RunStore,
    environments: Arc<EnvironmentBuilder>,
    runner: ExecutionRunner,
    max_concurrency: u32,
    admission_capacity: u32,
    retry_after_ms: u64,
    heartbeat_interval: Duration,
    stale_after: Duration,
    idle_poll: Duration,
    admission: Mutex<()>,
    accepting: AtomicBool,
    wake: Notify,
    events: broadcast::Sender<RunEvent>,
    cancels: Mutex<HashMap<RunId, CancelSignal>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    instance_id: String,
}

impl QueueInner {
    fn publish(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    async fn track_cancel(&self, run_id: RunId, signal: CancelSignal) {
        self.cancels.lock().await.insert(run_id, signal);
    }

    async fn untrack_cancel(&self, run_id: &RunId) {
        self.cancels.lock().await.remove(run_id);
    }
}

/// Explicitly owned engine coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<QueueInner>,
}

impl QueueManager {
    /// # Errors
    /// Returns `EngineError::Config` if `config` is invalid.
    pub fn new(
        store: RunStore,
        environments: Arc<EnvironmentBuilder>,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let runner = ExecutionRunner::new(
            environments.clone(),
            RunnerSettings {
                safe_mode: config.safe_mode,
                hook_timeout: config.hook_timeout(),
                max_log_line_bytes: config.max_log_line_bytes,
            },
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);
        let instance = uuid::Uuid::new_v4().simple().to_string();

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                environments,
                runner,
                max_concurrency: config.max_concurrency,
                admission_capacity: config.admission_capacity(),
                retry_after_ms: config.retry_after_ms,
                heartbeat_interval: config.heartbeat_interval(),
                stale_after: config.stale_after(),
                idle_poll: config.heartbeat_interval().min(MAX_IDLE_POLL),
                admission: Mutex::new(()),
                accepting: AtomicBool::new(true),
                wake: Notify::new(),
                events,
                cancels: Mutex::new(HashMap::new()),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                instance_id: format!("{}-{}", std::process::id(), &instance[..8]),
            }),
        })
    }

    /// Wire the engine from configuration: SQLite store, directory-backed
    /// configuration versions and `venv` environments.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the store cannot be opened.
    pub async fn open(config: &EngineConfig, registry: HookRegistry) -> Result<Self> {
        config.validate()?;
        let store = RunStore::new(&config.database_url, config.max_concurrency).await?;
        let environments = Arc::new(EnvironmentBuilder::new(
            store.clone(),
            Arc::new(DirectoryConfigurationSource::new(&config.configurations_root)),
            Arc::new(PythonVenvInstaller::new(&config.python_bin)),
            registry,
            &config.environments_root,
            config.hook_timeout(),
        ));
        Self::new(store, environments, config)
    }

    #[must_use]
    pub fn store(&self) -> &RunStore {
        &self.inner.store
    }

    /// Admit a run. It is persisted as `queued` before any worker can see it.
    ///
    /// # Errors
    /// - `Saturated` when `max_concurrency + max_queue_depth` runs are outstanding
    /// - `NotFound` for an unknown configuration version
    /// - `EnvironmentBuild` when the version's activation failed
    /// - `ShuttingDown` once [`shutdown`](Self::shutdown) has begun
    pub async fn submit(&self, request: SubmitRequest) -> Result<Run> {
        self.check_runnable(&request.configuration_version_id).await?;
        let run = Run::new_queued(&request, Utc::now());
        let enqueue = NewRunEvent::new(RunEventType::Enqueue, RunState::Queued).with_detail(json!({
            "configuration_version_id": run.configuration_version_id,
            "mode": run.mode.as_str(),
        }));
        self.admit(run, vec![enqueue]).await
    }

    /// Queue a new attempt of a terminal run.
    ///
    /// # Errors
    /// Returns `Conflict` if the source run is not terminal, plus every error of
    /// [`submit`](Self::submit).
    pub async fn retry(&self, run_id: &RunId) -> Result<Run> {
        let source = self.get(run_id).await?;
        if !source.state.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "run {run_id} is {} and cannot be retried until it finishes",
                source.state
            )));
        }

        self.check_runnable(&source.configuration_version_id).await?;
        let next = source.next_attempt(Utc::now());
        let retry = NewRunEvent::new(RunEventType::Retry, RunState::Queued).with_detail(json!({
            "retry_of_run_id": source.id,
            "previous_state": source.state,
            "attempt": next.attempt,
        }));
        let enqueue = NewRunEvent::new(RunEventType::Enqueue, RunState::Queued).with_detail(json!({
            "configuration_version_id": next.configuration_version_id,
            "mode": next.mode.as_str(),
        }));
        self.admit(next, vec![retry, enqueue]).await
    }

    async fn check_runnable(&self, id: &ConfigurationVersionId) -> Result<()> {
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        self.inner.environments.source().load(id).await?;
        match self.inner.environments.activation_state(id).await? {
            Some(ActivationState::Failed(failure)) => Err(failure.to_error()),
            Some(ActivationState::Ready(_)) | None => Ok(()),
        }
    }

    async fn admit(&self, run: Run, events: Vec<NewRunEvent>) -> Result<Run> {
        let _admission = self.inner.admission.lock().await;
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        match self
            .inner
            .store
            .admit_run(&run, self.inner.admission_capacity, &events)
            .await?
        {
            Admission::Admitted(persisted) => {
                persisted.into_iter().for_each(|event| self.inner.publish(event));
                self.inner.wake.notify_one();
                info!(run_id = %run.id, attempt = run.attempt, configuration_version_id = %run.configuration_version_id, "Run queued");
                self.get(&run.id).await
            }
            Admission::Saturated { outstanding } => {
                info!(outstanding, capacity = self.inner.admission_capacity, "Run rejected: queue saturated");
                Err(EngineError::Saturated {
                    queue_size: outstanding,
                    max_concurrency: self.inner.max_concurrency,
                    retry_after_ms: self.inner.retry_after_ms,
                })
            }
        }
    }

    /// # Errors
    /// Returns `NotFound` for an unknown run.
    pub async fn get(&self, run_id: &RunId) -> Result<Run> {
        self.inner
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
    }

    /// # Errors
    /// Returns `NotFound` for an unknown run.
    pub async fn status(&self, run_id: &RunId) -> Result<RunStatusView> {
        self.get(run_id).await.map(|run| run.status_view())
    }

    /// Ask a run to stop. Queued runs are cancelled immediately; running runs
    /// stop at their worker's next safe point.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown run.
    pub async fn cancel_request(&self, run_id: &RunId) -> Result<CancelAck> {
        let run = self.get(run_id).await?;
        if run.state.is_terminal() {
            return Ok(CancelAck::AlreadyTerminal { state: run.state });
        }

        if run.state == RunState::Queued {
            let exit = NewRunEvent::new(RunEventType::Exit, RunState::Cancelled)
                .with_detail(json!({"reason": "cancelled before start", "exit_code": null}));
            if let Some((_, events)) = self.inner.store.cancel_queued_run(run_id, &[exit]).await? {
                events.into_iter().for_each(|event| self.inner.publish(event));
                info!(run_id = %run_id, "Queued run cancelled");
                return Ok(CancelAck::Cancelled);
            }
        }

        if self.inner.store.request_cancel(run_id).await? {
            if let Some(signal) = self.inner.cancels.lock().await.get(run_id) {
                signal.request();
            }
            info!(run_id = %run_id, "Cancellation requested");
            return Ok(CancelAck::Requested);
        }

        let current = self.get(run_id).await?;
        Ok(CancelAck::AlreadyTerminal { state: current.state })
    }

    /// Persisted events of a run, in sequence order.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown run.
    pub async fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        self.get(run_id).await?;
        self.inner.store.events(run_id).await
    }

    /// Replay a run's events from storage, then follow new ones until the
    /// terminal `exit` event.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown run.
    pub async fn event_stream(&self, run_id: &RunId) -> Result<BoxStream<'static, Result<RunEvent>>> {
        self.get(run_id).await?;
        let live = self.inner.events.subscribe();
        stream::follow_events(self.inner.store.clone(), *run_id, Some(live)).await
    }

    /// Every attempt in the retry lineage containing `run_id`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown run and `Internal` for a lineage without a root.
    pub async fn lineage(&self, run_id: &RunId) -> Result<Vec<Run>> {
        self.get(run_id).await?;
        let lineage = self.inner.store.lineage(run_id).await?;
        if lineage.iter().any(|run| run.id == *run_id) {
            Ok(lineage)
        } else {
            Err(EngineError::Internal(format!(
                "retry lineage of run {run_id} has no root"
            )))
        }
    }

    /// Build (or reuse) the version's environment and run `on_activate`.
    ///
    /// # Errors
    /// Returns `EnvironmentBuild` naming the failing step.
    pub async fn activate(&self, id: &ConfigurationVersionId) -> Result<ConfigurationEnvironment> {
        self.inner.environments.build(id).await
    }

    /// Like [`activate`](Self::activate) but fails with `Conflict` while the
    /// version is already being built.
    ///
    /// # Errors
    /// Returns `Conflict` while a build of the same version is in progress.
    pub async fn try_activate(&self, id: &ConfigurationVersionId) -> Result<ConfigurationEnvironment> {
        self.inner.environments.try_build(id).await
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn activation_state(
        &self,
        id: &ConfigurationVersionId,
    ) -> Result<Option<ActivationState>> {
        self.inner.environments.activation_state(id).await
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn outstanding(&self) -> Result<u32> {
        self.inner.store.outstanding_count().await
    }

    /// One recovery pass over stale `running` runs.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn recover_stale(&self) -> Result<RecoveryReport> {
        let mut published = Vec::new();
        let report =
            recover_stale_runs(&self.inner.store, self.inner.stale_after, &mut published).await?;
        published.into_iter().for_each(|event| self.inner.publish(event));
        if !report.requeued.is_empty() {
            self.inner.wake.notify_waiters();
        }
        Ok(report)
    }

    /// Rehydrate stale runs, then start `max_concurrency` workers and the
    /// periodic stale-run sweeper.
    ///
    /// # Errors
    /// Returns `Conflict` if already started and any error of the recovery pass.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let mut tasks = self.inner.tasks.lock().await;
        if !tasks.is_empty() {
            return Err(EngineError::Conflict("worker pool already started".to_string()));
        }
        if !self.inner.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }

        let report = self.recover_stale().await?;

        tasks.extend((1..=self.inner.max_concurrency).map(|n| {
            tokio::spawn(worker::worker_loop(
                self.inner.clone(),
                format!("{}-w{n}", self.inner.instance_id),
                self.inner.shutdown.subscribe(),
            ))
        }));
        tasks.push(tokio::spawn(sweeper_loop(
            self.clone(),
            self.inner.shutdown.subscribe(),
        )));

        info!(
            workers = self.inner.max_concurrency,
            requeued = report.requeued.len(),
            "Worker pool started"
        );
        Ok(report)
    }

    /// Stop admitting, let in-flight runs finish, and join every task.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let _admission = self.inner.admission.lock().await;
        let _ = self.inner.shutdown.send(true);
        self.inner.wake.notify_waiters();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        info!(tasks = tasks.len(), "Draining worker pool");
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn sweeper_loop(manager: QueueManager, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(manager.inner.stale_after);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = manager.recover_stale().await {
                    warn!(error = %e, "Stale run sweep failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
