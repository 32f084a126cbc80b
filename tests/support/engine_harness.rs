use runengine::ports::{EnvironmentInstaller, PortFuture};
use runengine::{
    ArtifactSnapshot, ConfigurationVersionId, DirectoryConfigurationSource, EngineConfig,
    EngineError, EnvironmentBuilder, Hook, HookContext, HookRegistry, HookStage, QueueManager,
    RunEvent, RunId, RunStore,
};
use runengine::configuration::MANIFEST_FILE;
use runengine::Run;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

const TERMINAL_WAIT: Duration = Duration::from_secs(20);

/// Installer that lays out an empty environment instead of invoking pip.
#[derive(Default)]
pub struct FakeInstaller {
    pub creates: AtomicUsize,
    pub installs: AtomicUsize,
    pub fail_install: bool,
}

impl EnvironmentInstaller for FakeInstaller {
    fn create_environment<'a>(&'a self, target: &'a Path) -> PortFuture<'a, String> {
        Box::pin(async move {
            self.creates.fetch_add(1, Ordering::SeqCst);
            tokio::fs::create_dir_all(target.join("bin")).await?;
            Ok(format!("created {}", target.display()))
        })
    }

    fn install_dependencies<'a>(
        &'a self,
        _target: &'a Path,
        _dependency_manifest: &'a Path,
    ) -> PortFuture<'a, String> {
        Box::pin(async move {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if self.fail_install {
                return Err(EngineError::Execution(
                    "pip exited with status 1: ResolutionImpossible".to_string(),
                ));
            }
            Ok("Successfully installed openpyxl-3.1.2".to_string())
        })
    }

    fn freeze<'a>(&'a self, _target: &'a Path) -> PortFuture<'a, Vec<String>> {
        Box::pin(async { Ok(vec!["openpyxl==3.1.2".to_string()]) })
    }
}

/// In-process hook that records what it saw and optionally fails at one stage.
#[derive(Default)]
pub struct RecordingHook {
    pub calls: Mutex<Vec<(HookStage, Value)>>,
    pub fail_at: Option<HookStage>,
}

impl RecordingHook {
    pub fn failing_at(stage: HookStage) -> Self {
        Self {
            fail_at: Some(stage),
            ..Self::default()
        }
    }

    pub fn stages(&self) -> Vec<HookStage> {
        self.calls
            .lock()
            .map(|calls| calls.iter().map(|(stage, _)| *stage).collect())
            .unwrap_or_default()
    }
}

impl Hook for RecordingHook {
    fn invoke<'a>(
        &'a self,
        stage: HookStage,
        artifact: &'a ArtifactSnapshot,
        _context: &'a HookContext,
    ) -> PortFuture<'a, Option<Value>> {
        Box::pin(async move {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((stage, artifact.value().clone()));
            }
            if self.fail_at == Some(stage) {
                return Err(EngineError::Execution(format!("rejected artifact at {stage}")));
            }
            Ok(Some(json!({"checked": stage})))
        })
    }
}

pub struct Harness {
    pub temp: TempDir,
    pub configurations: PathBuf,
    pub environments: PathBuf,
    pub database_url: String,
    pub config: EngineConfig,
}

impl Harness {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let configurations = temp.path().join("configurations");
        let environments = temp.path().join("environments");
        let database_url = format!("sqlite://{}", temp.path().join("runs.db").display());
        let config = EngineConfig {
            database_url: database_url.clone(),
            configurations_root: configurations.clone(),
            environments_root: environments.clone(),
            max_concurrency: 2,
            max_queue_depth: 8,
            heartbeat_interval_ms: 100,
            stale_heartbeat_multiplier: 3,
            retry_after_ms: 750,
            hook_timeout_ms: 10_000,
            ..EngineConfig::default()
        };
        Ok(Self {
            temp,
            configurations,
            environments,
            database_url,
            config,
        })
    }

    /// Write a configuration version directory holding `manifest`.
    pub fn version(&self, id: &str, manifest: &Value) -> Result<ConfigurationVersionId, Box<dyn std::error::Error>> {
        let dir = self.configurations.join(id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(manifest)?)?;
        std::fs::write(dir.join("requirements.txt"), "openpyxl==3.1.2\n")?;
        Ok(ConfigurationVersionId::new(id))
    }

    pub async fn store(&self) -> Result<RunStore, EngineError> {
        RunStore::new(&self.database_url, self.config.max_concurrency).await
    }

    /// A fresh engine over this harness's database, as after a process restart.
    pub async fn engine(
        &self,
        installer: Arc<FakeInstaller>,
        registry: HookRegistry,
    ) -> Result<QueueManager, EngineError> {
        let store = self.store().await?;
        let environments = Arc::new(EnvironmentBuilder::new(
            store.clone(),
            Arc::new(DirectoryConfigurationSource::new(&self.configurations)),
            installer,
            registry,
            &self.environments,
            self.config.hook_timeout(),
        ));
        QueueManager::new(store, environments, &self.config)
    }
}

/// Shell entry point that reports the given phases, then prints a summary.
pub fn phased_entrypoint(phases: &[&str]) -> Value {
    let script = phases
        .iter()
        .map(|phase| {
            format!(
                r#"echo '{{"engine_event":"phase_complete","phase":"{phase}","artifact":{{"phase":"{phase}"}}}}'"#
            )
        })
        .chain(std::iter::once(
            r#"echo '{"engine_event":"summary","summary":{"rows":3}}'"#.to_string(),
        ))
        .collect::<Vec<_>>()
        .join("; ");
    json!(["sh", "-c", script])
}

pub async fn wait_for_terminal(engine: &QueueManager, run_id: &RunId) -> Result<Run, Box<dyn std::error::Error>> {
    let deadline = Instant::now() + TERMINAL_WAIT;
    loop {
        let run = engine.get(run_id).await?;
        if run.state.is_terminal() {
            return Ok(run);
        }
        if Instant::now() > deadline {
            return Err(format!("run {run_id} still {} after {TERMINAL_WAIT:?}", run.state).into());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Log events carrying a completed hook stage, in order.
pub fn reported_stages(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| event.detail.as_ref())
        .filter(|detail| detail.get("annotations").is_some())
        .filter_map(|detail| detail["stage"].as_str().map(str::to_string))
        .collect()
}

pub fn log_lines(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| event.detail.as_ref())
        .filter_map(|detail| detail.get("line").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
