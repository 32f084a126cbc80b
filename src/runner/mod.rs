//! Executes one run inside its configuration's environment.

mod output;
mod protocol;

pub use output::{truncate_line, OutputLine, OutputStream};
pub use protocol::{parse_engine_message, EngineMessage};

use crate::configuration::ConfigurationVersion;
use crate::diagnostics::{classify_failure_category, redact_sensitive};
use crate::environment::EnvironmentBuilder;
use crate::error::{EngineError, Result};
use crate::hooks::{ArtifactSnapshot, HookContext, HookPipeline, StageReport};
use crate::ports::RunEventSink;
use crate::process::{describe_exit, CommandSpec, ProcessEnvironment};
use crate::timing::elapsed_ms;
use crate::types::{HookStage, NewRunEvent, Run, RunMode, RunOutcome, RunState};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const STDERR_TAIL_LINES: usize = 20;

/// Cooperative cancellation flag, checked only at safe points.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub safe_mode: bool,
    pub hook_timeout: Duration,
    pub max_log_line_bytes: usize,
}

pub struct ExecutionRunner {
    environments: Arc<EnvironmentBuilder>,
    settings: RunnerSettings,
}

impl ExecutionRunner {
    #[must_use]
    pub const fn new(environments: Arc<EnvironmentBuilder>, settings: RunnerSettings) -> Self {
        Self {
            environments,
            settings,
        }
    }

    /// Execute `run` to a terminal outcome. Failures never escape as errors:
    /// they become a `failed` outcome carrying a category and diagnostic.
    pub async fn run(&self, run: &Run, cancel: &CancelSignal, sink: &dyn RunEventSink) -> RunOutcome {
        let started = Instant::now();
        match self.execute(run, cancel, sink, started).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(run_id = %run.id, error = %error, "Run failed");
                outcome_for_error(&error)
            }
        }
    }

    async fn execute(
        &self,
        run: &Run,
        cancel: &CancelSignal,
        sink: &dyn RunEventSink,
        started: Instant,
    ) -> Result<RunOutcome> {
        if cancel.is_requested() {
            return Ok(RunOutcome::cancelled(None));
        }

        if self.settings.safe_mode {
            emit_message(sink, started, "safe mode enabled: execution skipped").await?;
            return Ok(RunOutcome::succeeded(0, Some(json!({"safe_mode": true}))));
        }

        let version = self
            .environments
            .source()
            .load(&run.configuration_version_id)
            .await?;
        let mut pipeline = HookPipeline::resolve(&version, self.environments.registry())?;

        if run.mode == RunMode::ValidateOnly {
            emit_message(sink, started, "validate-only run: execution skipped").await?;
            return Ok(RunOutcome::succeeded(
                0,
                Some(json!({"mode": RunMode::ValidateOnly.as_str()})),
            ));
        }

        let environment = self.environments.ensure(&run.configuration_version_id).await?;
        let process_environment =
            ProcessEnvironment::for_environment(&environment.environment_path, version.manifest.allow_network)
                .with_var("RUNENGINE_RUN_ID", run.id.to_string())
                .with_var("RUNENGINE_ATTEMPT", run.attempt.to_string())
                .with_var("RUNENGINE_CONFIG_DIR", version.root.to_string_lossy().into_owned());
        let context = HookContext {
            configuration_version_id: run.configuration_version_id.clone(),
            run_id: Some(run.id),
            working_dir: version.root.clone(),
            environment: process_environment.clone(),
            timeout: self.settings.hook_timeout,
        };

        let spec = CommandSpec::from_argv(&version.manifest.entrypoint, Duration::MAX)?
            .with_cwd(version.root.clone())
            .with_stdin(serde_json::to_vec(&run.input)?)
            .with_environment(process_environment);

        let mut execution = Execution {
            run,
            sink,
            cancel,
            context: &context,
            pipeline: &mut pipeline,
            started,
            artifact: ArtifactSnapshot::freeze(json!({
                "run_id": run.id,
                "attempt": run.attempt,
                "input": run.input,
            })),
            summary: None,
        };
        let outcome = execution
            .drive(&spec, &version, self.settings.max_log_line_bytes)
            .await
            .unwrap_or_else(|error| {
                warn!(run_id = %run.id, error = %error, "Run failed");
                outcome_for_error(&error)
            });
        Ok(outcome.with_annotations(pipeline.annotations()))
    }
}

struct Execution<'a> {
    run: &'a Run,
    sink: &'a dyn RunEventSink,
    cancel: &'a CancelSignal,
    context: &'a HookContext,
    pipeline: &'a mut HookPipeline,
    started: Instant,
    artifact: ArtifactSnapshot,
    summary: Option<Value>,
}

impl Execution<'_> {
    async fn drive(
        &mut self,
        spec: &CommandSpec,
        version: &ConfigurationVersion,
        max_log_line_bytes: usize,
    ) -> Result<RunOutcome> {
        if !self.advance_through(HookStage::OnJobStart).await? {
            return Ok(RunOutcome::cancelled(None));
        }
        self.run_entrypoint(spec, version, max_log_line_bytes).await
    }

    /// Run every not-yet-run stage up to and including `target`, emitting one
    /// event per stage. Returns `false` if cancellation was observed between stages.
    async fn advance_through(&mut self, target: HookStage) -> Result<bool> {
        while let Some(stage) = self.pipeline.next_stage().filter(|next| *next <= target) {
            if self.cancel.is_requested() {
                return Ok(false);
            }
            debug!(run_id = %self.run.id, stage = %stage, "Entering hook stage");
            let report = self.pipeline.run_next_stage(&self.artifact, self.context).await?;
            self.emit_stage(&report).await?;
        }
        Ok(!self.cancel.is_requested())
    }

    async fn emit_stage(&self, report: &StageReport) -> Result<()> {
        self.sink
            .emit(NewRunEvent::log(
                RunState::Running,
                report.to_detail(),
                elapsed_ms(self.started),
            ))
            .await
    }

    async fn run_entrypoint(
        &mut self,
        spec: &CommandSpec,
        version: &ConfigurationVersion,
        max_log_line_bytes: usize,
    ) -> Result<RunOutcome> {
        let mut child = spec
            .command()
            .spawn()
            .map_err(|e| EngineError::Execution(format!("Failed to spawn {}: {e}", spec.program)))?;
        info!(run_id = %self.run.id, program = %spec.program, configuration_version_id = %version.id, "Entry point started");

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
                let _ = stdin.shutdown().await;
            });
        }

        let (tx, mut rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Some(stdout) = child.stdout.take() {
            output::spawn_line_reader(stdout, OutputStream::Stdout, max_log_line_bytes, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            output::spawn_line_reader(stderr, OutputStream::Stderr, max_log_line_bytes, tx.clone());
        }
        drop(tx);

        let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Some(line) = rx.recv().await {
            if let Err(error) = self.handle_line(&line, &mut stderr_tail).await {
                terminate(&mut child).await;
                return Err(error);
            }
            if self.cancel.is_requested() {
                terminate(&mut child).await;
                info!(run_id = %self.run.id, "Cancellation observed; entry point stopped");
                return Ok(RunOutcome::cancelled(None));
            }
        }

        let status = child.wait().await?;
        if self.cancel.is_requested() {
            return Ok(RunOutcome::cancelled(status.code()));
        }

        if !status.success() {
            let tail = stderr_tail.into_iter().collect::<Vec<_>>().join("\n");
            let message = if tail.is_empty() {
                format!("entry point {}", describe_exit(status))
            } else {
                format!("entry point {}: {}", describe_exit(status), redact_sensitive(&tail))
            };
            return Ok(RunOutcome::failed(
                status.code(),
                classify_failure_category(&message),
                message,
            ));
        }

        if !self.advance_through(HookStage::OnJobEnd).await? {
            return Ok(RunOutcome::cancelled(status.code()));
        }
        Ok(RunOutcome::succeeded(status.code().unwrap_or(0), self.summary.take()))
    }

    async fn handle_line(&mut self, line: &OutputLine, stderr_tail: &mut VecDeque<String>) -> Result<()> {
        if line.stream == OutputStream::Stdout {
            match parse_engine_message(&line.line) {
                Some(EngineMessage::PhaseComplete { phase, artifact }) => {
                    let stage = phase.hook_stage();
                    if self.pipeline.has_completed(stage) {
                        warn!(run_id = %self.run.id, stage = %stage, "Phase reported twice; ignoring");
                    } else {
                        self.artifact = ArtifactSnapshot::freeze(artifact);
                        self.advance_through(stage).await?;
                    }
                    return Ok(());
                }
                Some(EngineMessage::Summary { summary }) => {
                    self.summary = Some(summary);
                    return Ok(());
                }
                None => {}
            }
        } else {
            if stderr_tail.len() == STDERR_TAIL_LINES {
                stderr_tail.pop_front();
            }
            stderr_tail.push_back(line.line.clone());
        }

        self.sink
            .emit(NewRunEvent::log(
                RunState::Running,
                line.to_detail(),
                elapsed_ms(self.started),
            ))
            .await
    }
}

async fn emit_message(sink: &dyn RunEventSink, started: Instant, message: &str) -> Result<()> {
    sink.emit(NewRunEvent::log(
        RunState::Running,
        json!({"message": message}),
        elapsed_ms(started),
    ))
    .await
}

async fn terminate(child: &mut Child) {
    if let Err(error) = child.start_kill() {
        debug!(error = %error, "Entry point already exited");
    }
    let _ = child.wait().await;
}

/// Map an execution-time error to the terminal outcome recorded for the run.
#[must_use]
pub fn outcome_for_error(error: &EngineError) -> RunOutcome {
    let message = redact_sensitive(&error.to_string());
    match error {
        EngineError::EnvironmentBuild { .. } | EngineError::NotFound(_) => {
            RunOutcome::failed(None, "environment", message)
        }
        EngineError::Hook { .. } => RunOutcome::failed(None, "hook", message),
        EngineError::Config(_) => RunOutcome::failed(None, "configuration", message),
        EngineError::Execution(detail) => {
            RunOutcome::failed(None, classify_failure_category(detail), message)
        }
        _ => RunOutcome::failed(None, "internal", message),
    }
}

#[cfg(test)]
mod tests {
    use super::{outcome_for_error, CancelSignal};
    use crate::error::EngineError;
    use crate::types::RunState;

    #[test]
    fn cancel_signal_is_shared_between_clones() {
        let signal = CancelSignal::new();
        let observer = signal.clone();
        assert!(!observer.is_requested());
        signal.request();
        assert!(observer.is_requested());
    }

    #[test]
    fn hook_errors_fail_with_hook_category() {
        let outcome = outcome_for_error(&EngineError::Hook {
            stage: "after_transform".to_string(),
            hook_name: "totals".to_string(),
            detail: "sum mismatch".to_string(),
        });
        assert_eq!(outcome.state, RunState::Failed);
        assert_eq!(outcome.error_category.as_deref(), Some("hook"));
        assert!(outcome
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("after_transform")));
    }
}
