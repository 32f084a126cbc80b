use super::{ArtifactSnapshot, Hook, HookContext};
use crate::diagnostics::redact_sensitive;
use crate::error::{EngineError, Result};
use crate::ports::PortFuture;
use crate::process::{describe_exit, run_captured, CommandSpec};
use crate::types::HookStage;
use serde_json::{json, Value};

/// A hook implemented as an external command run inside the configuration's
/// environment. The frozen artifact arrives as JSON on stdin; JSON written to
/// stdout becomes the annotation detail, other text is kept verbatim.
#[derive(Debug, Clone)]
pub struct ScriptHook {
    name: String,
    argv: Vec<String>,
}

impl ScriptHook {
    #[must_use]
    pub const fn new(name: String, argv: Vec<String>) -> Self {
        Self { name, argv }
    }

    async fn execute(
        &self,
        stage: HookStage,
        artifact: &ArtifactSnapshot,
        context: &HookContext,
    ) -> Result<Option<Value>> {
        let payload = json!({
            "stage": stage,
            "hook_name": self.name,
            "configuration_version_id": context.configuration_version_id,
            "run_id": context.run_id,
            "artifact": artifact.value(),
        });

        let mut environment = context
            .environment
            .clone()
            .with_var("RUNENGINE_HOOK_STAGE", stage.as_str())
            .with_var("RUNENGINE_HOOK_NAME", self.name.clone());
        if let Some(run_id) = context.run_id {
            environment = environment.with_var("RUNENGINE_RUN_ID", run_id.to_string());
        }

        let spec = CommandSpec::from_argv(&self.argv, context.timeout)?
            .with_cwd(context.working_dir.clone())
            .with_stdin(serde_json::to_vec(&payload)?)
            .with_environment(environment);

        let output = run_captured(&spec).await?;
        if !output.success() {
            let stderr = output.stderr.text();
            return Err(EngineError::Execution(format!(
                "{} {}: {}",
                spec.display(),
                describe_exit(output.status),
                redact_sensitive(stderr.trim())
            )));
        }

        Ok(parse_annotation(&output.stdout.text()))
    }
}

impl Hook for ScriptHook {
    fn invoke<'a>(
        &'a self,
        stage: HookStage,
        artifact: &'a ArtifactSnapshot,
        context: &'a HookContext,
    ) -> PortFuture<'a, Option<Value>> {
        Box::pin(self.execute(stage, artifact, context))
    }
}

fn parse_annotation(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}
