//! Lifecycle hooks: the fixed stage machine shared by activation and runs.
//!
//! Hooks only ever see an [`ArtifactSnapshot`], an immutable shared view of
//! the artifact at the moment the hook is invoked. Whatever a hook returns is
//! recorded as a [`HookAnnotation`] keyed by stage and declaration order, and
//! every later hook sees all earlier annotations under `annotations`.

mod script;

pub use script::ScriptHook;

use crate::configuration::ConfigurationVersion;
use crate::error::{EngineError, Result};
use crate::ports::PortFuture;
use crate::process::ProcessEnvironment;
use crate::types::{ConfigurationVersionId, HookAnnotation, HookStage, RunId};
use chrono::Utc;
use rpds::RedBlackTreeMapSync;
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Frozen artifact handed to hooks.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactSnapshot(Arc<Value>);

impl ArtifactSnapshot {
    #[must_use]
    pub fn freeze(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Freeze `value` with `annotations` attached as its `annotations` array.
    /// A non-object artifact is nested under `value`.
    #[must_use]
    pub fn annotated(value: &Value, annotations: &[HookAnnotation]) -> Self {
        let mut fields = match value {
            Value::Object(fields) => fields.clone(),
            Value::Null => Map::new(),
            other => Map::from_iter([("value".to_string(), other.clone())]),
        };
        fields.insert("annotations".to_string(), json!(annotations));
        Self::freeze(Value::Object(fields))
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl Default for ArtifactSnapshot {
    fn default() -> Self {
        Self::freeze(Value::Null)
    }
}

/// Where and how a hook runs.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub configuration_version_id: ConfigurationVersionId,
    pub run_id: Option<RunId>,
    pub working_dir: PathBuf,
    pub environment: ProcessEnvironment,
    pub timeout: Duration,
}

/// User-supplied code invoked at a lifecycle stage.
pub trait Hook: Send + Sync {
    fn invoke<'a>(
        &'a self,
        stage: HookStage,
        artifact: &'a ArtifactSnapshot,
        context: &'a HookContext,
    ) -> PortFuture<'a, Option<Value>>;
}

/// In-process hooks addressable by name from a manifest. Registering a hook
/// yields a new registry; engines already holding a clone keep their view.
#[derive(Clone)]
pub struct HookRegistry {
    hooks: RedBlackTreeMapSync<String, Arc<dyn Hook>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self {
            hooks: RedBlackTreeMapSync::new_sync(),
        }
    }
}

impl HookRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_hook(&self, name: impl Into<String>, hook: Arc<dyn Hook>) -> Self {
        Self {
            hooks: self.hooks.insert(name.into(), hook),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).cloned()
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct BoundHook {
    name: String,
    stage: HookStage,
    hook: Arc<dyn Hook>,
}

/// What one stage contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: HookStage,
    pub annotations: Vec<HookAnnotation>,
}

impl StageReport {
    /// Event detail recorded when a stage completes.
    #[must_use]
    pub fn to_detail(&self) -> Value {
        serde_json::json!({
            "stage": self.stage,
            "annotations": self.annotations,
        })
    }
}

/// Per-execution cursor over the hook stages.
pub struct HookPipeline {
    hooks: Vec<BoundHook>,
    completed: Option<HookStage>,
    annotations: RedBlackTreeMapSync<(HookStage, usize), HookAnnotation>,
}

impl HookPipeline {
    /// Bind every enabled hook in the manifest to an implementation: its own
    /// command if it declares one, otherwise the registry entry of the same name.
    ///
    /// # Errors
    /// Returns `EngineError::Config` when a hook names no command and is not registered.
    pub fn resolve(version: &ConfigurationVersion, registry: &HookRegistry) -> Result<Self> {
        let hooks = version
            .manifest
            .hooks
            .iter()
            .filter(|spec| spec.enabled)
            .map(|spec| {
                let hook: Arc<dyn Hook> = match &spec.command {
                    Some(command) => Arc::new(ScriptHook::new(spec.name.clone(), command.clone())),
                    None => registry.get(&spec.name).ok_or_else(|| {
                        EngineError::Config(format!(
                            "hook {} for stage {} has no command and is not registered",
                            spec.name, spec.stage
                        ))
                    })?,
                };
                Ok(BoundHook {
                    name: spec.name.clone(),
                    stage: spec.stage,
                    hook,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            hooks,
            completed: None,
            annotations: RedBlackTreeMapSync::new_sync(),
        })
    }

    /// The next run stage this pipeline will execute, if any remain.
    #[must_use]
    pub fn next_stage(&self) -> Option<HookStage> {
        match self.completed {
            None | Some(HookStage::OnActivate) => Some(HookStage::OnJobStart),
            Some(stage) => stage.next(),
        }
    }

    #[must_use]
    pub fn has_completed(&self, stage: HookStage) -> bool {
        self.completed.is_some_and(|done| done >= stage)
    }

    /// Run the activation-only `on_activate` stage.
    ///
    /// # Errors
    /// Returns `EngineError::Hook` for the first failing hook, or
    /// `EngineError::Conflict` if stages have already been run.
    pub async fn run_activation(
        &mut self,
        artifact: &ArtifactSnapshot,
        context: &HookContext,
    ) -> Result<StageReport> {
        if self.completed.is_some() {
            return Err(EngineError::Conflict(
                "on_activate must run before any other stage".to_string(),
            ));
        }
        self.run_stage(HookStage::OnActivate, artifact, context).await
    }

    /// Run the next stage in order. Stages are never skipped: callers
    /// that need a later stage step through every one before it.
    ///
    /// # Errors
    /// Returns `EngineError::Hook` for the first failing hook, or
    /// `EngineError::Conflict` once `on_job_end` has completed.
    pub async fn run_next_stage(
        &mut self,
        artifact: &ArtifactSnapshot,
        context: &HookContext,
    ) -> Result<StageReport> {
        let stage = self
            .next_stage()
            .ok_or_else(|| EngineError::Conflict("all hook stages already ran".to_string()))?;
        self.run_stage(stage, artifact, context).await
    }

    async fn run_stage(
        &mut self,
        stage: HookStage,
        artifact: &ArtifactSnapshot,
        context: &HookContext,
    ) -> Result<StageReport> {
        let mut annotations = Vec::new();

        for (index, bound) in self.hooks.iter().enumerate().filter(|(_, b)| b.stage == stage) {
            debug!(stage = %stage, hook = %bound.name, "Invoking hook");
            let view = ArtifactSnapshot::annotated(artifact.value(), &self.annotations());
            let detail = bound
                .hook
                .invoke(stage, &view, context)
                .await
                .map_err(|e| {
                    warn!(stage = %stage, hook = %bound.name, error = %e, "Hook failed");
                    EngineError::Hook {
                        stage: stage.as_str().to_string(),
                        hook_name: bound.name.clone(),
                        detail: e.to_string(),
                    }
                })?;

            let annotation = HookAnnotation {
                stage,
                hook_name: bound.name.clone(),
                annotated_at: Utc::now(),
                detail,
            };
            self.annotations = self.annotations.insert((stage, index), annotation.clone());
            annotations.push(annotation);
        }

        self.completed = Some(stage);
        Ok(StageReport { stage, annotations })
    }

    /// Every annotation recorded so far, in stage then declaration order.
    #[must_use]
    pub fn annotations(&self) -> Vec<HookAnnotation> {
        self.annotations.values().cloned().collect()
    }
}
