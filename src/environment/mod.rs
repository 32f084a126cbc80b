//! One isolated, reusable environment per configuration version.

mod installer;

pub use installer::{PythonVenvInstaller, DEFAULT_INSTALL_TIMEOUT};

use crate::configuration::ConfigurationVersion;
use crate::db::RunStore;
use crate::diagnostics::redact_sensitive;
use crate::error::{EngineError, Result};
use crate::hooks::{ArtifactSnapshot, HookContext, HookPipeline, HookRegistry};
use crate::ports::{ConfigurationSource, EnvironmentInstaller};
use crate::process::ProcessEnvironment;
use crate::timing::elapsed_ms;
use crate::types::{
    ActivationFailure, ActivationHookResult, ActivationState, BuildStep, ConfigurationEnvironment,
    ConfigurationVersionId,
};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

pub const INSTALLED_PACKAGES_FILE: &str = "installed-packages.txt";
pub const DIAGNOSTICS_FILE: &str = "diagnostics.json";

pub struct EnvironmentBuilder {
    store: RunStore,
    source: Arc<dyn ConfigurationSource>,
    installer: Arc<dyn EnvironmentInstaller>,
    registry: HookRegistry,
    environments_root: PathBuf,
    hook_timeout: Duration,
    build_locks: Mutex<HashMap<ConfigurationVersionId, Arc<Mutex<()>>>>,
}

impl EnvironmentBuilder {
    #[must_use]
    pub fn new(
        store: RunStore,
        source: Arc<dyn ConfigurationSource>,
        installer: Arc<dyn EnvironmentInstaller>,
        registry: HookRegistry,
        environments_root: impl Into<PathBuf>,
        hook_timeout: Duration,
    ) -> Self {
        Self {
            store,
            source,
            installer,
            registry,
            environments_root: environments_root.into(),
            hook_timeout,
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn ConfigurationSource> {
        &self.source
    }

    #[must_use]
    pub const fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    /// Return the version's environment, building it first if there is no
    /// successful one. A previously failed build is retried in full. Callers
    /// arriving while another build of the same version is in progress wait
    /// for it and then observe its result.
    ///
    /// # Errors
    /// Returns `EngineError::NotFound` for an unknown version and
    /// `EngineError::EnvironmentBuild` naming the failing step.
    pub async fn build(&self, id: &ConfigurationVersionId) -> Result<ConfigurationEnvironment> {
        let _guard = self.lock_for(id).await.lock_owned().await;
        match self.reusable(id).await? {
            Some(environment) => Ok(environment),
            None => self.build_locked(id).await,
        }
    }

    /// Like [`build`](Self::build) but refuses to wait on an in-progress build.
    ///
    /// # Errors
    /// Returns `EngineError::Conflict` while the same version is being built.
    pub async fn try_build(&self, id: &ConfigurationVersionId) -> Result<ConfigurationEnvironment> {
        let _guard = self.try_lock_for(id).await?;
        match self.reusable(id).await? {
            Some(environment) => Ok(environment),
            None => self.build_locked(id).await,
        }
    }

    /// The run-time path: reuse, or build once if the version was never
    /// activated. A recorded activation failure is returned as-is and not
    /// retried implicitly.
    ///
    /// # Errors
    /// Returns `EngineError::EnvironmentBuild` for a version whose activation failed.
    pub async fn ensure(&self, id: &ConfigurationVersionId) -> Result<ConfigurationEnvironment> {
        let _guard = self.lock_for(id).await.lock_owned().await;
        match self.store.activation_state(id).await? {
            Some(ActivationState::Ready(environment)) if environment.environment_path.is_dir() => {
                Ok(environment)
            }
            Some(ActivationState::Failed(failure)) => Err(failure.to_error()),
            Some(ActivationState::Ready(_)) | None => self.build_locked(id).await,
        }
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn activation_state(
        &self,
        id: &ConfigurationVersionId,
    ) -> Result<Option<ActivationState>> {
        self.store.activation_state(id).await
    }

    async fn reusable(&self, id: &ConfigurationVersionId) -> Result<Option<ConfigurationEnvironment>> {
        Ok(match self.store.activation_state(id).await? {
            Some(ActivationState::Ready(environment)) if environment.environment_path.is_dir() => {
                Some(environment)
            }
            _ => None,
        })
    }

    async fn lock_for(&self, id: &ConfigurationVersionId) -> Arc<Mutex<()>> {
        self.build_locks
            .lock()
            .await
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn try_lock_for(&self, id: &ConfigurationVersionId) -> Result<OwnedMutexGuard<()>> {
        self.lock_for(id).await.try_lock_owned().map_err(|_| {
            EngineError::Conflict(format!("environment for {id} is already being built"))
        })
    }

    async fn build_locked(&self, id: &ConfigurationVersionId) -> Result<ConfigurationEnvironment> {
        if !id.is_path_safe() {
            return Err(EngineError::NotFound(format!("configuration version {id}")));
        }
        let version = self.source.load(id).await?;
        let target = self.environments_root.join(id.value());
        let started = Instant::now();
        info!(configuration_version_id = %id, path = %target.display(), "Building environment");

        let mut attempt = BuildAttempt::default();
        match self.run_build(&version, &target, &mut attempt).await {
            Ok(environment) => {
                self.store.record_environment_ready(&environment).await?;
                info!(
                    configuration_version_id = %id,
                    packages = environment.installed_packages.len(),
                    duration_ms = elapsed_ms(started),
                    "Environment ready"
                );
                Ok(environment)
            }
            Err((step, error)) => {
                let failure = ActivationFailure {
                    configuration_version_id: id.clone(),
                    step,
                    detail: redact_sensitive(&error.to_string()),
                    install_log: redact_sensitive(&attempt.log),
                    activation_hook_result: attempt.hook_result,
                    failed_at: Utc::now(),
                };
                warn!(
                    configuration_version_id = %id,
                    step = %step,
                    error = %failure.detail,
                    "Environment build failed"
                );
                discard_environment(&target).await;
                write_failure_diagnostics(&target, &failure).await;
                self.store.record_environment_failure(&failure).await?;
                Err(failure.to_error())
            }
        }
    }

    async fn run_build(
        &self,
        version: &ConfigurationVersion,
        target: &Path,
        attempt: &mut BuildAttempt,
    ) -> std::result::Result<ConfigurationEnvironment, (BuildStep, EngineError)> {
        discard_environment(target).await;
        tokio::fs::create_dir_all(&self.environments_root)
            .await
            .map_err(|e| (BuildStep::CreateEnvironment, e.into()))?;

        let created = self
            .installer
            .create_environment(target)
            .await
            .map_err(|e| (BuildStep::CreateEnvironment, e))?;
        attempt.append(&created);

        if let Some(manifest) = &version.dependency_manifest_path {
            let installed = self
                .installer
                .install_dependencies(target, manifest)
                .await
                .map_err(|e| (BuildStep::InstallDependencies, e))?;
            attempt.append(&installed);
        }

        let installed_packages = self
            .installer
            .freeze(target)
            .await
            .map_err(|e| (BuildStep::FreezePackages, e))?;

        let mut pipeline = HookPipeline::resolve(version, &self.registry)
            .map_err(|e| (BuildStep::ResolveHooks, e))?;
        let context = HookContext {
            configuration_version_id: version.id.clone(),
            run_id: None,
            working_dir: version.root.clone(),
            environment: ProcessEnvironment::for_environment(target, true),
            timeout: self.hook_timeout,
        };
        let artifact = ArtifactSnapshot::freeze(json!({
            "configuration_version_id": version.id,
            "environment_path": target,
            "installed_packages": installed_packages,
            "dependency_digest": version.dependency_digest,
        }));

        let activation = pipeline.run_activation(&artifact, &context).await;
        let hook_result = match &activation {
            Ok(_) => ActivationHookResult {
                succeeded: true,
                annotations: pipeline.annotations(),
                failed_hook: None,
                diagnostic: None,
            },
            Err(error) => ActivationHookResult {
                succeeded: false,
                annotations: pipeline.annotations(),
                failed_hook: match error {
                    EngineError::Hook { hook_name, .. } => Some(hook_name.clone()),
                    _ => None,
                },
                diagnostic: Some(redact_sensitive(&error.to_string())),
            },
        };
        attempt.hook_result = Some(hook_result.clone());
        activation.map_err(|e| (BuildStep::OnActivate, e))?;

        let environment = ConfigurationEnvironment {
            configuration_version_id: version.id.clone(),
            environment_path: target.to_path_buf(),
            installed_packages,
            install_log: redact_sensitive(&attempt.log),
            dependency_digest: version.dependency_digest.clone(),
            built_at: Utc::now(),
            activation_hook_result: hook_result,
        };
        write_environment_files(&environment)
            .await
            .map_err(|e| (BuildStep::Commit, e))?;
        Ok(environment)
    }
}

#[derive(Default)]
struct BuildAttempt {
    log: String,
    hook_result: Option<ActivationHookResult>,
}

impl BuildAttempt {
    fn append(&mut self, output: &str) {
        if output.trim().is_empty() {
            return;
        }
        if !self.log.is_empty() {
            self.log.push('\n');
        }
        self.log.push_str(output.trim_end());
    }
}

async fn write_environment_files(environment: &ConfigurationEnvironment) -> Result<()> {
    let packages = environment
        .installed_packages
        .iter()
        .map(|package| format!("{package}\n"))
        .collect::<String>();
    tokio::fs::write(
        environment.environment_path.join(INSTALLED_PACKAGES_FILE),
        packages,
    )
    .await?;
    tokio::fs::write(
        environment.environment_path.join(DIAGNOSTICS_FILE),
        serde_json::to_vec_pretty(&json!({
            "status": "ready",
            "configuration_version_id": environment.configuration_version_id,
            "built_at": environment.built_at,
            "dependency_digest": environment.dependency_digest,
            "install_log": environment.install_log,
            "activation_hook_result": environment.activation_hook_result,
        }))?,
    )
    .await?;
    Ok(())
}

/// A failed build leaves only its diagnostics behind.
async fn write_failure_diagnostics(target: &Path, failure: &ActivationFailure) {
    let written = async {
        tokio::fs::create_dir_all(target).await?;
        tokio::fs::write(
            target.join(DIAGNOSTICS_FILE),
            serde_json::to_vec_pretty(&json!({
                "status": "failed",
                "failure": failure,
            }))?,
        )
        .await?;
        Ok::<(), EngineError>(())
    }
    .await;
    if let Err(error) = written {
        warn!(path = %target.display(), error = %error, "Failed to write build diagnostics");
    }
}

async fn discard_environment(target: &Path) {
    if tokio::fs::metadata(target).await.is_ok() {
        if let Err(error) = tokio::fs::remove_dir_all(target).await {
            warn!(path = %target.display(), error = %error, "Failed to remove environment directory");
        }
    }
}
