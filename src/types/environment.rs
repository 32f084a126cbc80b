use super::hook::HookAnnotation;
use super::identifiers::ConfigurationVersionId;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Step of an environment build; surfaced on failure so the operator knows what to fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStep {
    CreateEnvironment,
    InstallDependencies,
    FreezePackages,
    ResolveHooks,
    OnActivate,
    Commit,
}

impl BuildStep {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CreateEnvironment => "create_environment",
            Self::InstallDependencies => "install_dependencies",
            Self::FreezePackages => "freeze_packages",
            Self::ResolveHooks => "resolve_hooks",
            Self::OnActivate => "on_activate",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for BuildStep {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "create_environment" => Ok(Self::CreateEnvironment),
            "install_dependencies" => Ok(Self::InstallDependencies),
            "freeze_packages" => Ok(Self::FreezePackages),
            "resolve_hooks" => Ok(Self::ResolveHooks),
            "on_activate" => Ok(Self::OnActivate),
            "commit" => Ok(Self::Commit),
            _ => Err(format!("Unknown build step: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivationHookResult {
    pub succeeded: bool,
    pub annotations: Vec<HookAnnotation>,
    pub failed_hook: Option<String>,
    pub diagnostic: Option<String>,
}

/// The built, reusable environment of one configuration version. Frozen once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationEnvironment {
    pub configuration_version_id: ConfigurationVersionId,
    pub environment_path: PathBuf,
    pub installed_packages: Vec<String>,
    pub install_log: String,
    pub dependency_digest: Option<String>,
    pub built_at: DateTime<Utc>,
    pub activation_hook_result: ActivationHookResult,
}

impl ConfigurationEnvironment {
    /// Directory holding the environment's executables.
    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.environment_path.join("bin")
    }
}

/// Diagnostic left behind by a failed build. Never reusable as an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationFailure {
    pub configuration_version_id: ConfigurationVersionId,
    pub step: BuildStep,
    pub detail: String,
    pub install_log: String,
    pub activation_hook_result: Option<ActivationHookResult>,
    pub failed_at: DateTime<Utc>,
}

impl ActivationFailure {
    #[must_use]
    pub fn to_error(&self) -> EngineError {
        EngineError::EnvironmentBuild {
            configuration_version_id: self.configuration_version_id.value().to_string(),
            step: self.step.as_str().to_string(),
            detail: self.detail.clone(),
        }
    }
}

/// What the store knows about a version's activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationState {
    Ready(ConfigurationEnvironment),
    Failed(ActivationFailure),
}
