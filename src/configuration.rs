//! Configuration versions as seen by the engine: an immutable directory with a
//! `manifest.json`, optional dependency manifest, entry point and hooks.

use crate::error::{EngineError, Result};
use crate::ports::{ConfigurationSource, PortFuture};
use crate::types::{ConfigurationVersionId, HookStage};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DEFAULT_DEPENDENCY_MANIFEST: &str = "requirements.txt";

const fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookSpec {
    pub name: String,
    pub stage: HookStage,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Program and arguments run inside the environment. Without a command the
    /// hook is looked up by name among the hooks registered in-process.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigurationManifest {
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub dependency_manifest: Option<PathBuf>,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default)]
    pub hooks: Vec<HookSpec>,
}

impl ConfigurationManifest {
    /// # Errors
    /// Returns `EngineError::Config` for an empty entry point, an escaping
    /// dependency path, or a hook declared twice for the same stage.
    pub fn validate(&self) -> Result<()> {
        if self.entrypoint.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(EngineError::Config(
                "manifest entrypoint must name a program".to_string(),
            ));
        }

        if let Some(path) = &self.dependency_manifest {
            if !is_contained_relative(path) {
                return Err(EngineError::Config(format!(
                    "dependency_manifest must be a relative path inside the configuration: {}",
                    path.display()
                )));
            }
        }

        let mut seen = HashSet::new();
        self.hooks.iter().try_for_each(|hook| {
            if hook.name.trim().is_empty() {
                return Err(EngineError::Config("hook name must not be empty".to_string()));
            }
            if hook.command.as_ref().is_some_and(Vec::is_empty) {
                return Err(EngineError::Config(format!(
                    "hook {} declares an empty command",
                    hook.name
                )));
            }
            if seen.insert((hook.stage, hook.name.as_str())) {
                Ok(())
            } else {
                Err(EngineError::Config(format!(
                    "hook {} is declared twice for stage {}",
                    hook.name, hook.stage
                )))
            }
        })
    }

    /// # Errors
    /// Returns `EngineError::Serialization` or `EngineError::Config` when the manifest is invalid.
    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }
}

fn is_contained_relative(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// One immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationVersion {
    pub id: ConfigurationVersionId,
    pub root: PathBuf,
    pub manifest: ConfigurationManifest,
    pub dependency_manifest_path: Option<PathBuf>,
    pub dependency_digest: Option<String>,
}

impl ConfigurationVersion {
    /// Resolve the dependency manifest (declared or auto-detected) and fingerprint it.
    ///
    /// # Errors
    /// Returns an error if a declared dependency manifest is missing or unreadable.
    pub async fn resolve(
        id: ConfigurationVersionId,
        root: PathBuf,
        manifest: ConfigurationManifest,
    ) -> Result<Self> {
        let dependency_manifest_path = match &manifest.dependency_manifest {
            Some(declared) => {
                let path = root.join(declared);
                if !path.is_file() {
                    return Err(EngineError::Config(format!(
                        "declared dependency manifest not found: {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => Some(root.join(DEFAULT_DEPENDENCY_MANIFEST)).filter(|path| path.is_file()),
        };

        let dependency_digest = match &dependency_manifest_path {
            Some(path) => Some(digest_file(path).await?),
            None => None,
        };

        Ok(Self {
            id,
            root,
            manifest,
            dependency_manifest_path,
            dependency_digest,
        })
    }
}

async fn digest_file(path: &Path) -> Result<String> {
    let contents = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reads versions from `<root>/<version_id>/manifest.json`.
#[derive(Debug, Clone)]
pub struct DirectoryConfigurationSource {
    root: PathBuf,
}

impl DirectoryConfigurationSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn load_version(&self, id: &ConfigurationVersionId) -> Result<ConfigurationVersion> {
        if !id.is_path_safe() {
            return Err(EngineError::NotFound(format!(
                "configuration version {id}"
            )));
        }

        let version_root = self.root.join(id.value());
        let manifest_path = version_root.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            return Err(EngineError::NotFound(format!(
                "configuration version {id}"
            )));
        }

        let raw = tokio::fs::read_to_string(&manifest_path).await?;
        let manifest = ConfigurationManifest::parse(&raw).map_err(|e| {
            EngineError::Config(format!("invalid manifest for {id}: {e}"))
        })?;
        ConfigurationVersion::resolve(id.clone(), version_root, manifest).await
    }
}

impl ConfigurationSource for DirectoryConfigurationSource {
    fn load<'a>(
        &'a self,
        id: &'a ConfigurationVersionId,
    ) -> PortFuture<'a, ConfigurationVersion> {
        Box::pin(self.load_version(id))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::error::code;

    fn write_version(root: &Path, id: &str, manifest: &str) -> PathBuf {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
        dir
    }

    #[test]
    fn manifest_defaults_enable_hooks_and_disable_network() {
        let manifest = ConfigurationManifest::parse(
            r#"{"entrypoint":["python","-m","engine"],
                "hooks":[{"name":"audit","stage":"after_mapping"}]}"#,
        )
        .unwrap();

        assert!(!manifest.allow_network);
        assert!(manifest.hooks[0].enabled);
        assert!(manifest.hooks[0].command.is_none());
    }

    #[test]
    fn manifest_rejects_duplicate_hooks_and_escaping_paths() {
        let duplicate = r#"{"entrypoint":["sh"],"hooks":[
            {"name":"a","stage":"on_job_end"},{"name":"a","stage":"on_job_end"}]}"#;
        let escaping = r#"{"entrypoint":["sh"],"dependency_manifest":"../secrets.txt"}"#;
        let empty = r#"{"entrypoint":[]}"#;

        assert!(ConfigurationManifest::parse(duplicate).is_err());
        assert!(ConfigurationManifest::parse(escaping).is_err());
        assert!(ConfigurationManifest::parse(empty).is_err());
    }

    #[tokio::test]
    async fn directory_source_detects_requirements_and_fingerprints_them() {
        let temp = tempfile::TempDir::new().unwrap();
        let dir = write_version(temp.path(), "invoices-v1", r#"{"entrypoint":["sh","run.sh"]}"#);
        std::fs::write(dir.join(DEFAULT_DEPENDENCY_MANIFEST), "pandas==2.2.0\n").unwrap();

        let source = DirectoryConfigurationSource::new(temp.path());
        let version = source
            .load(&ConfigurationVersionId::new("invoices-v1"))
            .await
            .unwrap();

        assert_eq!(
            version.dependency_manifest_path,
            Some(dir.join(DEFAULT_DEPENDENCY_MANIFEST))
        );
        assert_eq!(version.dependency_digest.as_ref().map(String::len), Some(64));
    }

    #[tokio::test]
    async fn directory_source_reports_unknown_versions_as_not_found() {
        let temp = tempfile::TempDir::new().unwrap();
        let source = DirectoryConfigurationSource::new(temp.path());

        let missing = source
            .load(&ConfigurationVersionId::new("nope"))
            .await
            .unwrap_err();
        let traversal = source
            .load(&ConfigurationVersionId::new("../nope"))
            .await
            .unwrap_err();

        assert_eq!(missing.code(), code::NOTFOUND);
        assert_eq!(traversal.code(), code::NOTFOUND);
    }
}
