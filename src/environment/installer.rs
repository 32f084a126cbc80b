use crate::error::{EngineError, Result};
use crate::ports::{EnvironmentInstaller, PortFuture};
use crate::process::{describe_exit, run_captured, CommandSpec, ProcessEnvironment};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(900);

/// Flags that keep pip from prompting, caching or escaping the virtualenv.
const HARDENED_INSTALL_FLAGS: &[&str] = &[
    "--no-input",
    "--disable-pip-version-check",
    "--no-cache-dir",
    "--require-virtualenv",
    "--progress-bar",
    "off",
];

/// Builds environments with `python -m venv` and `pip`.
#[derive(Debug, Clone)]
pub struct PythonVenvInstaller {
    python_bin: String,
    timeout: Duration,
}

impl PythonVenvInstaller {
    #[must_use]
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
            timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn pip(&self, target: &Path, args: &[&str]) -> CommandSpec {
        let interpreter = target.join("bin").join("python");
        CommandSpec::new(
            interpreter.to_string_lossy().into_owned(),
            ["-m", "pip"]
                .iter()
                .chain(args)
                .map(ToString::to_string)
                .collect(),
            self.timeout,
        )
        .with_environment(
            ProcessEnvironment::for_environment(target, true).with_var("PIP_NO_INPUT", "1"),
        )
    }

    async fn run_step(spec: CommandSpec) -> Result<String> {
        let output = run_captured(&spec).await?;
        let log = output.combined_log();
        if output.success() {
            Ok(log)
        } else {
            Err(EngineError::Execution(format!(
                "{} {}\n{log}",
                spec.display(),
                describe_exit(output.status)
            )))
        }
    }

    async fn create(&self, target: &Path) -> Result<String> {
        let spec = CommandSpec::new(
            self.python_bin.clone(),
            vec![
                "-m".to_string(),
                "venv".to_string(),
                target.to_string_lossy().into_owned(),
            ],
            self.timeout,
        );
        Self::run_step(spec).await
    }

    async fn install(&self, target: &Path, dependency_manifest: &Path) -> Result<String> {
        let manifest = dependency_manifest.to_string_lossy();
        let args = std::iter::once("install")
            .chain(HARDENED_INSTALL_FLAGS.iter().copied())
            .chain(["-r", &*manifest])
            .collect::<Vec<_>>();
        Self::run_step(self.pip(target, &args)).await
    }

    async fn freeze_packages(&self, target: &Path) -> Result<Vec<String>> {
        let spec = self.pip(target, &["freeze", "--disable-pip-version-check"]);
        let output = run_captured(&spec).await?;
        if !output.success() {
            return Err(EngineError::Execution(format!(
                "{} {}\n{}",
                spec.display(),
                describe_exit(output.status),
                output.combined_log()
            )));
        }
        Ok(parse_freeze(&output.stdout.text()))
    }
}

impl EnvironmentInstaller for PythonVenvInstaller {
    fn create_environment<'a>(&'a self, target: &'a Path) -> PortFuture<'a, String> {
        Box::pin(self.create(target))
    }

    fn install_dependencies<'a>(
        &'a self,
        target: &'a Path,
        dependency_manifest: &'a Path,
    ) -> PortFuture<'a, String> {
        Box::pin(self.install(target, dependency_manifest))
    }

    fn freeze<'a>(&'a self, target: &'a Path) -> PortFuture<'a, Vec<String>> {
        Box::pin(self.freeze_packages(target))
    }
}

/// `pip freeze` output as a sorted, de-duplicated requirement list.
fn parse_freeze(stdout: &str) -> Vec<String> {
    use itertools::Itertools;

    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .sorted_by_key(|line| line.to_ascii_lowercase())
        .dedup()
        .collect()
}
