#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![forbid(unsafe_code)]

use crate::error::{EngineError, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

pub const MAX_OUTPUT_CAPTURE_BYTES: usize = 1_048_576;

/// Variables whose names contain any of these markers never reach a child.
pub const DENIED_ENV_MARKERS: &[&str] = &["TOKEN", "KEY", "SECRET", "PASSWORD", "CREDENTIAL"];

/// Unroutable proxy used to starve network access when it is disabled.
const BLACKHOLE_PROXY: &str = "http://127.0.0.1:9";

#[derive(Debug, Clone)]
pub struct StreamCapture {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl StreamCapture {
    #[must_use]
    pub fn text(&self) -> String {
        let text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            format!("{text}\n[output truncated]")
        } else {
            text
        }
    }
}

pub async fn capture_stream_limited<R>(mut stream: R, max_bytes: usize) -> Result<StreamCapture>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut truncated = false;
    let mut chunk = [0_u8; 8_192];

    loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }

        let remaining = max_bytes.saturating_sub(bytes.len());
        if remaining == 0 {
            truncated = true;
            continue;
        }

        let to_copy = remaining.min(read);
        bytes.extend_from_slice(&chunk[..to_copy]);
        if to_copy < read {
            truncated = true;
        }
    }

    Ok(StreamCapture { bytes, truncated })
}

#[must_use]
pub fn is_denied_env_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    DENIED_ENV_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// How a child process sees the world: interpreter environment, network
/// policy and engine-provided variables.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironment {
    pub virtual_env: Option<PathBuf>,
    pub allow_network: bool,
    pub vars: Vec<(String, String)>,
}

impl ProcessEnvironment {
    #[must_use]
    pub fn for_environment(environment_path: &Path, allow_network: bool) -> Self {
        Self {
            virtual_env: Some(environment_path.to_path_buf()),
            allow_network,
            vars: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.push((key.into(), value.into()));
        self
    }

    /// Scrub inherited secrets, then layer the environment on top.
    pub fn apply(&self, command: &mut Command) {
        std::env::vars_os()
            .filter_map(|(key, _)| key.into_string().ok())
            .filter(|key| is_denied_env_key(key))
            .for_each(|key| {
                command.env_remove(key);
            });

        if let Some(virtual_env) = &self.virtual_env {
            command.env("VIRTUAL_ENV", virtual_env);
            command.env("PATH", prefixed_path(&virtual_env.join("bin")));
            command.env_remove("PYTHONHOME");
        }

        if !self.allow_network {
            ["HTTP_PROXY", "HTTPS_PROXY", "ALL_PROXY", "http_proxy", "https_proxy", "all_proxy"]
                .iter()
                .for_each(|key| {
                    command.env(key, BLACKHOLE_PROXY);
                });
            command.env_remove("NO_PROXY");
            command.env_remove("no_proxy");
            command.env("PIP_NO_INDEX", "1");
            command.env("RUNENGINE_NETWORK_ACCESS", "disabled");
        }

        self.vars.iter().for_each(|(key, value)| {
            command.env(key, value);
        });
    }
}

fn prefixed_path(bin_dir: &Path) -> OsString {
    let inherited = std::env::var_os("PATH").unwrap_or_default();
    std::env::join_paths(
        std::iter::once(bin_dir.to_path_buf()).chain(std::env::split_paths(&inherited)),
    )
    .unwrap_or_else(|_| bin_dir.as_os_str().to_os_string())
}

/// One external command with captured output.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub environment: ProcessEnvironment,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            stdin: None,
            timeout,
            environment: ProcessEnvironment {
                allow_network: true,
                ..ProcessEnvironment::default()
            },
        }
    }

    /// Build from an argv vector.
    ///
    /// # Errors
    /// Returns `EngineError::Config` if `argv` is empty.
    pub fn from_argv(argv: &[String], timeout: Duration) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::Config("command must name a program".to_string()))?;
        Ok(Self::new(program.clone(), args.to_vec(), timeout))
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: Vec<u8>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: ProcessEnvironment) -> Self {
        self.environment = environment;
        self
    }

    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Configure a `tokio` command with piped stdio and the process environment applied.
    #[must_use]
    pub fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        self.environment.apply(&mut command);
        command
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: StreamCapture,
    pub stderr: StreamCapture,
    pub duration_ms: u64,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Combined stdout and stderr, for logs.
    #[must_use]
    pub fn combined_log(&self) -> String {
        let stdout = self.stdout.text();
        let stderr = self.stderr.text();
        match (stdout.trim().is_empty(), stderr.trim().is_empty()) {
            (true, true) => String::new(),
            (false, true) => stdout,
            (true, false) => stderr,
            (false, false) => format!("{stdout}\n{stderr}"),
        }
    }
}

/// Run `spec` to completion, killing it if it outlives its timeout.
///
/// # Errors
/// Returns `EngineError::Execution` if the program cannot be spawned or times
/// out, and `EngineError::Io` if its output cannot be read.
pub async fn run_captured(spec: &CommandSpec) -> Result<CommandOutput> {
    let started = Instant::now();
    let mut child = spec
        .command()
        .spawn()
        .map_err(|e| EngineError::Execution(format!("Failed to spawn {}: {e}", spec.program)))?;

    if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
        tokio::spawn(async move {
            let _ = stdin.write_all(&input).await;
            let _ = stdin.shutdown().await;
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::Internal(format!("Failed to capture {} stdout", spec.program)))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::Internal(format!("Failed to capture {} stderr", spec.program)))?;

    let stdout_task =
        tokio::spawn(async move { capture_stream_limited(stdout, MAX_OUTPUT_CAPTURE_BYTES).await });
    let stderr_task =
        tokio::spawn(async move { capture_stream_limited(stderr, MAX_OUTPUT_CAPTURE_BYTES).await });

    let status = if let Ok(wait_result) = tokio::time::timeout(spec.timeout, child.wait()).await {
        wait_result?
    } else {
        let _ = child.kill().await;
        return Err(EngineError::Execution(format!(
            "{} timed out after {}ms",
            spec.display(),
            spec.timeout.as_millis()
        )));
    };

    let stdout = stdout_task
        .await
        .map_err(|e| EngineError::Internal(format!("Failed to read {} stdout: {e}", spec.program)))??;
    let stderr = stderr_task
        .await
        .map_err(|e| EngineError::Internal(format!("Failed to read {} stderr: {e}", spec.program)))??;

    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        duration_ms: crate::timing::elapsed_ms(started),
    })
}

/// Describe a non-zero exit for diagnostics.
#[must_use]
pub fn describe_exit(status: ExitStatus) -> String {
    status.code().map_or_else(
        || "terminated by signal".to_string(),
        |code| format!("exited with status {code}"),
    )
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            Duration::from_secs(10),
        )
    }

    #[test]
    fn secret_looking_keys_are_denied() {
        assert!(is_denied_env_key("GITHUB_TOKEN"));
        assert!(is_denied_env_key("aws_secret_access_key"));
        assert!(is_denied_env_key("DB_PASSWORD"));
        assert!(!is_denied_env_key("PATH"));
        assert!(!is_denied_env_key("LANG"));
    }

    #[tokio::test]
    async fn stdin_is_delivered_and_output_captured() {
        let output = run_captured(&sh("cat; echo oops >&2").with_stdin(b"{\"a\":1}".to_vec()))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.text(), "{\"a\":1}");
        assert_eq!(output.stderr.text().trim(), "oops");
    }

    #[tokio::test]
    async fn disabled_network_points_proxies_at_blackhole() {
        let spec = sh("printf '%s|%s' \"$HTTPS_PROXY\" \"$RUNENGINE_NETWORK_ACCESS\"")
            .with_environment(ProcessEnvironment::default());
        let output = run_captured(&spec).await.unwrap();
        assert_eq!(output.stdout.text(), "http://127.0.0.1:9|disabled");
    }

    #[tokio::test]
    async fn virtual_env_bin_leads_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let spec = sh("printf '%s' \"$PATH\"").with_environment(ProcessEnvironment::for_environment(
            temp.path(),
            true,
        ));
        let output = run_captured(&spec).await.unwrap();
        let expected_prefix = temp.path().join("bin").display().to_string();
        assert!(output.stdout.text().starts_with(&expected_prefix));
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let spec = CommandSpec {
            timeout: Duration::from_millis(100),
            ..sh("sleep 5")
        };
        let error = run_captured(&spec).await.unwrap_err();
        assert!(error.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_program_is_an_execution_error() {
        let spec = CommandSpec::new(
            "definitely-not-a-real-program-xyz",
            Vec::new(),
            Duration::from_secs(1),
        );
        let error = run_captured(&spec).await.unwrap_err();
        assert_eq!(error.code(), crate::error::code::EXECUTION);
    }
}
