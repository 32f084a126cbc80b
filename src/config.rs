#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = ".runengine/config.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: String,
    pub configurations_root: PathBuf,
    pub environments_root: PathBuf,
    pub max_concurrency: u32,
    pub max_queue_depth: u32,
    pub heartbeat_interval_ms: u64,
    pub stale_heartbeat_multiplier: u32,
    pub retry_after_ms: u64,
    pub safe_mode: bool,
    pub python_bin: String,
    pub hook_timeout_ms: u64,
    pub max_log_line_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://.runengine/runs.db".to_string(),
            configurations_root: PathBuf::from(".runengine/configurations"),
            environments_root: PathBuf::from(".runengine/environments"),
            max_concurrency: 4,
            max_queue_depth: 32,
            heartbeat_interval_ms: 5_000,
            stale_heartbeat_multiplier: 3,
            retry_after_ms: 5_000,
            safe_mode: false,
            python_bin: "python3".to_string(),
            hook_timeout_ms: 60_000,
            max_log_line_bytes: 16_384,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// A running run whose heartbeat is older than this is considered orphaned.
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_millis(
            self.heartbeat_interval_ms
                .saturating_mul(self.stale_heartbeat_multiplier as u64),
        )
    }

    #[must_use]
    pub const fn hook_timeout(&self) -> Duration {
        Duration::from_millis(self.hook_timeout_ms)
    }

    /// Total number of non-terminal runs the queue admits.
    #[must_use]
    pub const fn admission_capacity(&self) -> u32 {
        self.max_concurrency.saturating_add(self.max_queue_depth)
    }

    /// # Errors
    /// Returns `EngineError::Config` when a limit would make the engine unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(EngineError::Config(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.stale_heartbeat_multiplier < 2 {
            return Err(EngineError::Config(
                "stale_heartbeat_multiplier must be at least 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from `path` (or the default location), then apply
/// `RUNENGINE_*` environment overrides.
///
/// # Errors
/// Returns `EngineError::Config` when the file cannot be read or holds invalid values.
pub async fn load_config(path: Option<PathBuf>) -> Result<EngineConfig> {
    let config_path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let content = read_optional(&config_path).await?;

    let from_file = content
        .as_deref()
        .map_or_else(|| Ok(EngineConfig::default()), parse_config_content)?;
    let config = apply_env_overrides(from_file, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    tokio::fs::read_to_string(path)
        .await
        .map(Some)
        .map_err(|e| EngineError::Config(format!("Failed to read config: {e}")))
}

/// # Errors
/// Returns `EngineError::Config` when a numeric or boolean value does not parse.
pub fn parse_config_content(content: &str) -> Result<EngineConfig> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('['))
        .filter_map(|line| line.split_once('='))
        .try_fold(EngineConfig::default(), |config, (key, value)| {
            apply_setting(
                config,
                key.trim(),
                &expand_env_vars(value.trim().trim_matches('"')),
            )
        })
}

fn apply_env_overrides<F>(config: EngineConfig, env_lookup: F) -> Result<EngineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    SETTING_KEYS.iter().try_fold(config, |config, key| {
        let env_key = format!("RUNENGINE_{}", key.to_ascii_uppercase());
        match env_lookup(&env_key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
        {
            Some(value) => apply_setting(config, key, &value),
            None => Ok(config),
        }
    })
}

const SETTING_KEYS: &[&str] = &[
    "database_url",
    "configurations_root",
    "environments_root",
    "max_concurrency",
    "max_queue_depth",
    "heartbeat_interval_ms",
    "stale_heartbeat_multiplier",
    "retry_after_ms",
    "safe_mode",
    "python_bin",
    "hook_timeout_ms",
    "max_log_line_bytes",
];

fn apply_setting(mut config: EngineConfig, key: &str, value: &str) -> Result<EngineConfig> {
    match key {
        "database_url" => config.database_url = value.to_string(),
        "configurations_root" => config.configurations_root = PathBuf::from(value),
        "environments_root" => config.environments_root = PathBuf::from(value),
        "max_concurrency" => config.max_concurrency = parse_number(key, value)?,
        "max_queue_depth" => config.max_queue_depth = parse_number(key, value)?,
        "heartbeat_interval_ms" => config.heartbeat_interval_ms = parse_number(key, value)?,
        "stale_heartbeat_multiplier" => {
            config.stale_heartbeat_multiplier = parse_number(key, value)?;
        }
        "retry_after_ms" => config.retry_after_ms = parse_number(key, value)?,
        "safe_mode" => config.safe_mode = parse_bool(key, value)?,
        "python_bin" => config.python_bin = value.to_string(),
        "hook_timeout_ms" => config.hook_timeout_ms = parse_number(key, value)?,
        "max_log_line_bytes" => config.max_log_line_bytes = parse_number(key, value)?,
        _ => {}
    }
    Ok(config)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| EngineError::Config(format!("{key} expects a non-negative integer, got '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(EngineError::Config(format!(
            "{key} expects true or false, got '{value}'"
        ))),
    }
}

fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_part = &result[start + 2..start + end];
            let (var_name, default) = var_part.split_once(":-").unwrap_or((var_part, ""));
            let value = std::env::var(var_name).unwrap_or_else(|_| default.to_string());
            result.replace_range(start..=(start + end), &value);
        } else {
            break;
        }
    }
    result
}
