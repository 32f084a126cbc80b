#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use std::time::Duration;
use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const CLI_ERROR: &str = "CLI_ERROR";
    pub const SATURATED: &str = "SATURATED";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const CONFLICT: &str = "CONFLICT";
    pub const ENV_BUILD: &str = "ENV_BUILD";
    pub const HOOK: &str = "HOOK";
    pub const EXECUTION: &str = "EXECUTION";
    pub const INVALID: &str = "INVALID";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(
        "Run queue saturated: {queue_size} runs outstanding (max concurrency {max_concurrency}), retry after {retry_after_ms}ms"
    )]
    Saturated {
        queue_size: u32,
        max_concurrency: u32,
        retry_after_ms: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Environment build failed for {configuration_version_id} at {step}: {detail}")]
    EnvironmentBuild {
        configuration_version_id: String,
        step: String,
        detail: String,
    },

    #[error("Hook {hook_name} failed at stage {stage}: {detail}")]
    Hook {
        stage: String,
        hook_name: String,
        detail: String,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Engine is shutting down and no longer admits runs")]
    ShuttingDown,

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns the protocol error code for this error
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Saturated { .. } => code::SATURATED,
            Self::NotFound(_) => code::NOTFOUND,
            Self::Conflict(_) => code::CONFLICT,
            Self::EnvironmentBuild { .. } => code::ENV_BUILD,
            Self::Hook { .. } => code::HOOK,
            Self::Execution(_) => code::EXECUTION,
            Self::ShuttingDown => code::UNAVAILABLE,
            Self::Config(_) | Self::Serialization(_) => code::INVALID,
            Self::Database(_) | Self::Sqlx(_) | Self::Io(_) | Self::Internal(_) => code::INTERNAL,
        }
    }

    /// Returns the exit code for this error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::Database(_) | Self::Sqlx(_) => 3,
            Self::Saturated { .. } | Self::ShuttingDown => 4,
            Self::NotFound(_) => 5,
            Self::Conflict(_) => 6,
            Self::Io(_) => 7,
            Self::Serialization(_) => 8,
            Self::Internal(_) => 9,
            Self::EnvironmentBuild { .. } => 10,
            Self::Hook { .. } => 11,
            Self::Execution(_) => 12,
        }
    }

    /// Backpressure is recoverable by the caller; everything else is not.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Saturated { .. } | Self::ShuttingDown)
    }

    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Saturated { retry_after_ms, .. } => Some(Duration::from_millis(*retry_after_ms)),
            _ => None,
        }
    }
}

/// Protocol error codes as documented in the CLI
pub const ERROR_CODES: &[(&str, &str, &str)] = &[
    (
        code::CLI_ERROR,
        "Invalid CLI usage",
        "Run 'runengine --help' for valid options",
    ),
    (
        code::SATURATED,
        "Run queue is at capacity",
        "Wait for the retry-after hint and submit again",
    ),
    (
        code::NOTFOUND,
        "Run or configuration version was not found",
        "Verify the identifier and retry",
    ),
    (
        code::CONFLICT,
        "Conflicting state transition",
        "Run 'runengine status <run_id>' to inspect current state",
    ),
    (
        code::ENV_BUILD,
        "Configuration environment could not be built or activated",
        "Fix the failing install step or on_activate hook, then run 'runengine activate'",
    ),
    (
        code::HOOK,
        "A lifecycle hook failed during the run",
        "Inspect the run events for the failing stage and hook",
    ),
    (
        code::EXECUTION,
        "Extraction process failed",
        "Inspect the run events for captured output",
    ),
    (
        code::INVALID,
        "Invalid configuration or payload",
        "Validate JSON syntax and configuration values",
    ),
    (
        code::UNAVAILABLE,
        "Engine is draining",
        "Retry once the engine has restarted",
    ),
    (
        code::INTERNAL,
        "Unexpected internal failure",
        "Inspect logs and retry command",
    ),
];

/// Get error code details (description and fix) for a given error code
#[must_use]
pub fn get_error_info(error_code: &str) -> Option<(&'static str, &'static str)> {
    ERROR_CODES
        .iter()
        .find(|(code, _, _)| *code == error_code)
        .map(|(_, desc, fix)| (*desc, *fix))
}

pub type Result<T> = std::result::Result<T, EngineError>;
