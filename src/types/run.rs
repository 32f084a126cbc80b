use super::hook::HookAnnotation;
use super::identifiers::{ConfigurationVersionId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RunState {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown run state: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Live,
    ValidateOnly,
}

impl RunMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::ValidateOnly => "validate_only",
        }
    }
}

impl TryFrom<&str> for RunMode {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "live" => Ok(Self::Live),
            "validate_only" => Ok(Self::ValidateOnly),
            _ => Err(format!("Unknown run mode: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub configuration_version_id: ConfigurationVersionId,
    pub input: Value,
    #[serde(default)]
    pub mode: RunMode,
}

impl SubmitRequest {
    #[must_use]
    pub fn live(configuration_version_id: ConfigurationVersionId, input: Value) -> Self {
        Self {
            configuration_version_id,
            input,
            mode: RunMode::Live,
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }
}

/// One execution attempt of a configuration version against an input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub configuration_version_id: ConfigurationVersionId,
    pub attempt: u32,
    pub retry_of_run_id: Option<RunId>,
    pub mode: RunMode,
    pub input: Value,
    pub state: RunState,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub cancel_requested: bool,
    pub rehydrated_count: u32,
    pub exit_code: Option<i32>,
    pub summary: Option<Value>,
    pub error_message: Option<String>,
}

impl Run {
    /// A fresh first attempt, not yet persisted.
    #[must_use]
    pub fn new_queued(request: &SubmitRequest, queued_at: DateTime<Utc>) -> Self {
        Self {
            id: RunId::generate(),
            configuration_version_id: request.configuration_version_id.clone(),
            attempt: 1,
            retry_of_run_id: None,
            mode: request.mode,
            input: request.input.clone(),
            state: RunState::Queued,
            queued_at,
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
            worker_id: None,
            cancel_requested: false,
            rehydrated_count: 0,
            exit_code: None,
            summary: None,
            error_message: None,
        }
    }

    /// The next attempt in this run's retry lineage.
    #[must_use]
    pub fn next_attempt(&self, queued_at: DateTime<Utc>) -> Self {
        Self {
            id: RunId::generate(),
            attempt: self.attempt.saturating_add(1),
            retry_of_run_id: Some(self.id),
            ..Self::new_queued(
                &SubmitRequest {
                    configuration_version_id: self.configuration_version_id.clone(),
                    input: self.input.clone(),
                    mode: self.mode,
                },
                queued_at,
            )
        }
    }

    #[must_use]
    pub fn status_view(&self) -> RunStatusView {
        RunStatusView {
            run_id: self.id,
            state: self.state,
            attempt: self.attempt,
            retry_of_run_id: self.retry_of_run_id,
            queued_at: self.queued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            exit_code: self.exit_code,
            error_message: self.error_message.clone(),
        }
    }
}

/// Poll response shape handed to the API layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: RunId,
    pub state: RunState,
    pub attempt: u32,
    pub retry_of_run_id: Option<RunId>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

/// Terminal result of one execution, as decided by the runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub summary: Option<Value>,
    pub error_message: Option<String>,
    pub error_category: Option<String>,
    /// Every hook annotation recorded before the run ended.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<HookAnnotation>,
}

impl RunOutcome {
    #[must_use]
    pub const fn succeeded(exit_code: i32, summary: Option<Value>) -> Self {
        Self {
            state: RunState::Succeeded,
            exit_code: Some(exit_code),
            summary,
            error_message: None,
            error_category: None,
            annotations: Vec::new(),
        }
    }

    #[must_use]
    pub fn failed(
        exit_code: Option<i32>,
        category: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            state: RunState::Failed,
            exit_code,
            summary: None,
            error_message: Some(message.into()),
            error_category: Some(category.into()),
            annotations: Vec::new(),
        }
    }

    #[must_use]
    pub fn cancelled(exit_code: Option<i32>) -> Self {
        Self {
            state: RunState::Cancelled,
            exit_code,
            summary: None,
            error_message: Some("Run cancelled by request".to_string()),
            error_category: None,
            annotations: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_annotations(mut self, annotations: Vec<HookAnnotation>) -> Self {
        self.annotations = annotations;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{Run, RunMode, RunState, SubmitRequest};
    use crate::types::ConfigurationVersionId;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn only_finished_states_are_terminal() {
        assert!(!RunState::Queued.is_terminal());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Succeeded.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(RunState::Cancelled.is_terminal());
    }

    #[test]
    fn state_strings_round_trip_and_reject_unknown() {
        [
            RunState::Queued,
            RunState::Running,
            RunState::Succeeded,
            RunState::Failed,
            RunState::Cancelled,
        ]
        .iter()
        .for_each(|state| assert_eq!(RunState::try_from(state.as_str()), Ok(*state)));
        assert!(RunState::try_from("paused").is_err());
        assert_eq!(RunMode::try_from("validate_only"), Ok(RunMode::ValidateOnly));
    }

    #[test]
    fn next_attempt_links_back_to_source() {
        let request = SubmitRequest::live(
            ConfigurationVersionId::new("invoices-v1"),
            json!({"document": "a.pdf"}),
        )
        .with_mode(RunMode::ValidateOnly);
        let first = Run::new_queued(&request, Utc::now());
        let second = first.next_attempt(Utc::now());

        assert_eq!(first.attempt, 1);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.retry_of_run_id, Some(first.id));
        assert_ne!(second.id, first.id);
        assert_eq!(second.mode, RunMode::ValidateOnly);
        assert_eq!(second.input, first.input);
        assert_eq!(second.state, RunState::Queued);
    }
}
