use super::identifiers::RunId;
use super::run::RunState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventType {
    Enqueue,
    Start,
    Log,
    Exit,
    Retry,
    Error,
}

impl RunEventType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueue => "enqueue",
            Self::Start => "start",
            Self::Log => "log",
            Self::Exit => "exit",
            Self::Retry => "retry",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RunEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RunEventType {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "enqueue" => Ok(Self::Enqueue),
            "start" => Ok(Self::Start),
            "log" => Ok(Self::Log),
            "exit" => Ok(Self::Exit),
            "retry" => Ok(Self::Retry),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown run event type: {s}")),
        }
    }
}

/// Append-only audit record; `sequence` is strictly increasing and gapless per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: RunEventType,
    pub attempt: u32,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl RunEvent {
    /// One line of the newline-delimited event stream.
    ///
    /// # Errors
    /// Returns a serialization error if the detail payload cannot be encoded.
    pub fn to_ndjson(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self.event_type, RunEventType::Exit) && self.state.is_terminal()
    }
}

/// An event as produced by the engine, before the store assigns its
/// sequence, timestamp and attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRunEvent {
    pub event_type: RunEventType,
    pub state: RunState,
    pub duration_ms: Option<u64>,
    pub detail: Option<Value>,
}

impl NewRunEvent {
    #[must_use]
    pub const fn new(event_type: RunEventType, state: RunState) -> Self {
        Self {
            event_type,
            state,
            duration_ms: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn log(state: RunState, detail: Value, duration_ms: u64) -> Self {
        Self::new(RunEventType::Log, state)
            .with_detail(detail)
            .with_duration_ms(duration_ms)
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }

    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{RunEvent, RunEventType};
    use crate::types::{RunId, RunState};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn ndjson_line_carries_stream_fields_and_omits_empty_options() -> Result<(), String> {
        let timestamp = Utc
            .with_ymd_and_hms(2026, 2, 11, 5, 30, 0)
            .single()
            .ok_or_else(|| "invalid test timestamp".to_string())?;
        let event = RunEvent {
            run_id: RunId::generate(),
            sequence: 3,
            timestamp,
            event_type: RunEventType::Log,
            attempt: 1,
            state: RunState::Running,
            duration_ms: None,
            detail: Some(json!({"stream": "stdout", "line": "parsed 4 rows"})),
        };

        let line = event.to_ndjson().map_err(|e| e.to_string())?;
        assert!(!line.contains('\n'));

        let decoded: serde_json::Value = serde_json::from_str(&line).map_err(|e| e.to_string())?;
        assert_eq!(decoded["event_type"], json!("log"));
        assert_eq!(decoded["state"], json!("running"));
        assert_eq!(decoded["sequence"], json!(3));
        assert_eq!(decoded["detail"]["line"], json!("parsed 4 rows"));
        assert!(decoded.get("duration_ms").is_none());
        Ok(())
    }

    #[test]
    fn only_exit_in_terminal_state_ends_a_stream() {
        let base = RunEvent {
            run_id: RunId::generate(),
            sequence: 1,
            timestamp: Utc::now(),
            event_type: RunEventType::Exit,
            attempt: 1,
            state: RunState::Failed,
            duration_ms: Some(10),
            detail: None,
        };
        let error_event = RunEvent {
            event_type: RunEventType::Error,
            ..base.clone()
        };

        assert!(base.is_terminal());
        assert!(!error_event.is_terminal());
        assert_eq!(RunEventType::try_from("retry"), Ok(RunEventType::Retry));
    }
}
