use crate::error::{EngineError, Result};
use crate::timing::ms_to_dt;
use crate::types::{
    ActivationFailure, ActivationHookResult, ActivationState, BuildStep, ConfigurationEnvironment,
    ConfigurationVersionId, Run, RunEvent, RunEventType, RunId, RunMode, RunState,
};
use serde_json::Value;
use sqlx::FromRow;
use std::path::PathBuf;

pub const RUN_COLUMNS: &str = "run_id, configuration_version_id, attempt, retry_of_run_id, mode, \
     input, state, queued_at, started_at, completed_at, heartbeat_at, worker_id, \
     cancel_requested, rehydrated_count, exit_code, summary, error_message";

pub const EVENT_COLUMNS: &str =
    "run_id, sequence, timestamp, event_type, attempt, state, duration_ms, detail";

#[derive(FromRow)]
pub struct RunRow {
    run_id: String,
    configuration_version_id: String,
    attempt: i64,
    retry_of_run_id: Option<String>,
    mode: String,
    input: String,
    state: String,
    queued_at: i64,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    heartbeat_at: Option<i64>,
    worker_id: Option<String>,
    cancel_requested: bool,
    rehydrated_count: i64,
    exit_code: Option<i64>,
    summary: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<RunRow> for Run {
    type Error = EngineError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(Self {
            id: RunId::try_from(row.run_id.as_str()).map_err(EngineError::Database)?,
            configuration_version_id: ConfigurationVersionId::new(row.configuration_version_id),
            attempt: to_u32(row.attempt),
            retry_of_run_id: row
                .retry_of_run_id
                .as_deref()
                .map(RunId::try_from)
                .transpose()
                .map_err(EngineError::Database)?,
            mode: RunMode::try_from(row.mode.as_str()).map_err(EngineError::Database)?,
            input: parse_json(&row.input)?,
            state: RunState::try_from(row.state.as_str()).map_err(EngineError::Database)?,
            queued_at: ms_to_dt(row.queued_at),
            started_at: row.started_at.map(ms_to_dt),
            completed_at: row.completed_at.map(ms_to_dt),
            heartbeat_at: row.heartbeat_at.map(ms_to_dt),
            worker_id: row.worker_id,
            cancel_requested: row.cancel_requested,
            rehydrated_count: to_u32(row.rehydrated_count),
            exit_code: row.exit_code.and_then(|code| i32::try_from(code).ok()),
            summary: row.summary.as_deref().map(parse_json).transpose()?,
            error_message: row.error_message,
        })
    }
}

#[derive(FromRow)]
pub struct EventRow {
    run_id: String,
    sequence: i64,
    timestamp: i64,
    event_type: String,
    attempt: i64,
    state: String,
    duration_ms: Option<i64>,
    detail: Option<String>,
}

impl TryFrom<EventRow> for RunEvent {
    type Error = EngineError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(Self {
            run_id: RunId::try_from(row.run_id.as_str()).map_err(EngineError::Database)?,
            sequence: to_u64(row.sequence),
            timestamp: ms_to_dt(row.timestamp),
            event_type: RunEventType::try_from(row.event_type.as_str())
                .map_err(EngineError::Database)?,
            attempt: to_u32(row.attempt),
            state: RunState::try_from(row.state.as_str()).map_err(EngineError::Database)?,
            duration_ms: row.duration_ms.map(to_u64),
            detail: row.detail.as_deref().map(parse_json).transpose()?,
        })
    }
}

#[derive(FromRow)]
pub struct EnvironmentRow {
    configuration_version_id: String,
    status: String,
    environment_path: Option<String>,
    installed_packages: String,
    install_log: String,
    dependency_digest: Option<String>,
    activation_hook_result: Option<String>,
    failed_step: Option<String>,
    detail: Option<String>,
    updated_at: i64,
}

impl TryFrom<EnvironmentRow> for ActivationState {
    type Error = EngineError;

    fn try_from(row: EnvironmentRow) -> Result<Self> {
        let configuration_version_id = ConfigurationVersionId::new(row.configuration_version_id);
        let hook_result = row
            .activation_hook_result
            .as_deref()
            .map(serde_json::from_str::<ActivationHookResult>)
            .transpose()?;

        match row.status.as_str() {
            "ready" => {
                let environment_path = row.environment_path.ok_or_else(|| {
                    EngineError::Database(format!(
                        "Ready environment for {configuration_version_id} has no path"
                    ))
                })?;
                Ok(Self::Ready(ConfigurationEnvironment {
                    configuration_version_id,
                    environment_path: PathBuf::from(environment_path),
                    installed_packages: serde_json::from_str(&row.installed_packages)?,
                    install_log: row.install_log,
                    dependency_digest: row.dependency_digest,
                    built_at: ms_to_dt(row.updated_at),
                    activation_hook_result: hook_result.unwrap_or_default(),
                }))
            }
            "failed" => Ok(Self::Failed(ActivationFailure {
                configuration_version_id,
                step: row
                    .failed_step
                    .as_deref()
                    .map(BuildStep::try_from)
                    .transpose()
                    .map_err(EngineError::Database)?
                    .unwrap_or(BuildStep::Commit),
                detail: row.detail.unwrap_or_default(),
                install_log: row.install_log,
                activation_hook_result: hook_result,
                failed_at: ms_to_dt(row.updated_at),
            })),
            other => Err(EngineError::Database(format!(
                "Unknown environment status: {other}"
            ))),
        }
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw)
        .map_err(|e| EngineError::Database(format!("Stored JSON is invalid: {e}")))
}

pub fn to_u32(value: i64) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

pub fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
