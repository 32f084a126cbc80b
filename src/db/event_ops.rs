use crate::db::mappers::{to_i64, to_u32, to_u64, EventRow, EVENT_COLUMNS};
use crate::db::RunStore;
use crate::error::{EngineError, Result};
use crate::timing::{dt_to_ms, ms_to_dt};
use crate::types::{NewRunEvent, RunEvent, RunId};
use chrono::Utc;
use sqlx::{Executor, Sqlite};

impl RunStore {
    /// Append one event, assigning the next sequence number for the run.
    ///
    /// # Errors
    /// Returns `EngineError::NotFound` if the run does not exist.
    pub async fn append_event(&self, run_id: &RunId, event: &NewRunEvent) -> Result<RunEvent> {
        append_event_with(self.pool(), run_id, event).await
    }

    /// Append an event on behalf of the worker executing the run. Returns
    /// `None` once `worker_id` no longer owns a running claim on it.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn append_owned_event(
        &self,
        run_id: &RunId,
        worker_id: &str,
        event: &NewRunEvent,
    ) -> Result<Option<RunEvent>> {
        insert_event(self.pool(), run_id, Some(worker_id), event).await
    }

    /// All events for `run_id` with a sequence greater than `after_sequence`, in order.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn events_after(&self, run_id: &RunId, after_sequence: u64) -> Result<Vec<RunEvent>> {
        sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {EVENT_COLUMNS} FROM run_events
             WHERE run_id = ? AND sequence > ?
             ORDER BY sequence ASC"
        ))
        .bind(run_id.to_string())
        .bind(to_i64(after_sequence))
        .fetch_all(self.pool())
        .await
        .map_err(|e| EngineError::Database(format!("Failed to read run events: {e}")))?
        .into_iter()
        .map(RunEvent::try_from)
        .collect()
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        self.events_after(run_id, 0).await
    }
}

pub async fn append_event_with<'c, E>(
    executor: E,
    run_id: &RunId,
    event: &NewRunEvent,
) -> Result<RunEvent>
where
    E: Executor<'c, Database = Sqlite>,
{
    insert_event(executor, run_id, None, event)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("run {run_id}")))
}

/// Sequence allocation and insert happen in one statement, so concurrent
/// appenders for the same run can never observe the same `MAX(sequence)`.
/// With an `owner`, nothing is written unless that worker holds the run.
async fn insert_event<'c, E>(
    executor: E,
    run_id: &RunId,
    owner: Option<&str>,
    event: &NewRunEvent,
) -> Result<Option<RunEvent>>
where
    E: Executor<'c, Database = Sqlite>,
{
    let timestamp_ms = dt_to_ms(Utc::now());
    let detail = event
        .detail
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let row: Option<(i64, i64)> = sqlx::query_as(
        "INSERT INTO run_events (run_id, sequence, timestamp, event_type, attempt, state, duration_ms, detail)
         SELECT r.run_id,
                COALESCE((SELECT MAX(e.sequence) FROM run_events e WHERE e.run_id = r.run_id), 0) + 1,
                ?, ?, r.attempt, ?, ?, ?
         FROM runs r
         WHERE r.run_id = ?
           AND (? IS NULL OR (r.worker_id = ? AND r.state = 'running'))
         RETURNING sequence, attempt",
    )
    .bind(timestamp_ms)
    .bind(event.event_type.as_str())
    .bind(event.state.as_str())
    .bind(event.duration_ms.map(to_i64))
    .bind(detail)
    .bind(run_id.to_string())
    .bind(owner)
    .bind(owner)
    .fetch_optional(executor)
    .await
    .map_err(|e| EngineError::Database(format!("Failed to append run event: {e}")))?;

    let Some((sequence, attempt)) = row else {
        return Ok(None);
    };

    Ok(Some(RunEvent {
        run_id: *run_id,
        sequence: to_u64(sequence),
        timestamp: ms_to_dt(timestamp_ms),
        event_type: event.event_type,
        attempt: to_u32(attempt),
        state: event.state,
        duration_ms: event.duration_ms,
        detail: event.detail.clone(),
    }))
}
