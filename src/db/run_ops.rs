use crate::db::event_ops::append_event_with;
use crate::db::mappers::{to_u32, RunRow, RUN_COLUMNS};
use crate::db::RunStore;
use crate::error::{EngineError, Result};
use crate::timing::dt_to_ms;
use crate::types::{NewRunEvent, Run, RunEvent, RunId, RunOutcome};
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

/// Result of a capacity-checked insert.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Admitted(Vec<RunEvent>),
    Saturated { outstanding: u32 },
}

impl RunStore {
    /// Insert `run` as queued only while fewer than `capacity` runs are
    /// queued or running, then append `events` to it. The count and the
    /// insert are one statement.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn admit_run(
        &self,
        run: &Run,
        capacity: u32,
        events: &[NewRunEvent],
    ) -> Result<Admission> {
        let mut tx = self.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO runs (run_id, configuration_version_id, attempt, retry_of_run_id, mode,
                               input, state, queued_at, cancel_requested, rehydrated_count)
             SELECT ?, ?, ?, ?, ?, ?, 'queued', ?, 0, 0
             WHERE (SELECT COUNT(*) FROM runs WHERE state IN ('queued', 'running')) < ?",
        )
        .bind(run.id.to_string())
        .bind(run.configuration_version_id.value())
        .bind(i64::from(run.attempt))
        .bind(run.retry_of_run_id.map(|id| id.to_string()))
        .bind(run.mode.as_str())
        .bind(serde_json::to_string(&run.input)?)
        .bind(dt_to_ms(run.queued_at))
        .bind(i64::from(capacity))
        .execute(&mut *tx)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to insert run: {e}")))?
        .rows_affected();

        if inserted == 0 {
            let outstanding = count_outstanding_with(&mut tx).await?;
            return Ok(Admission::Saturated { outstanding });
        }

        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            appended.push(append_event_with(&mut *tx, &run.id, event).await?);
        }
        commit(tx).await?;
        Ok(Admission::Admitted(appended))
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn get_run(&self, run_id: &RunId) -> Result<Option<Run>> {
        sqlx::query_as::<_, RunRow>(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?"))
            .bind(run_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| EngineError::Database(format!("Failed to load run: {e}")))?
            .map(Run::try_from)
            .transpose()
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn outstanding_count(&self) -> Result<u32> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE state IN ('queued', 'running')")
                .fetch_one(self.pool())
                .await
                .map_err(|e| EngineError::Database(format!("Failed to count runs: {e}")))?;
        Ok(to_u32(count))
    }

    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<Run>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY queued_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(i64::from(limit))
        .fetch_all(self.pool())
        .await
        .map_err(|e| EngineError::Database(format!("Failed to list runs: {e}")))?
        .into_iter()
        .map(Run::try_from)
        .collect()
    }

    /// Atomically move the oldest queued run to running for `worker_id` and
    /// record its `start` event. At most one claimant can win a given run.
    /// `started_at` keeps the first claim; each later claim is in its `start` event.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn claim_next_run(
        &self,
        worker_id: &str,
        start_event: &NewRunEvent,
    ) -> Result<Option<(Run, RunEvent)>> {
        let now = dt_to_ms(Utc::now());
        let mut tx = self.begin().await?;

        let claimed = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs
             SET state = 'running', worker_id = ?, started_at = COALESCE(started_at, ?), heartbeat_at = ?
             WHERE run_id = (
                 SELECT run_id FROM runs
                 WHERE state = 'queued'
                 ORDER BY queued_at ASC, rowid ASC
                 LIMIT 1
             )
             AND state = 'queued'
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to claim run: {e}")))?
        .map(Run::try_from)
        .transpose()?;

        match claimed {
            Some(run) => {
                let event = append_event_with(&mut *tx, &run.id, start_event).await?;
                commit(tx).await?;
                Ok(Some((run, event)))
            }
            None => Ok(None),
        }
    }

    /// Refresh the heartbeat of a run still owned by `worker_id`. Returns the
    /// persisted cancellation flag, or `None` once ownership is lost.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn record_heartbeat(&self, run_id: &RunId, worker_id: &str) -> Result<Option<bool>> {
        sqlx::query_scalar::<_, bool>(
            "UPDATE runs SET heartbeat_at = ?
             WHERE run_id = ? AND worker_id = ? AND state = 'running'
             RETURNING cancel_requested",
        )
        .bind(dt_to_ms(Utc::now()))
        .bind(run_id.to_string())
        .bind(worker_id)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| EngineError::Database(format!("Failed to record heartbeat: {e}")))
    }

    /// Persist a terminal outcome for a run still owned by `worker_id` and
    /// append `events`. Returns `None` if another party already moved the run.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn complete_run(
        &self,
        run_id: &RunId,
        worker_id: &str,
        outcome: &RunOutcome,
        events: &[NewRunEvent],
    ) -> Result<Option<(Run, Vec<RunEvent>)>> {
        if !outcome.state.is_terminal() {
            return Err(EngineError::Internal(format!(
                "Cannot complete run {run_id} in non-terminal state {}",
                outcome.state
            )));
        }

        let mut tx = self.begin().await?;
        let completed = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs
             SET state = ?, completed_at = ?, exit_code = ?, summary = ?, error_message = ?
             WHERE run_id = ? AND worker_id = ? AND state = 'running'
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(outcome.state.as_str())
        .bind(dt_to_ms(Utc::now()))
        .bind(outcome.exit_code.map(i64::from))
        .bind(outcome.summary.as_ref().map(serde_json::to_string).transpose()?)
        .bind(outcome.error_message.as_deref())
        .bind(run_id.to_string())
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to complete run: {e}")))?
        .map(Run::try_from)
        .transpose()?;

        finish_with_events(tx, completed, events).await
    }

    /// Cancel a run that has not started. Returns `None` if it was no longer queued.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn cancel_queued_run(
        &self,
        run_id: &RunId,
        events: &[NewRunEvent],
    ) -> Result<Option<(Run, Vec<RunEvent>)>> {
        let mut tx = self.begin().await?;
        let cancelled = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs
             SET state = 'cancelled', cancel_requested = 1, completed_at = ?,
                 error_message = 'Run cancelled by request'
             WHERE run_id = ? AND state = 'queued'
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(dt_to_ms(Utc::now()))
        .bind(run_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to cancel run: {e}")))?
        .map(Run::try_from)
        .transpose()?;

        finish_with_events(tx, cancelled, events).await
    }

    /// Flag a running run for cooperative cancellation.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn request_cancel(&self, run_id: &RunId) -> Result<bool> {
        sqlx::query("UPDATE runs SET cancel_requested = 1 WHERE run_id = ? AND state = 'running'")
            .bind(run_id.to_string())
            .execute(self.pool())
            .await
            .map(|result| result.rows_affected() > 0)
            .map_err(|e| EngineError::Database(format!("Failed to request cancellation: {e}")))
    }

    /// Running runs whose last heartbeat is older than `cutoff`.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn stale_running_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE state = 'running'
               AND COALESCE(heartbeat_at, started_at, queued_at) < ?
             ORDER BY queued_at ASC, rowid ASC"
        ))
        .bind(dt_to_ms(cutoff))
        .fetch_all(self.pool())
        .await
        .map_err(|e| EngineError::Database(format!("Failed to list stale runs: {e}")))?
        .into_iter()
        .map(Run::try_from)
        .collect()
    }

    /// Return a stale run to the queue, keeping its original queue position.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn requeue_stale_run(
        &self,
        run_id: &RunId,
        cutoff: DateTime<Utc>,
        events: &[NewRunEvent],
    ) -> Result<Option<(Run, Vec<RunEvent>)>> {
        let mut tx = self.begin().await?;
        let requeued = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs
             SET state = 'queued', worker_id = NULL, heartbeat_at = NULL,
                 rehydrated_count = rehydrated_count + 1
             WHERE run_id = ? AND state = 'running'
               AND COALESCE(heartbeat_at, started_at, queued_at) < ?
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(run_id.to_string())
        .bind(dt_to_ms(cutoff))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to requeue run: {e}")))?
        .map(Run::try_from)
        .transpose()?;

        finish_with_events(tx, requeued, events).await
    }

    /// Terminate a stale run without requeueing it.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn finish_stale_run(
        &self,
        run_id: &RunId,
        cutoff: DateTime<Utc>,
        outcome: &RunOutcome,
        events: &[NewRunEvent],
    ) -> Result<Option<(Run, Vec<RunEvent>)>> {
        let mut tx = self.begin().await?;
        let finished = sqlx::query_as::<_, RunRow>(&format!(
            "UPDATE runs
             SET state = ?, completed_at = ?, exit_code = ?, error_message = ?
             WHERE run_id = ? AND state = 'running'
               AND COALESCE(heartbeat_at, started_at, queued_at) < ?
             RETURNING {RUN_COLUMNS}"
        ))
        .bind(outcome.state.as_str())
        .bind(dt_to_ms(Utc::now()))
        .bind(outcome.exit_code.map(i64::from))
        .bind(outcome.error_message.as_deref())
        .bind(run_id.to_string())
        .bind(dt_to_ms(cutoff))
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to finish stale run: {e}")))?
        .map(Run::try_from)
        .transpose()?;

        finish_with_events(tx, finished, events).await
    }

    /// Every run in the retry tree containing `run_id`, oldest attempt first.
    ///
    /// # Errors
    /// Returns an error if the database operation fails.
    pub async fn lineage(&self, run_id: &RunId) -> Result<Vec<Run>> {
        sqlx::query_as::<_, RunRow>(&format!(
            "WITH RECURSIVE
                 ancestors(run_id, retry_of_run_id) AS (
                     SELECT run_id, retry_of_run_id FROM runs WHERE run_id = ?
                     UNION
                     SELECT r.run_id, r.retry_of_run_id
                     FROM runs r JOIN ancestors a ON r.run_id = a.retry_of_run_id
                 ),
                 tree(run_id) AS (
                     SELECT run_id FROM ancestors WHERE retry_of_run_id IS NULL
                     UNION
                     SELECT r.run_id FROM runs r JOIN tree t ON r.retry_of_run_id = t.run_id
                 )
             SELECT {RUN_COLUMNS} FROM runs
             WHERE run_id IN (SELECT run_id FROM tree)
             ORDER BY attempt ASC, queued_at ASC, rowid ASC"
        ))
        .bind(run_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(|e| EngineError::Database(format!("Failed to load lineage: {e}")))?
        .into_iter()
        .map(Run::try_from)
        .collect()
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool()
            .begin()
            .await
            .map_err(|e| EngineError::Database(format!("Failed to begin tx: {e}")))
    }
}

async fn count_outstanding_with(tx: &mut Transaction<'static, Sqlite>) -> Result<u32> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE state IN ('queued', 'running')")
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| EngineError::Database(format!("Failed to count runs: {e}")))?;
    Ok(to_u32(count))
}

async fn finish_with_events(
    mut tx: Transaction<'static, Sqlite>,
    run: Option<Run>,
    events: &[NewRunEvent],
) -> Result<Option<(Run, Vec<RunEvent>)>> {
    let Some(run) = run else {
        return Ok(None);
    };

    let mut appended = Vec::with_capacity(events.len());
    for event in events {
        appended.push(append_event_with(&mut *tx, &run.id, event).await?);
    }
    commit(tx).await?;
    Ok(Some((run, appended)))
}

async fn commit(tx: Transaction<'static, Sqlite>) -> Result<()> {
    tx.commit()
        .await
        .map_err(|e| EngineError::Database(format!("Failed to commit tx: {e}")))
}
