use crate::db::RunStore;
use crate::error::Result;
use crate::types::{NewRunEvent, Run, RunEvent, RunEventType, RunId, RunOutcome, RunState};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

/// What one recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub requeued: Vec<RunId>,
    pub cancelled: Vec<RunId>,
    pub failed: Vec<RunId>,
}

impl RecoveryReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.cancelled.is_empty() && self.failed.is_empty()
    }
}

/// Recover every `running` run whose heartbeat is older than `stale_after`.
///
/// A run goes back to the queue the first time. A run already rehydrated once
/// is failed rather than looped, and a run whose cancellation was requested
/// is cancelled. Every event written is returned through `published`.
///
/// # Errors
/// Returns an error if the database operation fails.
pub async fn recover_stale_runs(
    store: &RunStore,
    stale_after: Duration,
    published: &mut Vec<RunEvent>,
) -> Result<RecoveryReport> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
    let stale = store.stale_running_runs(cutoff).await?;
    let mut report = RecoveryReport::default();

    for run in stale {
        let (kind, events) = if run.cancel_requested {
            let events = finish(store, &run, cutoff, RunOutcome::cancelled(None), &[]).await?;
            (RunState::Cancelled, events)
        } else if run.rehydrated_count == 0 {
            let events = store
                .requeue_stale_run(&run.id, cutoff, &[requeue_event(&run)])
                .await?
                .map(|(_, events)| events);
            (RunState::Queued, events)
        } else {
            let message = format!(
                "heartbeat lost again after rehydration (last worker {}); run abandoned",
                run.worker_id.as_deref().unwrap_or("unknown")
            );
            let outcome = RunOutcome::failed(None, "orphaned", message.clone());
            let error = NewRunEvent::new(RunEventType::Error, RunState::Failed)
                .with_detail(json!({"category": "orphaned", "message": message}));
            (RunState::Failed, finish(store, &run, cutoff, outcome, &[error]).await?)
        };

        let Some(events) = events else {
            warn!(run_id = %run.id, "Stale run changed state during recovery; skipped");
            continue;
        };
        match kind {
            RunState::Queued => report.requeued.push(run.id),
            RunState::Cancelled => report.cancelled.push(run.id),
            _ => report.failed.push(run.id),
        }
        published.extend(events);
    }

    if !report.is_empty() {
        info!(
            requeued = report.requeued.len(),
            cancelled = report.cancelled.len(),
            failed = report.failed.len(),
            "Recovered stale runs"
        );
    }
    Ok(report)
}

fn requeue_event(run: &Run) -> NewRunEvent {
    NewRunEvent::new(RunEventType::Enqueue, RunState::Queued).with_detail(json!({
        "reason": "rehydrated",
        "previous_worker_id": run.worker_id,
        "last_heartbeat_at": run.heartbeat_at,
    }))
}

async fn finish(
    store: &RunStore,
    run: &Run,
    cutoff: chrono::DateTime<Utc>,
    outcome: RunOutcome,
    leading: &[NewRunEvent],
) -> Result<Option<Vec<RunEvent>>> {
    let exit = NewRunEvent::new(RunEventType::Exit, outcome.state).with_detail(json!({
        "exit_code": outcome.exit_code,
        "error_message": outcome.error_message,
        "reason": "stale_heartbeat",
    }));
    let events = leading
        .iter()
        .cloned()
        .chain(std::iter::once(exit))
        .collect::<Vec<_>>();
    Ok(store
        .finish_stale_run(&run.id, cutoff, &outcome, &events)
        .await?
        .map(|(_, events)| events))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::recover_stale_runs;
    use crate::db::RunStore;
    use crate::types::{
        ConfigurationVersionId, NewRunEvent, Run, RunEventType, RunState, SubmitRequest,
    };
    use serde_json::json;
    use std::time::Duration;

    const STALE_NOW: Duration = Duration::ZERO;

    async fn running_run(store: &RunStore, worker_id: &str) -> Run {
        let run = Run::new_queued(
            &SubmitRequest::live(ConfigurationVersionId::new("invoices-v1"), json!({})),
            chrono::Utc::now(),
        );
        store.admit_run(&run, 10, &[]).await.unwrap();
        claim(store, worker_id).await
    }

    async fn claim(store: &RunStore, worker_id: &str) -> Run {
        let start = NewRunEvent::new(RunEventType::Start, RunState::Running);
        let (run, _) = store.claim_next_run(worker_id, &start).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        run
    }

    async fn test_store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("runs.db").display());
        let store = RunStore::new(&url, 2).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn run_stale_a_second_time_is_failed_as_orphaned() {
        let (_dir, store) = test_store().await;
        let first_claim = running_run(&store, "w1").await;

        let mut published = Vec::new();
        let report = recover_stale_runs(&store, STALE_NOW, &mut published).await.unwrap();
        assert_eq!(report.requeued, vec![first_claim.id]);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, RunEventType::Enqueue);

        let second_claim = claim(&store, "w2").await;
        assert_eq!(second_claim.rehydrated_count, 1);
        assert_eq!(second_claim.started_at, first_claim.started_at);

        let mut published = Vec::new();
        let report = recover_stale_runs(&store, STALE_NOW, &mut published).await.unwrap();
        assert!(report.requeued.is_empty());
        assert_eq!(report.failed, vec![first_claim.id]);

        let finished = store.get_run(&first_claim.id).await.unwrap().unwrap();
        assert_eq!(finished.state, RunState::Failed);
        assert!(finished.completed_at.is_some());
        assert!(finished
            .error_message
            .as_deref()
            .is_some_and(|m| m.contains("w2")));

        let kinds: Vec<_> = published.iter().map(|e| (e.event_type, e.state)).collect();
        assert_eq!(
            kinds,
            vec![
                (RunEventType::Error, RunState::Failed),
                (RunEventType::Exit, RunState::Failed),
            ]
        );
        assert_eq!(
            published[0].detail.as_ref().map(|d| d["category"].clone()),
            Some(json!("orphaned"))
        );
        assert_eq!(
            published[1].detail.as_ref().map(|d| d["reason"].clone()),
            Some(json!("stale_heartbeat"))
        );

        let persisted = store.events(&first_claim.id).await.unwrap();
        assert_eq!(persisted.last().map(|e| e.event_type), Some(RunEventType::Exit));
        assert!(recover_stale_runs(&store, STALE_NOW, &mut Vec::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn stale_run_with_pending_cancel_is_cancelled_not_requeued() {
        let (_dir, store) = test_store().await;
        let run = running_run(&store, "w1").await;
        assert!(store.request_cancel(&run.id).await.unwrap());

        let mut published = Vec::new();
        let report = recover_stale_runs(&store, STALE_NOW, &mut published).await.unwrap();
        assert!(report.requeued.is_empty());
        assert_eq!(report.cancelled, vec![run.id]);

        let finished = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(finished.state, RunState::Cancelled);
        assert_eq!(finished.rehydrated_count, 0);

        assert_eq!(published.len(), 1);
        assert_eq!(published[0].event_type, RunEventType::Exit);
        assert_eq!(published[0].state, RunState::Cancelled);
        assert!(!published.iter().any(|e| e.event_type == RunEventType::Error));
    }
}
