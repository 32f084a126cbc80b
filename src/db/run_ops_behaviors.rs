// BDD-style tests for run persistence: admission, claiming, completion and recovery.

use crate::db::{Admission, RunStore};
use crate::types::{
    ConfigurationVersionId, NewRunEvent, Run, RunEventType, RunOutcome, RunState, SubmitRequest,
};
use chrono::{Duration, Utc};
use futures_util::future::join_all;
use serde_json::json;
use std::collections::HashSet;

async fn test_store() -> (tempfile::TempDir, RunStore) {
    let dir = tempfile::TempDir::new().unwrap_or_else(|e| panic!("tempdir failed: {e}"));
    let url = format!("sqlite://{}", dir.path().join("runs.db").display());
    let store = RunStore::new(&url, 4)
        .await
        .unwrap_or_else(|e| panic!("store failed: {e}"));
    (dir, store)
}

fn queued_run(label: &str) -> Run {
    Run::new_queued(
        &SubmitRequest::live(ConfigurationVersionId::new("invoices-v1"), json!({"doc": label})),
        Utc::now(),
    )
}

fn enqueue() -> Vec<NewRunEvent> {
    vec![NewRunEvent::new(RunEventType::Enqueue, RunState::Queued)]
}

fn start() -> NewRunEvent {
    NewRunEvent::new(RunEventType::Start, RunState::Running)
}

async fn admit(store: &RunStore, run: &Run, capacity: u32) -> Admission {
    store
        .admit_run(run, capacity, &enqueue())
        .await
        .unwrap_or_else(|e| panic!("admit failed: {e}"))
}

mod admission {
    use super::*;

    #[tokio::test]
    async fn given_capacity_reached_then_insert_is_refused_with_outstanding_count() {
        let (_dir, store) = test_store().await;

        for n in 0..3 {
            assert!(matches!(
                admit(&store, &queued_run(&n.to_string()), 3).await,
                Admission::Admitted(_)
            ));
        }

        let refused = queued_run("overflow");
        assert_eq!(
            admit(&store, &refused, 3).await,
            Admission::Saturated { outstanding: 3 }
        );
        assert!(store.get_run(&refused.id).await.unwrap_or(None).is_none());
    }

    #[tokio::test]
    async fn given_concurrent_submitters_then_capacity_is_never_exceeded() {
        let (_dir, store) = test_store().await;

        let results = join_all((0..12).map(|n| {
            let store = store.clone();
            async move { admit(&store, &queued_run(&n.to_string()), 5).await }
        }))
        .await;

        let admitted = results
            .iter()
            .filter(|r| matches!(r, Admission::Admitted(_)))
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(store.outstanding_count().await.unwrap_or(0), 5);
    }

    #[tokio::test]
    async fn admitted_run_starts_its_event_log_at_sequence_one() {
        let (_dir, store) = test_store().await;
        let run = queued_run("a");

        let Admission::Admitted(events) = admit(&store, &run, 10).await else {
            panic!("expected admission");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[0].event_type, RunEventType::Enqueue);
        assert_eq!(events[0].attempt, 1);
    }
}

mod claiming {
    use super::*;

    #[tokio::test]
    async fn given_queued_runs_then_oldest_is_claimed_first() {
        let (_dir, store) = test_store().await;
        let first = queued_run("first");
        let second = Run {
            queued_at: first.queued_at + Duration::milliseconds(5),
            ..queued_run("second")
        };
        admit(&store, &second, 10).await;
        admit(&store, &first, 10).await;

        let (claimed, start_event) = store
            .claim_next_run("worker-1", &start())
            .await
            .unwrap_or(None)
            .unwrap_or_else(|| panic!("expected a claim"));

        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, RunState::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
        assert!(claimed.started_at.is_some());
        assert_eq!(start_event.sequence, 2);
    }

    #[tokio::test]
    async fn given_many_workers_then_each_run_is_claimed_exactly_once() {
        let (_dir, store) = test_store().await;
        for n in 0..6 {
            admit(&store, &queued_run(&n.to_string()), 20).await;
        }

        let claims = join_all((0..10).map(|n| {
            let store = store.clone();
            async move {
                store
                    .claim_next_run(&format!("worker-{n}"), &start())
                    .await
                    .ok()
                    .flatten()
                    .map(|(run, _)| run.id)
            }
        }))
        .await;

        let claimed: Vec<_> = claims.into_iter().flatten().collect();
        let unique: HashSet<_> = claimed.iter().collect();
        assert_eq!(claimed.len(), 6);
        assert_eq!(unique.len(), 6);
    }
}

mod completion {
    use super::*;

    #[tokio::test]
    async fn only_the_owning_worker_can_complete_a_run() {
        let (_dir, store) = test_store().await;
        let run = queued_run("owned");
        admit(&store, &run, 10).await;
        store.claim_next_run("worker-a", &start()).await.unwrap_or(None);

        let exit = [NewRunEvent::new(RunEventType::Exit, RunState::Succeeded)];
        let outcome = RunOutcome::succeeded(0, Some(json!({"rows": 4})));

        let stolen = store
            .complete_run(&run.id, "worker-b", &outcome, &exit)
            .await
            .unwrap_or_else(|e| panic!("complete failed: {e}"));
        assert!(stolen.is_none());

        let (completed, events) = store
            .complete_run(&run.id, "worker-a", &outcome, &exit)
            .await
            .unwrap_or_else(|e| panic!("complete failed: {e}"))
            .unwrap_or_else(|| panic!("owner should complete"));
        assert_eq!(completed.state, RunState::Succeeded);
        assert_eq!(completed.summary, Some(json!({"rows": 4})));
        assert!(completed.completed_at.is_some());
        assert_eq!(events[0].sequence, 3);

        let again = store
            .complete_run(&run.id, "worker-a", &outcome, &exit)
            .await
            .unwrap_or_else(|e| panic!("complete failed: {e}"));
        assert!(again.is_none(), "terminal runs never transition again");
    }

    #[tokio::test]
    async fn heartbeat_reports_persisted_cancel_request() {
        let (_dir, store) = test_store().await;
        let run = queued_run("hb");
        admit(&store, &run, 10).await;
        store.claim_next_run("worker-a", &start()).await.unwrap_or(None);

        assert_eq!(store.record_heartbeat(&run.id, "worker-a").await.unwrap_or(None), Some(false));
        assert!(store.request_cancel(&run.id).await.unwrap_or(false));
        assert_eq!(store.record_heartbeat(&run.id, "worker-a").await.unwrap_or(None), Some(true));
        assert_eq!(store.record_heartbeat(&run.id, "worker-b").await.unwrap_or(Some(true)), None);
    }

    #[tokio::test]
    async fn queued_run_cancels_immediately_but_running_run_does_not() {
        let (_dir, store) = test_store().await;
        let waiting = queued_run("waiting");
        admit(&store, &waiting, 10).await;

        let exit = [NewRunEvent::new(RunEventType::Exit, RunState::Cancelled)];
        let (cancelled, _) = store
            .cancel_queued_run(&waiting.id, &exit)
            .await
            .unwrap_or(None)
            .unwrap_or_else(|| panic!("queued run should cancel"));
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert!(cancelled.cancel_requested);

        let busy = queued_run("busy");
        admit(&store, &busy, 10).await;
        store.claim_next_run("worker-a", &start()).await.unwrap_or(None);
        assert!(store
            .cancel_queued_run(&busy.id, &exit)
            .await
            .unwrap_or(None)
            .is_none());
    }
}

mod recovery {
    use super::*;

    #[tokio::test]
    async fn stale_run_is_requeued_once_with_incremented_counter() {
        let (_dir, store) = test_store().await;
        let run = queued_run("crashed");
        admit(&store, &run, 10).await;
        store.claim_next_run("dead-worker", &start()).await.unwrap_or(None);

        let future_cutoff = Utc::now() + Duration::seconds(60);
        let stale = store.stale_running_runs(future_cutoff).await.unwrap_or_default();
        assert_eq!(stale.len(), 1);

        let requeue = [NewRunEvent::new(RunEventType::Enqueue, RunState::Queued)
            .with_detail(json!({"reason": "rehydrated"}))];
        let (requeued, _) = store
            .requeue_stale_run(&run.id, future_cutoff, &requeue)
            .await
            .unwrap_or(None)
            .unwrap_or_else(|| panic!("stale run should requeue"));

        assert_eq!(requeued.state, RunState::Queued);
        assert_eq!(requeued.rehydrated_count, 1);
        assert!(requeued.worker_id.is_none());
        assert_eq!(store.record_heartbeat(&run.id, "dead-worker").await.unwrap_or(Some(true)), None);
    }

    #[tokio::test]
    async fn fresh_heartbeat_is_not_stale() {
        let (_dir, store) = test_store().await;
        let run = queued_run("alive");
        admit(&store, &run, 10).await;
        store.claim_next_run("worker", &start()).await.unwrap_or(None);

        let past_cutoff = Utc::now() - Duration::seconds(60);
        assert!(store.stale_running_runs(past_cutoff).await.unwrap_or_default().is_empty());
        assert!(store
            .requeue_stale_run(&run.id, past_cutoff, &[])
            .await
            .unwrap_or(None)
            .is_none());
    }
}

mod lineage {
    use super::*;

    #[tokio::test]
    async fn lineage_is_reachable_from_any_attempt() {
        let (_dir, store) = test_store().await;
        let first = queued_run("original");
        admit(&store, &first, 10).await;
        let second = first.next_attempt(Utc::now());
        admit(&store, &second, 10).await;
        let third = second.next_attempt(Utc::now());
        admit(&store, &third, 10).await;

        let from_middle: Vec<_> = store
            .lineage(&second.id)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|run| (run.id, run.attempt))
            .collect();

        assert_eq!(from_middle, vec![(first.id, 1), (second.id, 2), (third.id, 3)]);
        assert_eq!(store.lineage(&first.id).await.unwrap_or_default().len(), 3);
    }

    #[tokio::test]
    async fn events_after_returns_only_the_tail() {
        let (_dir, store) = test_store().await;
        let run = queued_run("tail");
        admit(&store, &run, 10).await;
        store
            .append_event(&run.id, &NewRunEvent::log(RunState::Queued, json!({"line": "x"}), 1))
            .await
            .unwrap_or_else(|e| panic!("append failed: {e}"));

        let tail = store.events_after(&run.id, 1).await.unwrap_or_default();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 2);
        assert_eq!(store.events(&run.id).await.unwrap_or_default().len(), 2);
    }
}
