use super::QueueInner;
use crate::db::RunStore;
use crate::error::EngineError;
use crate::ports::{PortFuture, RunEventSink};
use crate::runner::CancelSignal;
use crate::timing::elapsed_ms;
use crate::types::{NewRunEvent, Run, RunEvent, RunEventType, RunId, RunOutcome, RunState};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Persists a run's events while this worker still owns it, then fans them
/// out to live followers. Losing ownership cancels the execution.
struct RunSink {
    store: RunStore,
    run_id: RunId,
    worker_id: String,
    cancel: CancelSignal,
    events: broadcast::Sender<RunEvent>,
}

impl RunEventSink for RunSink {
    fn emit(&self, event: NewRunEvent) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let Some(persisted) = self
                .store
                .append_owned_event(&self.run_id, &self.worker_id, &event)
                .await?
            else {
                warn!(run_id = %self.run_id, worker_id = %self.worker_id, "Run no longer owned; stopping");
                self.cancel.request();
                return Err(EngineError::Conflict(format!(
                    "run {} is no longer owned by {}",
                    self.run_id, self.worker_id
                )));
            };
            let _ = self.events.send(persisted);
            Ok(())
        })
    }
}

pub(super) async fn worker_loop(
    inner: Arc<QueueInner>,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(worker_id = %worker_id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let start = NewRunEvent::new(RunEventType::Start, RunState::Running)
            .with_detail(json!({"worker_id": worker_id}));
        match inner.store.claim_next_run(&worker_id, &start).await {
            Ok(Some((run, started))) => {
                inner.publish(started);
                execute_claimed(&inner, run, &worker_id).await;
            }
            Ok(None) => idle(&inner, &mut shutdown).await,
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "Failed to claim run");
                idle(&inner, &mut shutdown).await;
            }
        }
    }
    info!(worker_id = %worker_id, "Worker stopped");
}

async fn idle(inner: &QueueInner, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        () = inner.wake.notified() => {}
        _ = shutdown.changed() => {}
        () = tokio::time::sleep(inner.idle_poll) => {}
    }
}

async fn execute_claimed(inner: &Arc<QueueInner>, run: Run, worker_id: &str) {
    let started = Instant::now();
    let cancel = CancelSignal::new();
    inner.track_cancel(run.id, cancel.clone()).await;
    info!(run_id = %run.id, attempt = run.attempt, worker_id, "Run started");

    let heartbeat = spawn_heartbeat(
        inner.store.clone(),
        run.id,
        worker_id.to_string(),
        inner.heartbeat_interval,
        cancel.clone(),
    );
    let sink = RunSink {
        store: inner.store.clone(),
        run_id: run.id,
        worker_id: worker_id.to_string(),
        cancel: cancel.clone(),
        events: inner.events.clone(),
    };

    let outcome = inner.runner.run(&run, &cancel, &sink).await;
    heartbeat.abort();
    inner.untrack_cancel(&run.id).await;

    let events = completion_events(&outcome, elapsed_ms(started));
    match inner.store.complete_run(&run.id, worker_id, &outcome, &events).await {
        Ok(Some((completed, persisted))) => {
            persisted.into_iter().for_each(|event| inner.publish(event));
            info!(
                run_id = %completed.id,
                state = %completed.state,
                exit_code = ?completed.exit_code,
                duration_ms = elapsed_ms(started),
                "Run finished"
            );
        }
        Ok(None) => warn!(run_id = %run.id, worker_id, "Run ownership lost before completion; outcome discarded"),
        Err(e) => error!(run_id = %run.id, error = %e, "Failed to persist run outcome"),
    }
}

fn spawn_heartbeat(
    store: RunStore,
    run_id: RunId,
    worker_id: String,
    interval: Duration,
    cancel: CancelSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.record_heartbeat(&run_id, &worker_id).await {
                Ok(Some(true)) => cancel.request(),
                Ok(Some(false)) => debug!(run_id = %run_id, "Heartbeat recorded"),
                Ok(None) => {
                    warn!(run_id = %run_id, worker_id = %worker_id, "Run no longer owned; stopping");
                    cancel.request();
                    break;
                }
                Err(e) => warn!(run_id = %run_id, error = %e, "Failed to record heartbeat"),
            }
        }
    })
}

/// Events that close a run: an `error` event for failures, then the `exit` event.
pub(super) fn completion_events(outcome: &RunOutcome, duration_ms: u64) -> Vec<NewRunEvent> {
    let error = (outcome.state == RunState::Failed).then(|| {
        NewRunEvent::new(RunEventType::Error, RunState::Failed).with_detail(json!({
            "category": outcome.error_category,
            "message": outcome.error_message,
        }))
    });

    let mut exit_detail = json!({ "exit_code": outcome.exit_code });
    if let Some(summary) = &outcome.summary {
        exit_detail["summary"] = summary.clone();
    }
    if let Some(message) = &outcome.error_message {
        exit_detail["error_message"] = json!(message);
    }
    if !outcome.annotations.is_empty() {
        exit_detail["annotations"] = json!(outcome.annotations);
    }
    let exit = NewRunEvent::new(RunEventType::Exit, outcome.state)
        .with_detail(exit_detail)
        .with_duration_ms(duration_ms);

    error.into_iter().chain(std::iter::once(exit)).collect()
}
