use crate::db::RunStore;
use crate::error::Result;
use crate::types::{RunEvent, RunId};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// How long a follower waits on live events before re-reading storage.
/// Covers events appended by another process sharing the database.
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(500);

struct Follower {
    store: RunStore,
    run_id: RunId,
    live: Option<broadcast::Receiver<RunEvent>>,
    pending: VecDeque<RunEvent>,
    last_sequence: u64,
    finished: bool,
}

impl Follower {
    async fn next_event(&mut self) -> Option<Result<RunEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.sequence <= self.last_sequence {
                    continue;
                }
                self.last_sequence = event.sequence;
                self.finished = event.is_terminal();
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            if let Err(error) = self.wait_for_more().await {
                self.finished = true;
                return Some(Err(error));
            }
        }
    }

    async fn wait_for_more(&mut self) -> Result<()> {
        let live_event = match self.live.as_mut() {
            Some(receiver) => {
                match tokio::time::timeout(FOLLOW_POLL_INTERVAL, receiver.recv()).await {
                    Ok(Ok(event)) => Some(event),
                    Ok(Err(RecvError::Closed)) => {
                        self.live = None;
                        None
                    }
                    Ok(Err(RecvError::Lagged(_))) | Err(_) => None,
                }
            }
            None => {
                tokio::time::sleep(FOLLOW_POLL_INTERVAL).await;
                None
            }
        };

        match live_event {
            Some(event) if event.run_id != self.run_id => Ok(()),
            Some(event) if event.sequence == self.last_sequence + 1 => {
                self.pending.push_back(event);
                Ok(())
            }
            _ => self.reload().await,
        }
    }

    async fn reload(&mut self) -> Result<()> {
        let events = self.store.events_after(&self.run_id, self.last_sequence).await?;
        self.pending.extend(events);
        Ok(())
    }
}

/// Replay persisted events, then follow live appends until the terminal `exit` event.
///
/// # Errors
/// Returns an error if the initial replay cannot be read.
pub async fn follow_events(
    store: RunStore,
    run_id: RunId,
    live: Option<broadcast::Receiver<RunEvent>>,
) -> Result<BoxStream<'static, Result<RunEvent>>> {
    let replay = store.events(&run_id).await?;
    let follower = Follower {
        store,
        run_id,
        live,
        pending: replay.into(),
        last_sequence: 0,
        finished: false,
    };

    Ok(stream::unfold(follower, |mut follower| async move {
        follower.next_event().await.map(|item| (item, follower))
    })
    .boxed())
}
