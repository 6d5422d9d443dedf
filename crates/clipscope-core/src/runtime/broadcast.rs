use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::runtime::job::StatusEvent;
use crate::runtime::types::JobId;

/// Stream of status events for one job, ending after the terminal event.
pub type StatusStream = BoxStream<'static, StatusEvent>;

struct Channel {
    tx: broadcast::Sender<StatusEvent>,
    last: StatusEvent,
}

/// Per-job fan-out of status events.
///
/// Each job has a bounded broadcast channel plus its last event, kept under
/// one lock so a new subscriber gets the replay and every later event exactly
/// once. Publishing never waits for subscribers; one that falls more than the
/// buffer behind is dropped and has to resubscribe.
#[derive(Clone)]
pub struct EventBroadcaster {
    channels: Arc<Mutex<HashMap<JobId, Channel>>>,
    buffer: usize,
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("jobs", &self.job_count())
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl EventBroadcaster {
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the channel of a job with its initial event.
    pub fn register(&self, initial: StatusEvent) {
        let mut channels = self.lock();
        channels.entry(initial.job_id).or_insert_with(|| Channel {
            tx: broadcast::channel(self.buffer).0,
            last: initial,
        });
    }

    /// Deliver `event` to current subscribers. Events after a terminal one are
    /// dropped.
    pub fn publish(&self, event: StatusEvent) {
        let mut channels = self.lock();
        let Some(channel) = channels.get_mut(&event.job_id) else {
            debug!(job_id = %event.job_id, "publish for unknown job ignored");
            return;
        };
        if channel.last.is_terminal() {
            debug!(job_id = %event.job_id, status = %event.status, "event after terminal ignored");
            return;
        }
        channel.last = event.clone();
        // Err only means nobody is listening.
        let _ = channel.tx.send(event);
    }

    /// Last known event of a job.
    pub fn last(&self, job_id: JobId) -> Option<StatusEvent> {
        self.lock().get(&job_id).map(|c| c.last.clone())
    }

    /// Subscribe to a job: the last event first, then live events up to and
    /// including the first terminal one. `None` for unknown jobs.
    pub fn subscribe(&self, job_id: JobId) -> Option<StatusStream> {
        let (last, rx) = {
            let channels = self.lock();
            let channel = channels.get(&job_id)?;
            (channel.last.clone(), channel.tx.subscribe())
        };

        let terminal = last.is_terminal();
        let replay = stream::once(futures::future::ready(last));
        if terminal {
            return Some(replay.boxed());
        }

        let live = stream::unfold(Some(rx), move |state| async move {
            let mut rx = state?;
            match rx.recv().await {
                Ok(event) => {
                    let next = if event.is_terminal() { None } else { Some(rx) };
                    Some((event, next))
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%job_id, skipped, "status subscriber lagged, dropping it");
                    None
                }
                Err(RecvError::Closed) => None,
            }
        });
        Some(replay.chain(live).boxed())
    }

    /// Drop the channel of an evicted job; open streams end.
    pub fn forget(&self, job_id: JobId) {
        self.lock().remove(&job_id);
    }

    pub fn job_count(&self) -> usize {
        self.lock().len()
    }
}
