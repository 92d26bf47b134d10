//! Fan-out of freshly appended changes to the other sessions of a project.
//!
//! Every session owns a bounded [`OutboundQueue`]. Publishing never waits:
//! when a queue is full its oldest frame is dropped and the session is
//! flagged degraded. Counters are atomics so the publish path takes no
//! lock beyond the registry lookup and the per-queue push.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use marksync_core::{ChangeId, ProjectId};

use crate::registry::{ConnectionRegistry, SessionHandle, SessionId};

/// One encoded change line shared by every target queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub id: ChangeId,
    pub line: Arc<str>,
}

impl RelayFrame {
    pub fn new(id: ChangeId, line: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            line: line.into(),
        }
    }
}

/// Result of [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queue was full; the frame with this id was evicted.
    DroppedOldest(ChangeId),
}

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<RelayFrame>,
    degraded: bool,
    /// Lowest id ever evicted and not yet covered by a replay.
    first_gap: Option<ChangeId>,
    dropped: u64,
}

/// Bounded drop-oldest queue between the relay and one session's socket.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, frame: RelayFrame) -> Enqueued {
        let outcome = {
            let mut state = self.state();
            let outcome = if state.frames.len() >= self.capacity {
                match state.frames.pop_front() {
                    Some(evicted) => {
                        state.degraded = true;
                        state.dropped += 1;
                        let gap = state.first_gap.map_or(evicted.id, |gap| gap.min(evicted.id));
                        state.first_gap = Some(gap);
                        Enqueued::DroppedOldest(evicted.id)
                    }
                    None => Enqueued::Queued,
                }
            } else {
                Enqueued::Queued
            };
            state.frames.push_back(frame);
            outcome
        };
        // A stored permit covers a consumer that is between its check and its await.
        self.notify.notify_one();
        outcome
    }

    pub fn try_pop(&self) -> Option<RelayFrame> {
        self.state().frames.pop_front()
    }

    /// Wait for the next frame. Cancel safe: a frame is only removed on return.
    pub async fn pop(&self) -> RelayFrame {
        loop {
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.state().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_degraded(&self) -> bool {
        self.state().degraded
    }

    pub fn dropped(&self) -> u64 {
        self.state().dropped
    }

    /// Forget frames with id <= `through`; they were already replayed.
    pub fn discard_through(&self, through: ChangeId) {
        let mut state = self.state();
        state.frames.retain(|frame| frame.id > through);
        if state.first_gap.is_some_and(|gap| gap <= through) {
            state.first_gap = None;
        }
    }

    /// Highest id a cursor may claim without skipping a frame that is still
    /// queued or was evicted. `None` when nothing constrains it.
    pub fn cursor_ceiling(&self) -> Option<ChangeId> {
        let state = self.state();
        let oldest_pending = state.frames.front().map(|frame| frame.id);
        let bound = match (oldest_pending, state.first_gap) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        bound.map(|id| ChangeId(id.get().saturating_sub(1)))
    }
}

/// Cumulative relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCounters {
    pub published: u64,
    pub enqueued: u64,
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct AtomicRelayStats {
    published: AtomicU64,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub targets: usize,
    pub overflowed: usize,
}

#[derive(Clone)]
pub struct BroadcastRelay {
    registry: Arc<ConnectionRegistry>,
    stats: Arc<AtomicRelayStats>,
}

impl BroadcastRelay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            registry,
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    /// Enqueue `frame` on every session of `project` except `source`.
    pub fn publish(
        &self,
        source: SessionId,
        project: ProjectId,
        frame: RelayFrame,
    ) -> PublishReport {
        let targets = self.registry.list(project, source);
        let mut report = PublishReport {
            targets: targets.len(),
            overflowed: 0,
        };

        for target in &targets {
            if let Enqueued::DroppedOldest(evicted) = target.queue.push(frame.clone()) {
                report.overflowed += 1;
                log_overflow(target, evicted);
            }
        }

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        self.stats
            .enqueued
            .fetch_add(report.targets as u64, Ordering::Relaxed);
        self.stats
            .dropped
            .fetch_add(report.overflowed as u64, Ordering::Relaxed);
        report
    }

    pub fn counters(&self) -> RelayCounters {
        RelayCounters {
            published: self.stats.published.load(Ordering::Relaxed),
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}

fn log_overflow(target: &SessionHandle, evicted: ChangeId) {
    warn!(
        session = %target.id,
        project = %target.project.name,
        user = %target.user,
        evicted = %evicted,
        capacity = target.queue.capacity(),
        "relay queue overflow, session degraded"
    );
}
