//! Process-wide set of live sessions, keyed by project.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use marksync_core::{Project, ProjectId, UserName};

use crate::relay::OutboundQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// What the relay needs to reach one session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: SessionId,
    pub project: Project,
    pub user: UserName,
    pub peer: String,
    pub queue: OutboundQueue,
}

/// Live sessions of one project. The entry, sequencer included, is dropped
/// with the last session.
#[derive(Default)]
struct ProjectSessions {
    sessions: BTreeMap<SessionId, Arc<SessionHandle>>,
    sequencer: Arc<AsyncMutex<()>>,
}

/// Concurrency-safe project → sessions map, plus the per-project sequencer
/// that orders append + publish.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    projects: Mutex<HashMap<ProjectId, ProjectSessions>>,
}

/// Status view of one registered session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub user: String,
    pub peer: String,
    pub degraded: bool,
    pub queued: usize,
    pub dropped: u64,
}

/// Status view of one project with live sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectStatus {
    pub project: String,
    pub sessions: Vec<SessionStatus>,
}

impl ConnectionRegistry {
    fn projects(&self) -> std::sync::MutexGuard<'_, HashMap<ProjectId, ProjectSessions>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a handle with a fresh id and an empty queue. Not yet registered.
    pub fn open_session(
        &self,
        project: Project,
        user: UserName,
        peer: String,
        queue_capacity: usize,
    ) -> Arc<SessionHandle> {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        Arc::new(SessionHandle {
            id,
            project,
            user,
            peer,
            queue: OutboundQueue::new(queue_capacity),
        })
    }

    pub fn register(&self, session: Arc<SessionHandle>) {
        let project = session.project.id;
        debug!(session = %session.id, project = %session.project.name, "session registered");
        self.projects()
            .entry(project)
            .or_default()
            .sessions
            .insert(session.id, session);
    }

    /// Idempotent. Returns whether the session was registered.
    pub fn unregister(&self, project: ProjectId, session: SessionId) -> bool {
        let mut projects = self.projects();
        let Some(entry) = projects.get_mut(&project) else {
            return false;
        };
        let removed = entry.sessions.remove(&session).is_some();
        if entry.sessions.is_empty() {
            projects.remove(&project);
        }
        if removed {
            debug!(session = %session, "session unregistered");
        }
        removed
    }

    /// Live sessions of `project` other than `excluding`.
    pub fn list(&self, project: ProjectId, excluding: SessionId) -> Vec<Arc<SessionHandle>> {
        self.projects()
            .get(&project)
            .map(|entry| {
                entry
                    .sessions
                    .values()
                    .filter(|session| session.id != excluding)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_registered(&self, session: SessionId) -> bool {
        self.projects()
            .values()
            .any(|entry| entry.sessions.contains_key(&session))
    }

    pub fn session_count(&self) -> usize {
        self.projects()
            .values()
            .map(|entry| entry.sessions.len())
            .sum()
    }

    /// Lock held across append + publish so peers see one project's frames in id order.
    ///
    /// Callers are registered sessions, which keep the entry alive. A project
    /// with no registered session has no peers to order for and gets a
    /// private lock.
    pub fn sequencer(&self, project: ProjectId) -> Arc<AsyncMutex<()>> {
        self.projects()
            .get(&project)
            .map(|entry| entry.sequencer.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<ProjectStatus> {
        let mut out: Vec<ProjectStatus> = self
            .projects()
            .values()
            .filter_map(|entry| {
                let first = entry.sessions.values().next()?;
                Some(ProjectStatus {
                    project: first.project.name.to_string(),
                    sessions: entry
                        .sessions
                        .values()
                        .map(|session| SessionStatus {
                            id: session.id,
                            user: session.user.to_string(),
                            peer: session.peer.clone(),
                            degraded: session.queue.is_degraded(),
                            queued: session.queue.len(),
                            dropped: session.queue.dropped(),
                        })
                        .collect(),
                })
            })
            .collect();
        out.sort_by(|a, b| a.project.cmp(&b.project));
        out
    }
}
