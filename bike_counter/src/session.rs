// THEORY:
// `SessionStore` is the single authoritative owner of the mutable state shared by
// all HTTP requests: the path of the uploaded video and the registry of confirmed
// track identities.
//
// Key architectural principles:
// 1.  **One Lock, One Truth**: Path and registry live in one `Session` behind one
//     mutex. `reset` swaps both at once, so no reader can observe a registry that
//     belongs to a different video than `current_path()`.
// 2.  **Generations**: Every `reset` bumps a generation counter. A stream captures a
//     `SessionTicket` when it starts; writes carrying an older generation are
//     rejected with `StaleSession`, which fences off viewers of a replaced upload.
// 3.  **Monotonic Registry**: Within one generation the registry only grows.
//     Insertion is idempotent, and concurrent viewers serialize on the lock, so
//     no confirmation is lost.
// 4.  **Tracker per Viewer**: Every ticket names a distinct viewer, and each
//     viewer runs its own tracker built by the store's `TrackerFactory`. Track IDs
//     are only unique within one tracker, so the registry keys them by viewer.
//     Viewers never disturb each other's tracking state, however their frames
//     interleave.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::StaleSession;
use crate::stats::{StatisticsSnapshot, snapshot};
use crate::tracker::{Tracker, TrackerFactory};
use crate::types::TrackId;

/// One stream connection within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(pub u64);

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

struct Session {
    generation: u64,
    video_path: Option<PathBuf>,
    next_viewer: u64,
    registry: HashSet<(ViewerId, TrackId)>,
}

/// Proof that a stream started against a particular session generation.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    generation: u64,
    viewer: ViewerId,
    video_path: PathBuf,
}

impl SessionTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn viewer(&self) -> ViewerId {
        self.viewer
    }

    pub fn video_path(&self) -> &Path {
        &self.video_path
    }
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<Mutex<Session>>,
    tracker_factory: TrackerFactory,
}

impl SessionStore {
    /// An empty store: no video uploaded yet.
    pub fn new(tracker_factory: TrackerFactory) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Session {
                generation: 0,
                video_path: None,
                next_viewer: 0,
                registry: HashSet::new(),
            })),
            tracker_factory,
        }
    }

    /// Start a new session for `path` with an empty registry.
    /// Returns the new generation.
    pub fn reset(&self, path: impl Into<PathBuf>) -> u64 {
        let path = path.into();
        let mut session = self.inner.lock();
        session.generation += 1;
        session.video_path = Some(path.clone());
        session.registry = HashSet::new();
        info!(generation = session.generation, path = %path.display(), "session reset");
        session.generation
    }

    /// Join the active session as a new viewer, `None` before the first upload.
    pub fn current_session(&self) -> Option<SessionTicket> {
        let mut session = self.inner.lock();
        let path = session.video_path.clone()?;
        session.next_viewer += 1;
        let ticket = SessionTicket {
            generation: session.generation,
            viewer: ViewerId(session.next_viewer),
            video_path: path,
        };
        debug!(generation = ticket.generation, viewer = %ticket.viewer, "viewer joined");
        Some(ticket)
    }

    /// A fresh tracker for one viewer.
    pub fn new_tracker(&self) -> Box<dyn Tracker> {
        (self.tracker_factory)()
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.inner.lock().video_path.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().video_path.is_some()
    }

    /// Record one confirmed identity. Returns whether it was new.
    pub fn record_confirmed(&self, ticket: &SessionTicket, id: TrackId) -> Result<bool, StaleSession> {
        let mut session = self.inner.lock();
        check_generation(&session, ticket)?;
        Ok(session.registry.insert((ticket.viewer, id)))
    }

    /// Record a batch of confirmed identities under a single lock acquisition and
    /// return the registry size observed right after the insertions.
    pub fn record_all<I>(&self, ticket: &SessionTicket, ids: I) -> Result<u64, StaleSession>
    where
        I: IntoIterator<Item = TrackId>,
    {
        let mut session = self.inner.lock();
        check_generation(&session, ticket)?;
        session.registry.extend(ids.into_iter().map(|id| (ticket.viewer, id)));
        Ok(session.registry.len() as u64)
    }

    /// Registry size of the active session.
    pub fn snapshot_count(&self) -> u64 {
        self.inner.lock().registry.len() as u64
    }

    /// Registry size as seen by a ticket holder.
    pub fn count_for(&self, ticket: &SessionTicket) -> Result<u64, StaleSession> {
        let session = self.inner.lock();
        check_generation(&session, ticket)?;
        Ok(session.registry.len() as u64)
    }

    /// Statistics of the active session, `None` before the first upload.
    pub fn statistics(&self) -> Option<StatisticsSnapshot> {
        let session = self.inner.lock();
        session
            .video_path
            .as_ref()
            .map(|_| snapshot(session.registry.len() as u64))
    }
}

fn check_generation(session: &Session, ticket: &SessionTicket) -> Result<(), StaleSession> {
    if session.generation == ticket.generation {
        Ok(())
    } else {
        Err(StaleSession {
            ticket: ticket.generation,
            current: session.generation,
        })
    }
}
