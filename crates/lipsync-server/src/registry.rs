//! Live sessions and the connection cap.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lipsync_core::{JobId, SessionId};
use lipsync_engine::{PipelineStage, StageObserver};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fine-grained request state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a request.
    Idle,
    /// A request message arrived.
    Receiving,
    /// Parsing and decoding the request.
    Validating,
    /// Writing inputs to disk.
    Staging,
    /// Committing the job descriptor.
    Submitting,
    /// External job running.
    Running,
    /// Encoding and sending the result.
    Finalizing,
    /// Reporting a failed request.
    Error,
    /// Connection gone.
    Closed,
}

impl SessionState {
    /// Whether a request is past validation.
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            Self::Staging | Self::Submitting | Self::Running | Self::Finalizing
        )
    }
}

impl From<PipelineStage> for SessionState {
    fn from(stage: PipelineStage) -> Self {
        match stage {
            PipelineStage::Staging => Self::Staging,
            PipelineStage::Submitting => Self::Submitting,
            PipelineStage::Running => Self::Running,
            PipelineStage::Finalizing => Self::Finalizing,
        }
    }
}

/// Coarse connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Connected, no request in flight.
    Open,
    /// A request is in flight.
    Processing,
    /// Tearing down.
    Closing,
    /// Gone.
    Closed,
}

/// Shared view of one session.
pub struct SessionHandle {
    id: SessionId,
    connected_at: Instant,
    state: Mutex<SessionState>,
    last_seen: Mutex<Instant>,
    closing: AtomicBool,
    cancel: CancellationToken,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    fn new(cancel: CancellationToken) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            connected_at: now,
            state: Mutex::new(SessionState::Idle),
            last_seen: Mutex::new(now),
            closing: AtomicBool::new(false),
            cancel,
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Cancelled on disconnect or server shutdown.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current request state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to `next`.
    pub fn set_state(&self, next: SessionState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev != next {
            debug!(session_id = %self.id, from = ?prev, to = ?next, "session state");
        }
    }

    /// Coarse lifecycle derived from the state.
    pub fn lifecycle(&self) -> Lifecycle {
        let state = self.state();
        if state == SessionState::Closed {
            Lifecycle::Closed
        } else if self.closing.load(Ordering::Relaxed) {
            Lifecycle::Closing
        } else if state.is_processing() {
            Lifecycle::Processing
        } else {
            Lifecycle::Open
        }
    }

    /// Mark teardown as started.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::Relaxed);
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl StageObserver for SessionHandle {
    fn stage_changed(&self, _job: &JobId, stage: PipelineStage) {
        self.set_state(stage.into());
    }
}

/// All open sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    reserved: AtomicUsize,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot, or `None` at `max` sessions. The slot is released when
    /// the returned [`Registration`] drops.
    pub fn try_register(
        self: &Arc<Self>,
        max: usize,
        cancel: CancellationToken,
    ) -> Option<Registration> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()?;
        let handle = Arc::new(SessionHandle::new(cancel));
        let _ = self.sessions.insert(handle.id.clone(), Arc::clone(&handle));
        Some(Registration {
            registry: Arc::clone(self),
            handle,
        })
    }

    /// Open sessions, including ones still upgrading.
    pub fn count(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Sessions with a request past validation.
    pub fn active_jobs(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state().is_processing())
            .count()
    }

    /// Look up a session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn release(&self, id: &SessionId) {
        if self.sessions.remove(id).is_some() {
            let _ = self.reserved.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A held session slot.
pub struct Registration {
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Registration").field(&self.handle.id).finish()
    }
}

impl Registration {
    /// The session this slot belongs to.
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.release(&self.handle.id);
    }
}
