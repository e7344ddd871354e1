//! Per-session delivery lock with FIFO hand-off.
//!
//! At most one handler holds a session key at any instant. Later attempts
//! either queue behind the holder (`exclusive-wait`, FIFO, bounded by a
//! timeout) or fail immediately (`exclusive-reject`). Different keys never
//! block each other.
//!
//! ```text
//! acquire(key)  --> holder free?  yes --> LockHandle
//!                                 no  --> wait: enqueue waiter, await grant
//!                                         reject: LockError::Busy
//! release(h)    --> next waiter becomes holder (arrival order)
//!                   empty queue + no holder --> entry removed
//! ```
//!
//! All state sits behind one mutex that is never held across an await.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::cancel::CancelSignal;
use crate::config::LockMode;
use crate::error::LockError;

/// Default wait for `exclusive-wait` acquisitions.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Exclusive claim on one session key.
///
/// Releasing twice is a logged no-op. Dropping an unreleased handle
/// releases it.
#[derive(Debug)]
pub struct LockHandle {
    session_key: String,
    token: Uuid,
    acquired_at: DateTime<Utc>,
    released: AtomicBool,
    lock: SessionLock,
}

impl LockHandle {
    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release through the owning lock.
    pub fn release(&self) {
        self.lock.release(self);
    }

    /// Mark released without touching the lock table.
    fn disarm(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(session_key = %self.session_key, "Releasing dropped lock handle");
            self.lock.release_token(&self.session_key, self.token);
        }
    }
}

/// Point-in-time view of one session entry.
#[derive(Debug, Clone, Serialize)]
pub struct LockStats {
    pub session_key: String,
    pub holder: Option<Uuid>,
    pub acquired_at: Option<DateTime<Utc>>,
    /// Queued waiter tokens in grant order.
    pub waiters: Vec<Uuid>,
}

struct Holder {
    token: Uuid,
    acquired_at: DateTime<Utc>,
}

struct Waiter {
    token: Uuid,
    grant: oneshot::Sender<LockHandle>,
}

#[derive(Default)]
struct SessionEntry {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

impl SessionEntry {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }
}

/// Session key → (holder, waiter queue).
#[derive(Clone)]
pub struct SessionLock {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    acquire_timeout: Duration,
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("active_sessions", &self.active_sessions())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl SessionLock {
    pub fn new() -> Self {
        Self::with_acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn with_acquire_timeout(acquire_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            acquire_timeout,
        }
    }

    /// Acquire with the lock's default timeout and no cancellation.
    pub async fn acquire(&self, session_key: &str, mode: LockMode) -> Result<LockHandle, LockError> {
        self.acquire_with(session_key, mode, self.acquire_timeout, None)
            .await
    }

    /// Fail immediately if the session is held.
    pub fn try_acquire(&self, session_key: &str) -> Result<LockHandle, LockError> {
        match self.claim_or_enqueue(session_key, LockMode::ExclusiveReject) {
            Claim::Acquired(handle) => Ok(handle),
            Claim::Queued { .. } | Claim::Busy => Err(LockError::Busy {
                session_key: session_key.to_string(),
            }),
        }
    }

    /// Acquire with an explicit timeout and optional cancellation signal.
    ///
    /// A cancelled or timed-out waiter leaves the queue without affecting
    /// the current holder.
    pub async fn acquire_with(
        &self,
        session_key: &str,
        mode: LockMode,
        timeout: Duration,
        cancel: Option<&mut CancelSignal>,
    ) -> Result<LockHandle, LockError> {
        let (token, mut grant) = match self.claim_or_enqueue(session_key, mode) {
            Claim::Acquired(handle) => return Ok(handle),
            Claim::Busy => {
                return Err(LockError::Busy {
                    session_key: session_key.to_string(),
                });
            }
            Claim::Queued { token, grant } => (token, grant),
        };

        tracing::debug!(session_key, %token, "Queued behind current session holder");
        let mut queued = QueuedWaiter {
            lock: self,
            session_key,
            token,
            armed: true,
        };

        let waited = tokio::select! {
            result = tokio::time::timeout(timeout, &mut grant) => match result {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(_)) => Err(LockError::Busy { session_key: session_key.to_string() }),
                Err(_) => Err(LockError::Timeout { session_key: session_key.to_string(), timeout }),
            },
            _ = wait_for_cancel(cancel) => Err(LockError::Cancelled { session_key: session_key.to_string() }),
        };

        queued.armed = false;
        match waited {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if !self.dequeue(session_key, token) {
                    // Granted between the wake-up and the dequeue.
                    if let Ok(handle) = grant.try_recv() {
                        if matches!(err, LockError::Timeout { .. }) {
                            return Ok(handle);
                        }
                        drop(handle);
                    }
                }
                tracing::warn!(session_key, error = %err, "Session lock not acquired");
                Err(err)
            }
        }
    }

    /// Release a handle. A second release of the same handle only warns.
    pub fn release(&self, handle: &LockHandle) {
        if handle.released.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                session_key = %handle.session_key,
                token = %handle.token,
                "Lock handle released twice; ignoring"
            );
            return;
        }
        self.release_token(&handle.session_key, handle.token);
    }

    /// Snapshot of one session, if it has any state.
    pub fn stats(&self, session_key: &str) -> Option<LockStats> {
        let sessions = self.sessions();
        sessions.get(session_key).map(|entry| LockStats {
            session_key: session_key.to_string(),
            holder: entry.holder.as_ref().map(|h| h.token),
            acquired_at: entry.holder.as_ref().map(|h| h.acquired_at),
            waiters: entry.waiters.iter().map(|w| w.token).collect(),
        })
    }

    pub fn is_held(&self, session_key: &str) -> bool {
        self.sessions()
            .get(session_key)
            .is_some_and(|entry| entry.holder.is_some())
    }

    /// Number of session keys with a holder or waiters.
    pub fn active_sessions(&self) -> usize {
        self.sessions().len()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_handle(&self, session_key: &str, token: Uuid) -> LockHandle {
        LockHandle {
            session_key: session_key.to_string(),
            token,
            acquired_at: Utc::now(),
            released: AtomicBool::new(false),
            lock: self.clone(),
        }
    }

    fn claim_or_enqueue(&self, session_key: &str, mode: LockMode) -> Claim {
        let mut sessions = self.sessions();
        let entry = sessions.entry(session_key.to_string()).or_default();

        if entry.holder.is_none() && entry.waiters.is_empty() {
            let handle = self.new_handle(session_key, Uuid::new_v4());
            entry.holder = Some(Holder {
                token: handle.token,
                acquired_at: handle.acquired_at,
            });
            return Claim::Acquired(handle);
        }

        match mode {
            LockMode::ExclusiveReject => Claim::Busy,
            LockMode::ExclusiveWait => {
                let token = Uuid::new_v4();
                let (tx, rx) = oneshot::channel();
                entry.waiters.push_back(Waiter { token, grant: tx });
                Claim::Queued { token, grant: rx }
            }
        }
    }

    /// Remove a queued waiter. Returns false if it was no longer queued.
    fn dequeue(&self, session_key: &str, token: Uuid) -> bool {
        let mut sessions = self.sessions();
        let Some(entry) = sessions.get_mut(session_key) else {
            return false;
        };
        let before = entry.waiters.len();
        entry.waiters.retain(|w| w.token != token);
        let removed = entry.waiters.len() != before;
        if entry.is_idle() {
            sessions.remove(session_key);
        }
        removed
    }

    fn release_token(&self, session_key: &str, token: Uuid) {
        let mut sessions = self.sessions();
        let Some(entry) = sessions.get_mut(session_key) else {
            tracing::warn!(session_key, %token, "Release for unknown session; ignoring");
            return;
        };
        if entry.holder.as_ref().map(|h| h.token) != Some(token) {
            tracing::warn!(session_key, %token, "Release by non-holder; ignoring");
            return;
        }
        entry.holder = None;

        while let Some(waiter) = entry.waiters.pop_front() {
            let handle = self.new_handle(session_key, waiter.token);
            let holder = Holder {
                token: handle.token,
                acquired_at: handle.acquired_at,
            };
            match waiter.grant.send(handle) {
                Ok(()) => {
                    tracing::debug!(session_key, token = %holder.token, "Lock handed to next waiter");
                    entry.holder = Some(holder);
                    break;
                }
                // Waiter went away; skip it.
                Err(handle) => handle.disarm(),
            }
        }

        if entry.is_idle() {
            sessions.remove(session_key);
        }
    }
}

impl Default for SessionLock {
    fn default() -> Self {
        Self::new()
    }
}

enum Claim {
    Acquired(LockHandle),
    Queued {
        token: Uuid,
        grant: oneshot::Receiver<LockHandle>,
    },
    Busy,
}

/// Removes the waiter if the acquire future is dropped mid-wait.
struct QueuedWaiter<'a> {
    lock: &'a SessionLock,
    session_key: &'a str,
    token: Uuid,
    armed: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lock.dequeue(self.session_key, self.token);
        }
    }
}

async fn wait_for_cancel(cancel: Option<&mut CancelSignal>) {
    match cancel {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}
