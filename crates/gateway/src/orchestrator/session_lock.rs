//! Per-session turn serialization (spec §4.I, §5: "one task in flight per
//! session key").
//!
//! Grounded on `sa_gateway::runtime::session_lock::SessionLockMap`, reused
//! near-verbatim: a `Semaphore(1)` per session key, with a non-blocking
//! fast path before falling through to the blocking acquire so the caller
//! can choose to report `session-busy` instead of queueing when the queue
//! policy is `drop`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
pub struct SessionBusy;

impl fmt::Display for SessionBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session is busy — a turn is already in progress")
    }
}

impl std::error::Error for SessionBusy {}

pub struct SessionLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore_for(&self, session_key: &str) -> Arc<Semaphore> {
        self.locks
            .lock()
            .unwrap()
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Try to acquire without waiting; if already held, block until the
    /// current turn releases it. Callers enforcing a `drop` queue policy
    /// should use `try_acquire` directly instead.
    pub async fn acquire(&self, session_key: &str) -> OwnedSemaphorePermit {
        let sem = self.semaphore_for(session_key);
        sem.acquire_owned().await.expect("semaphore never closed")
    }

    /// Non-blocking variant: returns `SessionBusy` if a turn is already
    /// running for this session key.
    pub fn try_acquire(&self, session_key: &str) -> Result<OwnedSemaphorePermit, SessionBusy> {
        let sem = self.semaphore_for(session_key);
        sem.try_acquire_owned().map_err(|_| SessionBusy)
    }

    pub fn session_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    /// Drop entries for sessions with no turn in flight, so the map
    /// doesn't grow unbounded across the process lifetime.
    pub fn prune_idle(&self) {
        self.locks
            .lock()
            .unwrap()
            .retain(|_, sem| sem.available_permits() == 0);
    }
}
