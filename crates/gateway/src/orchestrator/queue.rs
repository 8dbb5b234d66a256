//! Per-session turn queue (spec §4.I): a bounded FIFO with a debounce
//! window and a configurable drop policy, feeding "one turn in flight per
//! session key" (enforced by [`super::session_lock::SessionLockMap`]).
//!
//! New relative to the teacher, which dispatches each inbound chat
//! message synchronously per HTTP call with no queue abstraction at all.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cb_sessions::DropPolicy;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueuedTurn {
    pub run_id: Uuid,
    pub agent_id: String,
    pub session_key: String,
    pub text: String,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct QueuePolicy {
    pub debounce_ms: u64,
    pub cap: usize,
    pub drop: DropPolicy,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            debounce_ms: 0,
            cap: 32,
            drop: DropPolicy::Oldest,
        }
    }
}

struct Lane {
    items: VecDeque<QueuedTurn>,
    last_enqueued_at: Instant,
}

/// Per-session-key FIFO lanes. One `SessionQueue` is shared by the whole
/// Session Orchestrator; each session key gets its own lane and its own
/// debounce clock.
pub struct SessionQueue {
    lanes: Mutex<HashMap<String, Lane>>,
}

impl Default for SessionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Push a turn onto its session's lane, applying `policy.cap` and
    /// `policy.drop` if the lane is already full. Returns the turn that
    /// was dropped to make room, if any — `Reject` drops the incoming
    /// turn itself.
    pub fn enqueue(&self, turn: QueuedTurn, policy: &QueuePolicy) -> Option<QueuedTurn> {
        let mut lanes = self.lanes.lock().unwrap();
        let lane = lanes.entry(turn.session_key.clone()).or_insert_with(|| Lane {
            items: VecDeque::new(),
            last_enqueued_at: turn.enqueued_at,
        });
        lane.last_enqueued_at = turn.enqueued_at;

        if lane.items.len() < policy.cap {
            lane.items.push_back(turn);
            return None;
        }

        match policy.drop {
            DropPolicy::Reject => Some(turn),
            DropPolicy::Newest => {
                // Keep what's already queued; the new arrival is dropped.
                Some(turn)
            }
            DropPolicy::Oldest => {
                let dropped = lane.items.pop_front();
                lane.items.push_back(turn);
                dropped
            }
        }
    }

    pub fn pop_front(&self, session_key: &str) -> Option<QueuedTurn> {
        self.lanes.lock().unwrap().get_mut(session_key)?.items.pop_front()
    }

    pub fn len(&self, session_key: &str) -> usize {
        self.lanes
            .lock()
            .unwrap()
            .get(session_key)
            .map(|l| l.items.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, session_key: &str) -> bool {
        self.len(session_key) == 0
    }

    fn idle_for(&self, session_key: &str) -> Option<Duration> {
        self.lanes
            .lock()
            .unwrap()
            .get(session_key)
            .map(|l| l.last_enqueued_at.elapsed())
    }

    /// Block until the lane has been quiet for `debounce_ms`, coalescing
    /// back-to-back arrivals into a single wakeup (spec §4.I). Returns
    /// immediately if `debounce_ms` is 0.
    pub async fn wait_for_quiet(&self, session_key: &str, debounce_ms: u64) {
        if debounce_ms == 0 {
            return;
        }
        let window = Duration::from_millis(debounce_ms);
        loop {
            let Some(idle) = self.idle_for(session_key) else {
                return;
            };
            if idle >= window {
                return;
            }
            tokio::time::sleep(window - idle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(session_key: &str, text: &str) -> QueuedTurn {
        QueuedTurn {
            run_id: Uuid::new_v4(),
            agent_id: "main".into(),
            session_key: session_key.into(),
            text: text.into(),
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let q = SessionQueue::new();
        let policy = QueuePolicy::default();
        q.enqueue(turn("s1", "a"), &policy);
        q.enqueue(turn("s1", "b"), &policy);
        assert_eq!(q.pop_front("s1").unwrap().text, "a");
        assert_eq!(q.pop_front("s1").unwrap().text, "b");
        assert!(q.pop_front("s1").is_none());
    }

    #[test]
    fn oldest_drop_policy_evicts_front() {
        let q = SessionQueue::new();
        let policy = QueuePolicy {
            debounce_ms: 0,
            cap: 2,
            drop: DropPolicy::Oldest,
        };
        q.enqueue(turn("s1", "a"), &policy);
        q.enqueue(turn("s1", "b"), &policy);
        let dropped = q.enqueue(turn("s1", "c"), &policy);
        assert_eq!(dropped.unwrap().text, "a");
        assert_eq!(q.len("s1"), 2);
        assert_eq!(q.pop_front("s1").unwrap().text, "b");
        assert_eq!(q.pop_front("s1").unwrap().text, "c");
    }

    #[test]
    fn reject_drop_policy_discards_incoming() {
        let q = SessionQueue::new();
        let policy = QueuePolicy {
            debounce_ms: 0,
            cap: 1,
            drop: DropPolicy::Reject,
        };
        q.enqueue(turn("s1", "a"), &policy);
        let dropped = q.enqueue(turn("s1", "b"), &policy);
        assert_eq!(dropped.unwrap().text, "b");
        assert_eq!(q.pop_front("s1").unwrap().text, "a");
    }

    #[test]
    fn newest_drop_policy_keeps_existing_queue() {
        let q = SessionQueue::new();
        let policy = QueuePolicy {
            debounce_ms: 0,
            cap: 1,
            drop: DropPolicy::Newest,
        };
        q.enqueue(turn("s1", "a"), &policy);
        let dropped = q.enqueue(turn("s1", "b"), &policy);
        assert_eq!(dropped.unwrap().text, "b");
        assert_eq!(q.len("s1"), 1);
        assert_eq!(q.pop_front("s1").unwrap().text, "a");
    }

    #[tokio::test]
    async fn wait_for_quiet_returns_immediately_when_zero() {
        let q = SessionQueue::new();
        q.enqueue(turn("s1", "a"), &QueuePolicy::default());
        q.wait_for_quiet("s1", 0).await;
    }

    #[tokio::test]
    async fn wait_for_quiet_waits_out_the_debounce_window() {
        let q = SessionQueue::new();
        q.enqueue(turn("s1", "a"), &QueuePolicy::default());
        let start = Instant::now();
        q.wait_for_quiet("s1", 30).await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
