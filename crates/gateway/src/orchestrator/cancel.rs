//! Cascading cancellation (spec §4.I, §5): cooperative cancel tokens keyed
//! by session, with the ability to fan a cancel out to child sessions
//! spawned by a subagent turn.
//!
//! Grounded on `sa_gateway::runtime::cancel::{CancelToken, CancelMap}`,
//! reused near-verbatim — the shape already matches what the Session
//! Orchestrator needs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session cancel tokens plus a parent→children group map, so
/// cancelling a session also cancels any subagent turns it spawned.
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl Default for CancelMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelMap {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh token for `session_key`, replacing any previous one
    /// (a new turn starting should not inherit a stale cancellation).
    pub fn register(&self, session_key: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .unwrap()
            .insert(session_key.to_string(), token.clone());
        token
    }

    /// Cancel `session_key` and every session registered under it via
    /// `add_to_group`. Returns whether anything was actually cancelled.
    pub fn cancel(&self, session_key: &str) -> bool {
        let mut any = false;
        if let Some(token) = self.tokens.lock().unwrap().get(session_key) {
            token.cancel();
            any = true;
        }
        if let Some(children) = self.groups.lock().unwrap().get(session_key).cloned() {
            for child in children {
                if self.cancel(&child) {
                    any = true;
                }
            }
        }
        any
    }

    pub fn remove(&self, session_key: &str) {
        self.tokens.lock().unwrap().remove(session_key);
        self.groups.lock().unwrap().remove(session_key);
    }

    pub fn is_running(&self, session_key: &str) -> bool {
        self.tokens
            .lock()
            .unwrap()
            .get(session_key)
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }

    pub fn add_to_group(&self, parent: &str, child: &str) {
        self.groups
            .lock()
            .unwrap()
            .entry(parent.to_string())
            .or_default()
            .insert(child.to_string());
    }

    pub fn remove_from_group(&self, parent: &str, child: &str) {
        if let Some(children) = self.groups.lock().unwrap().get_mut(parent) {
            children.remove(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_cancel_marks_cancelled() {
        let map = CancelMap::new();
        map.register("s1");
        assert!(map.is_running("s1"));
        assert!(map.cancel("s1"));
        assert!(!map.is_running("s1"));
    }

    #[test]
    fn cancel_unknown_session_returns_false() {
        let map = CancelMap::new();
        assert!(!map.cancel("ghost"));
    }

    #[test]
    fn cancel_cascades_to_group_children() {
        let map = CancelMap::new();
        let parent_token = map.register("parent");
        let child_token = map.register("child");
        map.add_to_group("parent", "child");
        assert!(map.cancel("parent"));
        assert!(parent_token.is_cancelled());
        assert!(child_token.is_cancelled());
    }

    #[test]
    fn remove_clears_token_and_owned_group() {
        let map = CancelMap::new();
        map.register("parent");
        map.register("child");
        map.add_to_group("parent", "child");
        map.remove("parent");
        assert!(!map.is_running("parent"));
        // The group entry owned by "parent" is gone too.
        assert!(!map.cancel("parent"));
    }

    #[test]
    fn remove_from_group_detaches_child() {
        let map = CancelMap::new();
        let child_token = map.register("child");
        map.register("parent");
        map.add_to_group("parent", "child");
        map.remove_from_group("parent", "child");
        map.cancel("parent");
        assert!(!child_token.is_cancelled());
    }

    #[test]
    fn register_replaces_previous_token() {
        let map = CancelMap::new();
        let first = map.register("s1");
        first.cancel();
        let second = map.register("s1");
        assert!(!second.is_cancelled());
        assert!(map.is_running("s1"));
    }

    #[test]
    fn idempotent_remove_on_unknown_session() {
        let map = CancelMap::new();
        map.remove("ghost"); // must not panic
    }
}
