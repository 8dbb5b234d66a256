//! In-process pending-approval map (spec §4.E): a request waits on a
//! `oneshot` channel until a decision arrives, or the wait times out.
//!
//! Grounded on the teacher's `ApprovalStore` (`oneshot`-channel pending
//! map with insert/approve/deny/list/expire), generalized to the three
//! decisions the approval socket protocol actually carries.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
}

struct Pending {
    command: String,
    session_key: Option<String>,
    created_at: DateTime<Utc>,
    respond: oneshot::Sender<ApprovalDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub command: String,
    pub session_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<(&Uuid, &Pending)> for ApprovalInfo {
    fn from((id, p): (&Uuid, &Pending)) -> Self {
        Self {
            id: *id,
            command: p.command.clone(),
            session_key: p.session_key.clone(),
            created_at: p.created_at,
        }
    }
}

pub struct ApprovalStore {
    pending: RwLock<HashMap<Uuid, Pending>>,
    timeout: Duration,
}

impl ApprovalStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a new pending approval, returning its id and the receiver
    /// the caller should await (with a timeout).
    pub fn insert(
        &self,
        command: String,
        session_key: Option<String>,
    ) -> (Uuid, oneshot::Receiver<ApprovalDecision>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.write().insert(
            id,
            Pending {
                command,
                session_key,
                created_at: Utc::now(),
                respond: tx,
            },
        );
        (id, rx)
    }

    /// Deliver a decision to a pending approval. Returns `false` if the
    /// id is unknown or already resolved.
    pub fn decide(&self, id: Uuid, decision: ApprovalDecision) -> bool {
        if let Some(pending) = self.pending.write().remove(&id) {
            pending.respond.send(decision).is_ok()
        } else {
            false
        }
    }

    pub fn remove_expired(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.timeout).unwrap_or_default();
        let mut pending = self.pending.write();
        let before = pending.len();
        pending.retain(|_, p| p.created_at > cutoff);
        before - pending.len()
    }

    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        self.pending
            .read()
            .iter()
            .map(ApprovalInfo::from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_and_decide_round_trip() {
        let store = ApprovalStore::new(Duration::from_secs(30));
        let (id, rx) = store.insert("rm -rf /tmp/x".into(), Some("s1".into()));
        assert!(store.decide(id, ApprovalDecision::AllowOnce));
        assert_eq!(rx.await.unwrap(), ApprovalDecision::AllowOnce);
    }

    #[test]
    fn decide_unknown_id_returns_false() {
        let store = ApprovalStore::new(Duration::from_secs(30));
        assert!(!store.decide(Uuid::new_v4(), ApprovalDecision::Deny));
    }

    #[test]
    fn list_pending_reflects_inserts() {
        let store = ApprovalStore::new(Duration::from_secs(30));
        let (id, _rx) = store.insert("ls".into(), None);
        let list = store.list_pending();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
    }

    #[tokio::test]
    async fn decide_twice_second_fails() {
        let store = ApprovalStore::new(Duration::from_secs(30));
        let (id, rx) = store.insert("ls".into(), None);
        assert!(store.decide(id, ApprovalDecision::AllowOnce));
        assert!(!store.decide(id, ApprovalDecision::Deny));
        drop(rx);
    }
}
