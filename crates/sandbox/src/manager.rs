//! In-memory exec session registry.
//!
//! Grounded on `sa_tools::manager::ProcessManager`: the manager owns no
//! child processes directly, each spawn creates a monitor task that writes
//! into a shared `ExecSession`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use cb_domain::config::ExecConfig;

use crate::session::{ExecInfo, ExecSession};

pub struct ExecManager {
    sessions: RwLock<HashMap<String, Arc<RwLock<ExecSession>>>>,
    config: ExecConfig,
}

impl ExecManager {
    pub fn new(config: ExecConfig) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn register(&self, session: ExecSession) -> Arc<RwLock<ExecSession>> {
        let id = session.id.clone();
        let arc = Arc::new(RwLock::new(session));
        self.sessions.write().insert(id, arc.clone());
        arc
    }

    pub fn get(&self, id: &str) -> Option<Arc<RwLock<ExecSession>>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<ExecInfo> {
        self.sessions.read().values().map(|s| ExecInfo::from(&*s.read())).collect()
    }

    pub fn poll(&self, id: &str, offset: usize) -> Option<PollResult> {
        let sessions = self.sessions.read();
        let arc = sessions.get(id)?;
        let s = arc.read();
        Some(PollResult {
            status: s.status,
            exit_code: s.exit_code,
            new_output: s.output.read_from(offset, None).to_owned(),
            next_offset: s.output.len(),
        })
    }

    pub fn log(&self, id: &str, offset: Option<usize>, limit: Option<usize>, tail_lines: Option<usize>) -> Option<String> {
        let sessions = self.sessions.read();
        let arc = sessions.get(id)?;
        let s = arc.read();
        if let Some(off) = offset {
            Some(s.output.read_from(off, limit).to_owned())
        } else {
            Some(s.output.tail_lines(tail_lines.unwrap_or(200)))
        }
    }

    pub fn kill(&self, id: &str) -> bool {
        let sessions = self.sessions.read();
        if let Some(arc) = sessions.get(id) {
            let s = arc.read();
            if !s.exited {
                if let Some(ref tx) = s.kill_tx {
                    let _ = tx.try_send(());
                    return true;
                }
            }
        }
        false
    }

    pub async fn write_stdin(&self, id: &str, data: Vec<u8>, eof: bool) -> bool {
        let tx = {
            let sessions = self.sessions.read();
            sessions.get(id).and_then(|a| a.read().stdin_tx.clone())
        };
        if let Some(tx) = tx {
            if !data.is_empty() {
                let _ = tx.send(crate::session::StdinMessage::Data(data)).await;
            }
            if eof {
                let _ = tx.send(crate::session::StdinMessage::Eof).await;
            }
            true
        } else {
            false
        }
    }

    pub fn clear_finished(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, v| !v.read().exited);
        before - sessions.len()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.kill(id);
        self.sessions.write().remove(id).is_some()
    }

    /// Drop finished sessions older than `cleanup_ms` (spec §4.F backs the
    /// `process` tool's `clear` action with the same cutoff the exec
    /// subsystem uses for its own housekeeping).
    pub fn cleanup_stale(&self) {
        let cutoff_ms = self.config.cleanup_ms as i64;
        let now = Utc::now();
        self.sessions.write().retain(|_, v| {
            let s = v.read();
            match s.finished_at {
                Some(finished) => now.signed_duration_since(finished).num_milliseconds() < cutoff_ms,
                None => true,
            }
        });
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PollResult {
    pub status: crate::session::ExecStatus,
    pub exit_code: Option<i32>,
    pub new_output: String,
    pub next_offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ExecManager {
        ExecManager::new(ExecConfig::default())
    }

    fn session(id: &str) -> ExecSession {
        ExecSession::new(id.into(), "echo hi".into(), "agent:main".into(), None, None, false, 1000)
    }

    #[test]
    fn register_then_get_roundtrips() {
        let m = manager();
        m.register(session("s1"));
        assert!(m.get("s1").is_some());
        assert!(m.get("missing").is_none());
    }

    #[test]
    fn clear_finished_only_removes_exited() {
        let m = manager();
        let running = m.register(session("running"));
        let _ = running;
        let finished_arc = m.register(session("finished"));
        finished_arc.write().exited = true;
        finished_arc.write().finished_at = Some(Utc::now());
        let cleared = m.clear_finished();
        assert_eq!(cleared, 1);
        assert!(m.get("running").is_some());
        assert!(m.get("finished").is_none());
    }

    #[test]
    fn poll_reports_incremental_output() {
        let m = manager();
        let arc = m.register(session("s1"));
        arc.write().output.push("hello");
        let first = m.poll("s1", 0).unwrap();
        assert_eq!(first.new_output, "hello");
        arc.write().output.push(" world");
        let second = m.poll("s1", first.next_offset).unwrap();
        assert_eq!(second.new_output, " world");
    }
}
