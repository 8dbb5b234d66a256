//! Exec Session (spec §3): the runtime record for one spawned command,
//! whether still running, backgrounded, or finished.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::output::OutputBuffer;

/// The system event a backgrounded, exited exec session raises when
/// `notify_on_exit` is set (spec §4.F step 11): `session_key` identifies
/// which session's heartbeat to wake, `text` is
/// [`ExecSession::exit_notification_text`].
#[derive(Debug, Clone)]
pub struct ExitNotification {
    pub session_key: String,
    pub text: String,
}

/// Callback the executor invokes on exit for a backgrounded, notify-on-exit
/// session. Owned (not borrowed) so it can be cloned into the `'static`
/// finalize tasks spawned by `exec::spawn_and_run`/`spawn_and_run_pty`.
pub type ExitNotifier = Arc<dyn Fn(ExitNotification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Running,
    Completed,
    Failed,
    Killed,
    TimedOut,
}

pub enum StdinMessage {
    Data(Vec<u8>),
    Eof,
}

/// `{ id, command, scopeKey, sessionKey, pid, startedAt, cwd, tail,
/// aggregated, totalOutputChars, pendingStdout/Err, truncated, exited,
/// exitCode, exitSignal, backgrounded, notifyOnExit, exitNotified }`
/// (spec §3). `tail`/`aggregated`/`totalOutputChars`/`truncated` live in
/// `output: OutputBuffer`; `pendingStdout`/`pendingStderr` are not
/// buffered separately since every chunk is appended straight into the
/// combined buffer as it arrives (mirrors the teacher's monitor task).
pub struct ExecSession {
    pub id: String,
    pub command: String,
    pub scope_key: String,
    pub session_key: Option<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cwd: Option<String>,
    pub output: OutputBuffer,
    pub backgrounded: bool,
    pub notify_on_exit: bool,
    pub exit_notified: bool,
    pub exited: bool,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub stdin_tx: Option<mpsc::Sender<StdinMessage>>,
    pub kill_tx: Option<mpsc::Sender<()>>,
}

impl ExecSession {
    pub fn new(
        id: String,
        command: String,
        scope_key: String,
        session_key: Option<String>,
        cwd: Option<String>,
        notify_on_exit: bool,
        max_output_chars: usize,
    ) -> Self {
        Self {
            id,
            command,
            scope_key,
            session_key,
            pid: None,
            started_at: Utc::now(),
            finished_at: None,
            cwd,
            output: OutputBuffer::new(max_output_chars),
            backgrounded: false,
            notify_on_exit,
            exit_notified: false,
            exited: false,
            status: ExecStatus::Running,
            exit_code: None,
            exit_signal: None,
            stdin_tx: None,
            kill_tx: None,
        }
    }

    /// The system-event text emitted on exit notification (spec §4.F step
    /// 11): `"Exec <status> (<id8>, <code|signal>) :: <normalized tail>"`.
    pub fn exit_notification_text(&self) -> String {
        let id8: String = self.id.chars().take(8).collect();
        let code_or_signal = match (self.exit_code, self.exit_signal) {
            (Some(c), _) => c.to_string(),
            (None, Some(s)) => format!("signal {s}"),
            (None, None) => "unknown".to_string(),
        };
        format!(
            "Exec {:?} ({id8}, {code_or_signal}) :: {}",
            self.status,
            self.output.normalized_notification_tail()
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecInfo {
    pub id: String,
    pub command: String,
    pub status: ExecStatus,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output_chars: usize,
    pub truncated: bool,
    pub backgrounded: bool,
}

impl From<&ExecSession> for ExecInfo {
    fn from(s: &ExecSession) -> Self {
        Self {
            id: s.id.clone(),
            command: s.command.clone(),
            status: s.status,
            exit_code: s.exit_code,
            exit_signal: s.exit_signal,
            started_at: s.started_at,
            finished_at: s.finished_at,
            output_chars: s.output.len(),
            truncated: s.output.is_truncated(),
            backgrounded: s.backgrounded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> ExecSession {
        ExecSession::new(
            uuid::Uuid::new_v4().to_string(),
            "echo hi".into(),
            "agent:main".into(),
            Some("agent:main:dm:+1".into()),
            None,
            true,
            1000,
        )
    }

    #[test]
    fn exit_notification_includes_id8_and_code() {
        let mut s = session();
        s.status = ExecStatus::Completed;
        s.exit_code = Some(0);
        s.output.push("all good");
        let text = s.exit_notification_text();
        assert!(text.starts_with("Exec Completed ("));
        assert!(text.contains(", 0)"));
        assert!(text.contains("all good"));
    }

    #[test]
    fn exit_notification_falls_back_to_signal() {
        let mut s = session();
        s.status = ExecStatus::Killed;
        s.exit_signal = Some(9);
        let text = s.exit_notification_text();
        assert!(text.contains("signal 9"));
    }
}
