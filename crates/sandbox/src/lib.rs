//! Sandbox Executor (spec §3, §4.F): exec sessions, the gating pipeline,
//! and the `process` tool that manages them.

pub mod exec;
pub mod gate;
pub mod manager;
pub mod output;
pub mod process;
pub mod pty;
pub mod session;

pub use exec::{exec as run_exec, ExecDeps, ExecOutcome, ExecParams};
pub use gate::{Composed, Denied, ExecRequest, GateConfig};
pub use manager::{ExecManager, PollResult};
pub use output::{OutputBuffer, NOTIFICATION_TAIL_CHARS};
pub use process::{handle_process, ProcessAction, ProcessRequest, ProcessResponse};
pub use session::{ExecInfo, ExecSession, ExecStatus, ExitNotification, ExitNotifier, StdinMessage};
