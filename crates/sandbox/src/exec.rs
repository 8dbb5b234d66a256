//! Sandbox Executor (spec §4.F): spawn a command foreground or
//! background, on the gateway host, inside the agent's sandbox
//! container, or on a paired remote node.
//!
//! Grounded on `sa_tools::exec::exec`/`spawn_monitor` for the
//! spawn/monitor/yield-race shape, expanded with the full gating
//! pipeline (`crate::gate`), gateway-host PATH-search + allowlist/ask
//! decision (via `cb_approvals`), `docker exec` dispatch for the sandbox
//! host, and forwarding to `cb_nodes::InvokeRouter` for the node host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};

use cb_approvals::{
    ask_fallback_decision, match_allowlist, ApprovalDecision, ApprovalStore as ApprovalPendingStore,
    ApprovalSocket, ApprovalsStore, Defaults as ApprovalOverrides, RequestPayload, Resolution,
};
use cb_domain::config::{AskMode, ExecHost, SecurityMode};
use cb_domain::{Error, Result, Value};
use cb_nodes::{InvokeRouter, NodeRegistry};

use crate::gate::{self, Composed, ExecRequest as GateRequest, GateConfig};
use crate::manager::ExecManager;
use crate::session::{ExecSession, ExecStatus, ExitNotification, ExitNotifier, StdinMessage};

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub agent_id: String,
    pub command: String,
    pub workdir: Option<String>,
    pub env: HashMap<String, String>,
    pub yield_ms: Option<u64>,
    pub background: bool,
    pub timeout_sec: Option<u64>,
    pub pty: bool,
    pub elevated: bool,
    pub host: ExecHost,
    pub security: SecurityMode,
    pub ask: AskMode,
    pub node: Option<String>,
    pub session_key: Option<String>,
    pub notify_on_exit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tail: Option<String>,
}

/// Everything `exec()` needs besides the request itself. Borrowed rather
/// than bundled into one long-lived struct so callers (the Session
/// Orchestrator) can assemble it from `AppState` per call.
pub struct ExecDeps<'a> {
    pub manager: &'a ExecManager,
    pub gate_config: &'a GateConfig,
    pub approvals: &'a ApprovalsStore,
    pub approval_pending: &'a ApprovalPendingStore,
    pub approval_socket: Option<&'a ApprovalSocket>,
    pub nodes: &'a NodeRegistry,
    pub invoke_router: &'a InvokeRouter,
    pub denied_patterns: &'a [Regex],
    pub path_prepend: &'a [String],
    pub container_workspace: &'a Path,
    pub path_probe_timeout: Duration,
    pub approval_timeout: Duration,
    /// Invoked on exit for a backgrounded, `notify_on_exit` session (spec
    /// §4.F step 11). `None` when the caller has nowhere to route the
    /// notification (e.g. no event bus wired up).
    pub exit_notifier: Option<ExitNotifier>,
}

/// Entry point: `exec(params) -> Result(running|completed|failed)` (spec
/// §4.F). Runs the full gating pipeline then dispatches by effective
/// host.
pub async fn exec(deps: &ExecDeps<'_>, req: ExecParams) -> Result<ExecOutcome> {
    let gate_req = GateRequest {
        command: req.command.clone(),
        workdir: req.workdir.clone(),
        env: req.env.clone(),
        host: req.host,
        security: req.security,
        ask: req.ask,
        elevated: req.elevated,
    };
    let composed = gate::compose(&gate_req, deps.gate_config).map_err(Error::from)?;

    for pattern in deps.denied_patterns {
        if pattern.is_match(&req.command) {
            return Err(Error::Policy {
                gate: "denied-pattern".into(),
                reason: format!("command matches denied pattern: {}", pattern.as_str()),
            });
        }
    }

    match composed.host {
        ExecHost::Node => exec_on_node(deps, &req).await,
        ExecHost::Sandbox => {
            let (workdir, _) = gate::resolve_workdir(req.workdir.as_deref(), &deps.gate_config.workspace_root);
            let container_workdir = gate::map_workdir_to_container(&workdir, &deps.gate_config.workspace_root, deps.container_workspace);
            spawn_and_run(deps, &req, Some(container_workdir), true).await
        }
        ExecHost::Gateway => {
            decide_gateway_host(deps, &req, &composed).await?;
            let (workdir, _) = gate::resolve_workdir(req.workdir.as_deref(), &deps.gate_config.workspace_root);
            spawn_and_run(deps, &req, Some(workdir), false).await
        }
    }
}

/// Step 7: node host. Requires a paired node declaring `system.run`.
async fn exec_on_node(deps: &ExecDeps<'_>, req: &ExecParams) -> Result<ExecOutcome> {
    let node_id = match &req.node {
        Some(id) => id.clone(),
        None => {
            let candidates = deps.nodes.nodes_declaring("system.run");
            match candidates.as_slice() {
                [one] => one.clone(),
                [] => {
                    return Err(Error::Policy {
                        gate: "node-not-paired".into(),
                        reason: "no connected node declares system.run".into(),
                    })
                }
                _ => {
                    return Err(Error::Policy {
                        gate: "node-not-paired".into(),
                        reason: "multiple nodes declare system.run; a target node must be specified".into(),
                    })
                }
            }
        }
    };

    let mut params = std::collections::BTreeMap::new();
    params.insert("command".to_string(), Value::String(req.command.clone()));
    if let Some(wd) = &req.workdir {
        params.insert("workdir".to_string(), Value::String(wd.clone()));
    }

    let timeout = Duration::from_secs(req.timeout_sec.unwrap_or(1800));
    let result = deps
        .invoke_router
        .invoke(&node_id, "system.run", Value::Map(params), None, timeout)
        .await?;

    if result.ok {
        Ok(ExecOutcome {
            status: ExecStatus::Completed,
            exit_code: Some(0),
            output: result.payload.and_then(|v| v.as_str().map(|s| s.to_string())),
            session_id: None,
            tail: None,
        })
    } else {
        Err(Error::Upstream(result.error.unwrap_or_else(|| "node exec failed".into())))
    }
}

/// Step 8: gateway host PATH-search + allowlist/ask/deny decision.
async fn decide_gateway_host(deps: &ExecDeps<'_>, req: &ExecParams, composed: &Composed) -> Result<()> {
    if composed.bypass_allowlist || composed.security == SecurityMode::Full {
        return Ok(());
    }

    let raw_executable = first_token(&req.command);
    let merged_path = gate::merge_env(&std::env::vars().collect(), &req.env, deps.path_prepend)
        .get("PATH")
        .cloned()
        .unwrap_or_default();
    let resolved_path = resolve_on_path(&raw_executable, &merged_path);
    let executable_name = basename(&raw_executable);
    let resolution = Resolution {
        raw_executable: raw_executable.clone(),
        resolved_path: resolved_path.clone(),
        executable_name,
    };

    let resolved = deps.approvals.resolve(&req.agent_id, &ApprovalOverrides::default()).await?;
    let matched = match_allowlist(&resolved.allowlist, &resolution).cloned();

    if let Some(entry) = &matched {
        deps.approvals
            .record_allowlist_use(&req.agent_id, &entry.pattern, &req.command, resolved_path.as_deref())
            .await?;
        return Ok(());
    }

    if composed.ask == AskMode::Off {
        return Err(Error::Policy {
            gate: "allowlist-miss".into(),
            reason: format!("{raw_executable} is not on the allowlist and asking is disabled"),
        });
    }

    let (id, rx) = deps.approval_pending.insert(req.command.clone(), req.session_key.clone());
    if let Some(socket) = deps.approval_socket {
        socket.publish_request(
            id,
            RequestPayload {
                command: req.command.clone(),
                cwd: req.workdir.clone(),
                host: "gateway".into(),
                security: composed.security,
                ask: composed.ask,
                agent_id: req.agent_id.clone(),
                resolved_path: resolved_path.clone(),
                session_key: req.session_key.clone(),
                timeout_ms: deps.approval_timeout.as_millis() as u64,
            },
        );
    }

    let decision = match tokio::time::timeout(deps.approval_timeout, rx).await {
        Ok(Ok(decision)) => decision,
        _ => ask_fallback_decision(resolved.ask_fallback, matched.is_some()),
    };

    match decision {
        ApprovalDecision::Deny => Err(Error::Policy {
            gate: "user-denied".into(),
            reason: format!("approval denied for {raw_executable}"),
        }),
        ApprovalDecision::AllowOnce => Ok(()),
        ApprovalDecision::AllowAlways => {
            deps.approvals
                .add_allowlist_entry(&req.agent_id, resolved_path.as_deref().unwrap_or(&raw_executable))
                .await?;
            Ok(())
        }
    }
}

fn first_token(command: &str) -> String {
    command.split_whitespace().next().unwrap_or(command).to_string()
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

fn resolve_on_path(executable: &str, path: &str) -> Option<String> {
    let candidate = Path::new(executable);
    if candidate.is_absolute() {
        return if candidate.exists() {
            Some(candidate.to_string_lossy().to_string())
        } else {
            None
        };
    }
    for dir in path.split(':') {
        if dir.is_empty() {
            continue;
        }
        let full = Path::new(dir).join(executable);
        if full.exists() {
            return Some(full.to_string_lossy().to_string());
        }
    }
    None
}

/// Step 6 addendum: a login shell's `PATH` often differs from the
/// gateway process's own (homebrew/asdf/nvm shims), so gateway-host execs
/// probe it once via a short-lived `sh -lc`, bounded so a broken login
/// profile can't hang a command.
async fn probe_login_shell_path(timeout: Duration) -> Option<String> {
    let probe = Command::new("sh").arg("-lc").arg("echo -n $PATH").output();
    match tokio::time::timeout(timeout, probe).await {
        Ok(Ok(output)) if output.status.success() => {
            String::from_utf8(output.stdout).ok().filter(|s| !s.trim().is_empty()).map(|s| s.trim().to_string())
        }
        _ => None,
    }
}

/// Steps 9-11: spawn, monitor, yield/background race, exit notification.
/// `via_sandbox` selects `docker exec` into the agent's container;
/// otherwise the command runs directly on the gateway host.
async fn spawn_and_run(
    deps: &ExecDeps<'_>,
    req: &ExecParams,
    workdir: Option<PathBuf>,
    via_sandbox: bool,
) -> Result<ExecOutcome> {
    let cfg = deps.manager.config();
    let yield_ms = if req.background {
        0
    } else {
        req.yield_ms.unwrap_or(cfg.yield_ms).clamp(10, 120_000)
    };
    let timeout_sec = req.timeout_sec.unwrap_or(cfg.timeout_sec);

    let session_id = uuid::Uuid::new_v4().to_string();
    let mut base_env: HashMap<String, String> = std::env::vars().collect();
    if !via_sandbox && !req.env.contains_key("PATH") {
        if let Some(login_path) = probe_login_shell_path(deps.path_probe_timeout).await {
            base_env.insert("PATH".to_string(), login_path);
        }
    }
    let env = gate::merge_env(&base_env, &req.env, deps.path_prepend);

    // Non-sandbox PTY runs through the dedicated pty module (step 9): it
    // owns its own child process type (`portable_pty::Child`, not
    // `tokio::process::Child`) so it can't share the pipe-spawn path below.
    if !via_sandbox && req.pty {
        return spawn_and_run_pty(deps, req, workdir, env, session_id, yield_ms, timeout_sec).await;
    }

    let mut cmd = if via_sandbox {
        let mut c = Command::new("docker");
        c.arg("exec");
        if req.pty {
            c.arg("-it");
        } else {
            c.arg("-i");
        }
        c.arg(&req.agent_id).arg("sh").arg("-c").arg(&req.command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&req.command);
        c
    };

    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.stdin(std::process::Stdio::piped());
    cmd.envs(&env);
    if let Some(wd) = &workdir {
        cmd.current_dir(wd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().ok();
                Ok(())
            });
        }
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return Ok(ExecOutcome {
                status: ExecStatus::Failed,
                exit_code: None,
                output: Some(format!("failed to spawn: {e}")),
                session_id: None,
                tail: None,
            })
        }
    };

    let pid = child.id();
    let (stdin_tx, stdin_rx) = mpsc::channel::<StdinMessage>(32);
    let (kill_tx, kill_rx) = mpsc::channel::<()>(1);

    let mut session = ExecSession::new(
        session_id.clone(),
        req.command.clone(),
        req.agent_id.clone(),
        req.session_key.clone(),
        workdir.map(|p| p.to_string_lossy().to_string()),
        req.notify_on_exit,
        cfg.max_output_chars,
    );
    session.pid = pid;
    session.stdin_tx = Some(stdin_tx);
    session.kill_tx = Some(kill_tx);

    let session_arc = deps.manager.register(session);
    let done_notify = Arc::new(Notify::new());

    spawn_monitor(child.stdout.take(), child.stderr.take(), child.stdin.take(), session_arc.clone(), stdin_rx);
    tokio::spawn(wait_and_finalize(
        child,
        session_arc.clone(),
        kill_rx,
        timeout_sec,
        done_notify.clone(),
        deps.exit_notifier.clone(),
    ));

    if req.background {
        session_arc.write().backgrounded = true;
        return Ok(ExecOutcome {
            status: ExecStatus::Running,
            exit_code: None,
            output: None,
            session_id: Some(session_id),
            tail: Some(String::new()),
        });
    }

    let yield_dur = Duration::from_millis(yield_ms);
    tokio::select! {
        _ = done_notify.notified() => {
            let s = session_arc.read();
            Ok(ExecOutcome {
                status: s.status,
                exit_code: s.exit_code,
                output: Some(s.output.aggregated().to_string()),
                session_id: None,
                tail: None,
            })
        }
        _ = tokio::time::sleep(yield_dur) => {
            session_arc.write().backgrounded = true;
            let tail = session_arc.read().output.tail_lines(20);
            Ok(ExecOutcome {
                status: ExecStatus::Running,
                exit_code: None,
                output: None,
                session_id: Some(session_id),
                tail: Some(tail),
            })
        }
    }
}

/// Steps 9-11 for the non-sandbox PTY path (spec §4.F step 9): same
/// yield/background/timeout contract as [`spawn_and_run`], but spawned
/// and monitored through `crate::pty` instead of `tokio::process`.
async fn spawn_and_run_pty(
    deps: &ExecDeps<'_>,
    req: &ExecParams,
    workdir: Option<PathBuf>,
    env: HashMap<String, String>,
    session_id: String,
    yield_ms: u64,
    timeout_sec: u64,
) -> Result<ExecOutcome> {
    let cfg = deps.manager.config();
    let handle = match crate::pty::spawn(&req.command, workdir.as_deref(), &env) {
        Ok(h) => h,
        Err(reason) => {
            return Ok(ExecOutcome {
                status: ExecStatus::Failed,
                exit_code: None,
                output: Some(reason),
                session_id: None,
                tail: None,
            })
        }
    };

    let pid = handle.child.process_id();
    let (stdin_tx, stdin_rx) = mpsc::channel::<StdinMessage>(32);
    let (kill_tx, kill_rx) = mpsc::channel::<()>(1);

    let mut session = ExecSession::new(
        session_id.clone(),
        req.command.clone(),
        req.agent_id.clone(),
        req.session_key.clone(),
        workdir.map(|p| p.to_string_lossy().to_string()),
        req.notify_on_exit,
        cfg.max_output_chars,
    );
    session.pid = pid;
    session.stdin_tx = Some(stdin_tx);
    session.kill_tx = Some(kill_tx);

    let session_arc = deps.manager.register(session);
    let done_notify = Arc::new(Notify::new());

    spawn_pty_pump(handle.output_rx, handle.input_tx, session_arc.clone(), stdin_rx);
    tokio::spawn(wait_and_finalize_pty(
        handle.child,
        session_arc.clone(),
        kill_rx,
        timeout_sec,
        done_notify.clone(),
        deps.exit_notifier.clone(),
    ));

    if req.background {
        session_arc.write().backgrounded = true;
        return Ok(ExecOutcome {
            status: ExecStatus::Running,
            exit_code: None,
            output: None,
            session_id: Some(session_id),
            tail: Some(String::new()),
        });
    }

    let yield_dur = Duration::from_millis(yield_ms);
    tokio::select! {
        _ = done_notify.notified() => {
            let s = session_arc.read();
            Ok(ExecOutcome {
                status: s.status,
                exit_code: s.exit_code,
                output: Some(s.output.aggregated().to_string()),
                session_id: None,
                tail: None,
            })
        }
        _ = tokio::time::sleep(yield_dur) => {
            session_arc.write().backgrounded = true;
            let tail = session_arc.read().output.tail_lines(20);
            Ok(ExecOutcome {
                status: ExecStatus::Running,
                exit_code: None,
                output: None,
                session_id: Some(session_id),
                tail: Some(tail),
            })
        }
    }
}

/// Forwards pty output into the session buffer and stdin writes into the
/// pty's input channel (DSR replies share that same channel — see
/// `crate::pty`).
fn spawn_pty_pump(
    mut output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    session: Arc<parking_lot::RwLock<ExecSession>>,
    mut stdin_rx: mpsc::Receiver<StdinMessage>,
) {
    let session_out = session.clone();
    tokio::spawn(async move {
        while let Some(bytes) = output_rx.recv().await {
            session_out.write().output.push(&String::from_utf8_lossy(&bytes));
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = stdin_rx.recv().await {
            match msg {
                StdinMessage::Data(data) => {
                    if input_tx.send(data).is_err() {
                        break;
                    }
                }
                StdinMessage::Eof => break,
            }
        }
    });
}

/// Step 11: fire the exit notification for a session that was
/// backgrounded and has `notify_on_exit` set, exactly once. No-op when the
/// session was never backgrounded, already notified, or no notifier is
/// wired up (spec §4.F step 11).
fn fire_exit_notification(session: &Arc<parking_lot::RwLock<ExecSession>>, notifier: &Option<ExitNotifier>) {
    let Some(notifier) = notifier else { return };
    let mut s = session.write();
    if !s.notify_on_exit || !s.backgrounded || s.exit_notified {
        return;
    }
    let Some(session_key) = s.session_key.clone() else {
        return;
    };
    let text = s.exit_notification_text();
    s.exit_notified = true;
    drop(s);
    notifier(ExitNotification { session_key, text });
}

enum PtyWaitOutcome {
    Exited(portable_pty::ExitStatus),
    Error(String),
    TimedOut(Option<portable_pty::ExitStatus>),
    Killed(Option<portable_pty::ExitStatus>),
}

/// `portable_pty::Child::wait` is blocking, so this polls `try_wait`
/// instead of awaiting it directly — the same non-blocking-poll shape the
/// pack's own host-terminal code uses around `portable_pty::Child`.
async fn wait_and_finalize_pty(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    session: Arc<parking_lot::RwLock<ExecSession>>,
    mut kill_rx: mpsc::Receiver<()>,
    timeout_sec: u64,
    done_notify: Arc<Notify>,
    exit_notifier: Option<ExitNotifier>,
) {
    let start = tokio::time::Instant::now();
    let timeout_dur = Duration::from_secs(timeout_sec);
    let poll_interval = Duration::from_millis(100);

    let outcome = loop {
        match child.try_wait() {
            Ok(Some(status)) => break PtyWaitOutcome::Exited(status),
            Ok(None) => {}
            Err(e) => break PtyWaitOutcome::Error(e.to_string()),
        }

        if start.elapsed() >= timeout_dur {
            let _ = child.kill();
            tokio::time::sleep(Duration::from_secs(1)).await;
            break PtyWaitOutcome::TimedOut(child.try_wait().ok().flatten());
        }

        tokio::select! {
            signal = kill_rx.recv() => {
                if signal.is_some() {
                    let _ = child.kill();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    break PtyWaitOutcome::Killed(child.try_wait().ok().flatten());
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    };

    {
        let mut s = session.write();
        match outcome {
            PtyWaitOutcome::Exited(status) => {
                s.exited = true;
                s.exit_code = Some(status.exit_code() as i32);
                s.status = if status.success() { ExecStatus::Completed } else { ExecStatus::Failed };
            }
            PtyWaitOutcome::Error(e) => {
                s.output.push(&format!("\n[process error: {e}]"));
                s.exited = true;
                s.status = ExecStatus::Failed;
            }
            PtyWaitOutcome::TimedOut(status) => {
                s.output.push("\n[timed out]");
                s.exited = true;
                s.status = ExecStatus::TimedOut;
                s.exit_code = status.map(|st| st.exit_code() as i32);
            }
            PtyWaitOutcome::Killed(status) => {
                s.output.push("\n[killed]");
                s.exited = true;
                s.status = ExecStatus::Killed;
                s.exit_code = status.map(|st| st.exit_code() as i32);
            }
        }
        s.finished_at = Some(Utc::now());
        s.stdin_tx = None;
        s.kill_tx = None;
    }

    fire_exit_notification(&session, &exit_notifier);
    done_notify.notify_waiters();
    tracing::debug!(session_id = %session.read().id, status = ?session.read().status, "exec session finished");
}

fn spawn_monitor(
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    stdin: Option<tokio::process::ChildStdin>,
    session: Arc<parking_lot::RwLock<ExecSession>>,
    mut stdin_rx: mpsc::Receiver<StdinMessage>,
) {
    let session_out = session.clone();
    tokio::spawn(async move {
        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let mut s = session_out.write();
                s.output.push(&line);
                s.output.push("\n");
            }
        }
    });

    let session_err = session.clone();
    tokio::spawn(async move {
        if let Some(stderr) = stderr {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                let mut s = session_err.write();
                s.output.push(&line);
                s.output.push("\n");
            }
        }
    });

    tokio::spawn(async move {
        if let Some(mut stdin) = stdin {
            while let Some(msg) = stdin_rx.recv().await {
                match msg {
                    StdinMessage::Data(data) => {
                        let _ = stdin.write_all(&data).await;
                        let _ = stdin.flush().await;
                    }
                    StdinMessage::Eof => {
                        drop(stdin);
                        return;
                    }
                }
            }
        }
    });
}

/// Waits for exit, a kill signal, or the hard timeout, whichever comes
/// first — the 1 s grace period mentioned in spec §4.F step 10 is the
/// `child.kill()` + final `child.wait()` below, not a separate sleep.
async fn wait_and_finalize(
    mut child: tokio::process::Child,
    session: Arc<parking_lot::RwLock<ExecSession>>,
    mut kill_rx: mpsc::Receiver<()>,
    timeout_sec: u64,
    done_notify: Arc<Notify>,
    exit_notifier: Option<ExitNotifier>,
) {
    let timeout_dur = Duration::from_secs(timeout_sec);

    tokio::select! {
        result = child.wait() => {
            let mut s = session.write();
            match result {
                Ok(exit) => {
                    s.exited = true;
                    s.status = ExecStatus::Completed;
                    s.exit_code = exit.code();
                    #[cfg(unix)]
                    {
                        use std::os::unix::process::ExitStatusExt;
                        s.exit_signal = exit.signal();
                        if exit.signal().is_some() {
                            s.status = ExecStatus::Killed;
                        } else if exit.code() != Some(0) {
                            s.status = ExecStatus::Failed;
                        }
                    }
                    s.finished_at = Some(Utc::now());
                    s.stdin_tx = None;
                    s.kill_tx = None;
                }
                Err(e) => {
                    s.output.push(&format!("\n[process error: {e}]"));
                    s.exited = true;
                    s.status = ExecStatus::Failed;
                    s.finished_at = Some(Utc::now());
                    s.stdin_tx = None;
                    s.kill_tx = None;
                }
            }
        }
        _ = kill_rx.recv() => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let mut s = session.write();
            s.output.push("\n[killed]");
            s.exited = true;
            s.status = ExecStatus::Killed;
            s.finished_at = Some(Utc::now());
            s.stdin_tx = None;
            s.kill_tx = None;
        }
        _ = tokio::time::sleep(timeout_dur) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let mut s = session.write();
            s.output.push("\n[timed out]");
            s.exited = true;
            s.status = ExecStatus::TimedOut;
            s.finished_at = Some(Utc::now());
            s.stdin_tx = None;
            s.kill_tx = None;
        }
    }

    fire_exit_notification(&session, &exit_notifier);
    done_notify.notify_waiters();
    tracing::debug!(session_id = %session.read().id, status = ?session.read().status, "exec session finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_domain::config::ExecConfig;

    #[test]
    fn first_token_splits_on_whitespace() {
        assert_eq!(first_token("  ls -la /tmp"), "ls");
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/usr/bin/rg"), "rg");
        assert_eq!(basename("rg"), "rg");
    }

    #[test]
    fn resolve_on_path_finds_absolute_existing_binary() {
        assert_eq!(resolve_on_path("/bin/sh", "/usr/bin"), Some("/bin/sh".to_string()));
    }

    #[test]
    fn resolve_on_path_searches_each_dir() {
        let resolved = resolve_on_path("sh", "/nonexistent:/bin");
        assert_eq!(resolved.as_deref(), Some("/bin/sh"));
    }

    #[test]
    fn manager_config_defaults_are_wired() {
        let manager = ExecManager::new(ExecConfig::default());
        assert_eq!(manager.config().timeout_sec, 1800);
    }

    fn notified_session(notify_on_exit: bool, backgrounded: bool) -> Arc<parking_lot::RwLock<ExecSession>> {
        let mut session = ExecSession::new(
            "abcdef0123456789".into(),
            "echo hi".into(),
            "agent:main".into(),
            Some("agent:main:dm:+1".into()),
            None,
            notify_on_exit,
            1000,
        );
        session.backgrounded = backgrounded;
        session.status = ExecStatus::Completed;
        session.exit_code = Some(0);
        Arc::new(parking_lot::RwLock::new(session))
    }

    #[test]
    fn fire_exit_notification_fires_when_backgrounded_and_notify_on_exit() {
        let session = notified_session(true, true);
        let received = Arc::new(parking_lot::Mutex::new(None));
        let received_clone = received.clone();
        let notifier: ExitNotifier = Arc::new(move |n: ExitNotification| {
            *received_clone.lock() = Some(n);
        });

        fire_exit_notification(&session, &Some(notifier));

        let n = received.lock().take().expect("notification should have fired");
        assert_eq!(n.session_key, "agent:main:dm:+1");
        assert!(n.text.starts_with("Exec Completed ("));
        assert!(session.read().exit_notified);
    }

    #[test]
    fn fire_exit_notification_skips_when_not_backgrounded() {
        let session = notified_session(true, false);
        let fired = Arc::new(parking_lot::Mutex::new(false));
        let fired_clone = fired.clone();
        let notifier: ExitNotifier = Arc::new(move |_| *fired_clone.lock() = true);

        fire_exit_notification(&session, &Some(notifier));

        assert!(!*fired.lock());
        assert!(!session.read().exit_notified);
    }

    #[test]
    fn fire_exit_notification_skips_when_notify_on_exit_is_false() {
        let session = notified_session(false, true);
        let fired = Arc::new(parking_lot::Mutex::new(false));
        let fired_clone = fired.clone();
        let notifier: ExitNotifier = Arc::new(move |_| *fired_clone.lock() = true);

        fire_exit_notification(&session, &Some(notifier));

        assert!(!*fired.lock());
    }

    #[test]
    fn fire_exit_notification_is_idempotent() {
        let session = notified_session(true, true);
        let count = Arc::new(parking_lot::Mutex::new(0));
        let count_clone = count.clone();
        let notifier: ExitNotifier = Arc::new(move |_| *count_clone.lock() += 1);

        fire_exit_notification(&session, &Some(notifier.clone()));
        fire_exit_notification(&session, &Some(notifier));

        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn fire_exit_notification_noop_without_notifier() {
        let session = notified_session(true, true);
        fire_exit_notification(&session, &None);
        assert!(!session.read().exit_notified);
    }
}
