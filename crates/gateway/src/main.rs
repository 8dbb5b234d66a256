//! clawdbot-gateway bootstrap (spec §4.H ambient stack).
//!
//! Grounded on the teacher's `main.rs`: clap-driven CLI dispatch, JSON
//! tracing, fail-fast config validation, sequential `Arc`-wrapped
//! component construction logged as it happens, a handful of periodic
//! `tokio::spawn` maintenance loops, and a CORS/concurrency-limit/
//! rate-limit layered axum router bound with `axum::serve`. The teacher's
//! workspace reader, memory provider, skills registry, MCP manager,
//! dashboard SPA nesting, and schedule runner have no counterpart in this
//! gateway and are not carried over.

mod api;
mod cli;
mod events;
mod hub;
mod inbound;
mod orchestrator;
mod state;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use axum::routing::get;
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use cb_approvals::{ApprovalSocket, ApprovalStore as ApprovalPendingStore, ApprovalsStore};
use cb_domain::config::{Config, ConfigSeverity};
use cb_nodes::{InvokeRouter, NodeRegistry};
use cb_sandbox::ExecManager;
use cb_sessions::SessionStore;

use cli::{Cli, Command, ConfigCommand};
use orchestrator::cancel::CancelMap;
use orchestrator::queue::SessionQueue;
use orchestrator::session_lock::SessionLockMap;
use state::{AppState, StateVersion, UnconfiguredProvider};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config()?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config()?;
            let passed = run_doctor(&config, &config_path);
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            if !cli::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("clawdbot-gateway {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cb_gateway=debug")),
        )
        .json()
        .init();
}

/// Diagnostic checks against the resolved configuration: the config file
/// itself, its validation result, and the state directory's writability.
fn run_doctor(config: &Config, config_path: &str) -> bool {
    println!("clawdbot-gateway doctor");
    println!("=======================\n");

    let mut all_passed = true;

    let exists = std::path::Path::new(config_path).exists();
    print_check(
        "Config file exists",
        exists,
        if exists { config_path.to_owned() } else { format!("{config_path} not found (using defaults)") },
    );

    let issues = config.validate();
    let error_count = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();
    if issues.is_empty() {
        print_check("Config validation", true, "no issues".into());
    } else {
        print_check(
            "Config validation",
            error_count == 0,
            format!("{} issue(s) ({error_count} error(s))", issues.len()),
        );
        for issue in &issues {
            println!("      {issue}");
        }
        if error_count > 0 {
            all_passed = false;
        }
    }

    let state_dir = resolve_state_dir(&config.gateway.state_dir);
    let dir_ok = std::fs::create_dir_all(&state_dir).is_ok();
    let writable = if dir_ok {
        let probe = state_dir.join(".clawdbot_doctor_probe");
        let w = std::fs::write(&probe, b"probe").is_ok();
        let _ = std::fs::remove_file(&probe);
        w
    } else {
        false
    };
    print_check(
        "State directory writable",
        dir_ok && writable,
        format!("{}", state_dir.display()),
    );
    if !(dir_ok && writable) {
        all_passed = false;
    }

    println!();
    if all_passed {
        println!("All checks passed.");
    } else {
        println!("Some checks failed. Review the output above.");
    }
    all_passed
}

fn print_check(name: &str, passed: bool, detail: String) {
    let status = if passed { "PASS" } else { "FAIL" };
    println!("  [{status}] {name}: {detail}");
}

/// Expand a leading `~/` against `$HOME`; relative/absolute paths pass
/// through unchanged.
fn resolve_state_dir(raw: &str) -> std::path::PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return std::path::PathBuf::from(home).join(rest);
        }
    }
    std::path::PathBuf::from(raw)
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("clawdbot-gateway starting");

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let state_dir = resolve_state_dir(&config.gateway.state_dir);
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;
    tracing::info!(path = %state_dir.display(), "state directory ready");

    let sessions = Arc::new(SessionStore::new(state_dir.join("sessions.json")));
    tracing::info!("session store ready");

    let denied_patterns = Arc::new(
        config
            .exec
            .denied_patterns
            .iter()
            .map(|p| regex::Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .context("compiling exec.denied_patterns")?,
    );
    tracing::info!(patterns = denied_patterns.len(), "denied-command patterns compiled");

    let exec_manager = Arc::new(ExecManager::new(config.exec.clone()));
    tracing::info!("sandbox exec manager ready");

    let approvals_file_path = config
        .approvals
        .file_path
        .clone()
        .unwrap_or_else(|| state_dir.join("approvals.json").to_string_lossy().into_owned());
    let approvals_socket_path = config
        .approvals
        .socket_path
        .clone()
        .unwrap_or_else(|| state_dir.join("approvals.sock").to_string_lossy().into_owned());
    let approvals = Arc::new(ApprovalsStore::new(approvals_file_path, approvals_socket_path.clone()));
    let approvals_file = approvals.load_or_init().await.context("loading approvals file")?;
    tracing::info!(agents = approvals_file.agents.len(), "exec approvals file ready");

    let approval_pending = Arc::new(ApprovalPendingStore::new(Duration::from_secs(config.approvals.retention_sec)));
    let approval_socket = Arc::new(ApprovalSocket::new(approval_pending.clone(), approvals_file.socket.token.clone()));
    {
        let socket = approval_socket.clone();
        let socket_path = std::path::PathBuf::from(&approvals_file.socket.path);
        tokio::spawn(async move {
            if let Err(e) = socket.serve(&socket_path).await {
                tracing::error!(error = %e, "approval socket exited");
            }
        });
    }
    tracing::info!(path = %approvals_file.socket.path, "approval socket listening");

    let nodes = Arc::new(NodeRegistry::new());
    let platform_commands = config.nodes.platform_commands.clone();
    let invoke_router = Arc::new(InvokeRouter::new(nodes.clone(), Duration::from_secs(60), platform_commands));
    tracing::info!("node registry and invoke router ready");

    let session_locks = Arc::new(SessionLockMap::new());
    let session_queue = Arc::new(SessionQueue::new());
    let cancel_map = Arc::new(CancelMap::new());

    let (events_tx, _events_rx) = tokio::sync::broadcast::channel(1024);

    let token_hash = std::env::var(&config.gateway.token_env).ok().map(|token| Sha256::digest(token.as_bytes()).to_vec());
    if token_hash.is_some() {
        tracing::info!(env = %config.gateway.token_env, "gateway bearer token configured");
    } else {
        tracing::warn!(env = %config.gateway.token_env, "no gateway token set — hub connections are unauthenticated");
    }

    let providers: Arc<dyn cb_providers::ModelProvider> = Arc::new(UnconfiguredProvider);

    let app_state = Arc::new(AppState {
        config: config.clone(),
        sessions,
        session_locks,
        session_queue,
        cancel_map,
        events: events_tx,
        exec_manager,
        approvals,
        approval_pending,
        approval_socket: Some(approval_socket),
        denied_patterns,
        nodes,
        invoke_router,
        providers,
        token_hash,
        started_at: chrono::Utc::now(),
        boot_id: uuid::Uuid::new_v4(),
        state_version: Arc::new(parking_lot::RwLock::new(StateVersion::default())),
    });

    // ── Maintenance loops ──────────────────────────────────────────────
    {
        let state = app_state.clone();
        let retention = Duration::from_secs(config.approvals.retention_sec.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(retention.min(Duration::from_secs(60)));
            loop {
                tick.tick().await;
                let expired = state.approval_pending.remove_expired();
                if expired > 0 {
                    tracing::debug!(expired, "expired pending approvals swept");
                }
            }
        });
    }
    {
        let state = app_state.clone();
        let stale_after = config.nodes.stale_after_sec;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                let before = state.nodes.len();
                state.nodes.prune_stale(stale_after as i64);
                if state.nodes.len() != before {
                    state.bump_presence();
                }
            }
        });
    }
    {
        let state = app_state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(30));
            loop {
                tick.tick().await;
                state.session_locks.prune_idle();
                state.invoke_router.sweep();
            }
        });
    }
    // `tick`/`health` events are emitted independently of any turn (spec
    // §4.I) so a connected chat-ui can observe liveness even when no
    // session has an active turn.
    {
        let state = app_state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(15));
            loop {
                tick.tick().await;
                let _ = state.events.send(events::GatewayEvent::tick());
            }
        });
    }
    {
        let state = app_state.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            loop {
                tick.tick().await;
                let _ = state.events.send(events::GatewayEvent::health(true));
            }
        });
    }
    tracing::info!("maintenance loops started");

    // ── CORS layer ───────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors_allowed_origins);

    let max_concurrent = config.server.max_concurrent_requests;
    tracing::info!(max_concurrent, "concurrency limit set");

    let governor_layer = config.server.rate_limit.as_ref().map(|rl| {
        use tower_governor::governor::GovernorConfigBuilder;
        use tower_governor::GovernorLayer;

        let gov_config = GovernorConfigBuilder::default()
            .per_second(rl.requests_per_second)
            .burst_size(rl.burst_size)
            .finish()
            .expect("rate_limit: requests_per_second and burst_size must be > 0");

        tracing::info!(
            requests_per_second = rl.requests_per_second,
            burst_size = rl.burst_size,
            "per-IP rate limiting enabled"
        );

        GovernorLayer { config: Arc::new(gov_config) }
    });
    if governor_layer.is_none() {
        tracing::info!("per-IP rate limiting disabled (no [server.rate_limit] in config)");
    }

    let router = axum::Router::new()
        .route("/v1/hub/ws", get(hub::ws_handler))
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));
    let app = if let Some(gov) = governor_layer {
        router.layer(gov).with_state(app_state)
    } else {
        router.with_state(app_state)
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await.with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "clawdbot-gateway listening");

    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins. A single
/// `"*"` entry allows everything (dev mode); a trailing `:*` on an origin
/// matches any port on that host; anything else must match exactly.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
