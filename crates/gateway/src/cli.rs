//! Command-line surface (spec §4.H ambient stack): `serve` (default),
//! `doctor`, `config validate|show`, `version`.
//!
//! Grounded on the teacher's `cli/mod.rs` — same `Cli`/`Command` shape via
//! clap derive, same `load_config()` helper reading a config-path env var
//! with a `config.toml` default — trimmed to the subcommands this gateway
//! actually has a use for. The teacher's `init`/`run`/`systemd`/`import`
//! and secret-management (`SetSecret`/`GetSecret`/`Login`) subcommands have
//! no counterpart here: this gateway has no OS keychain integration and no
//! project scaffolding step.

use clap::{Parser, Subcommand};

/// clawdbot-gateway — a multi-channel chatbot gateway.
#[derive(Debug, Parser)]
#[command(name = "clawdbot-gateway", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

/// Load the configuration from the path named by `CLAWDBOT_CONFIG` (or
/// `config.toml` by default). Returns the parsed [`Config`] and the path
/// that was used; shared by `serve`, `doctor`, and `config` so the
/// loading logic lives in one place.
pub fn load_config() -> anyhow::Result<(cb_domain::config::Config, String)> {
    let config_path = std::env::var("CLAWDBOT_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        cb_domain::config::Config::default()
    };

    Ok((config, config_path))
}

/// Parse and validate the config, printing any issues. Returns `true`
/// when no errors (warnings are still printed but don't fail validation).
pub fn validate(config: &cb_domain::config::Config, config_path: &str) -> bool {
    use cb_domain::config::ConfigSeverity;

    let issues = config.validate();
    if issues.is_empty() {
        println!("Config OK ({config_path})");
        return true;
    }

    let error_count = issues.iter().filter(|e| e.severity == ConfigSeverity::Error).count();
    let warning_count = issues.len() - error_count;

    for issue in &issues {
        println!("{issue}");
    }
    println!("\n{error_count} error(s), {warning_count} warning(s) in {config_path}");

    error_count == 0
}

/// Dump the resolved config (with all defaults filled in) as TOML.
pub fn show(config: &cb_domain::config::Config) {
    match toml::to_string_pretty(config) {
        Ok(output) => print!("{output}"),
        Err(e) => {
            eprintln!("Failed to serialize config: {e}");
            std::process::exit(1);
        }
    }
}
