//! # coder-bridge
//!
//! Command-line front end for the bridge: locate the CLI tool, dispatch a
//! single request, or drive an interactive session from a terminal.
//!
//! Machine-readable results go to stdout; logs and warnings go to stderr.

use anyhow::{Context, Result};
use bridge_adapters::{BinaryLocator, Bridge};
use bridge_core::BridgeConfig;
use bridge_proto::{BridgeEvent, ExecutionRequest, RequestedMode};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Identity used for rate limiting when none is given.
const LOCAL_IDENTITY: &str = "local";

/// Typed in a session to stop it.
const STOP_COMMAND: &str = ":stop";

/// Coder Bridge - supervise a local AI coding CLI
#[derive(Parser, Debug)]
#[command(name = "coder-bridge", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "coder-bridge.yml", global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find and probe the CLI binary
    Locate(LocateArgs),

    /// Dispatch one command and print the result as JSON
    Exec(ExecArgs),

    /// Open an interactive session fed from stdin
    Session(SessionArgs),

    /// Validate the configuration and print the effective values
    Config,
}

#[derive(Parser, Debug)]
struct LocateArgs {
    /// Ignore any cached result and probe again
    #[arg(long)]
    refresh: bool,
}

#[derive(Parser, Debug)]
struct ExecArgs {
    /// Command text to send to the CLI
    command: String,

    /// Working directory for the CLI process
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Session to run in (interactive path)
    #[arg(long)]
    session: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Execution path
    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    mode: ModeArg,

    /// Client identity for rate limiting
    #[arg(long, default_value = LOCAL_IDENTITY)]
    identity: String,

    /// Ask for plain text instead of structured output
    #[arg(long)]
    text: bool,
}

#[derive(Parser, Debug)]
struct SessionArgs {
    /// Session id (generated when omitted)
    #[arg(long)]
    id: Option<String>,

    /// Working directory for the CLI process
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Per-command timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Auto,
    Headless,
    Interactive,
}

impl From<ModeArg> for RequestedMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Auto => RequestedMode::Auto,
            ModeArg::Headless => RequestedMode::Headless,
            ModeArg::Interactive => RequestedMode::Interactive,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries results
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Locate(args) => locate_command(config, args).await,
        Commands::Exec(args) => exec_command(config, args).await,
        Commands::Session(args) => session_command(config, args).await,
        Commands::Config => config_command(&config),
    }
}

/// Loads the file (or defaults), applies environment overrides and validates.
fn load_config(path: &Path) -> Result<BridgeConfig> {
    let mut config = if path.exists() {
        BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?
    } else {
        debug!("Config file {:?} not found, using defaults", path);
        BridgeConfig::default()
    };
    config.apply_env();

    let warnings = config.validate().context("Configuration validation failed")?;
    for warning in &warnings {
        eprintln!("{warning}");
    }
    Ok(config)
}

async fn locate_command(config: BridgeConfig, args: LocateArgs) -> Result<()> {
    let locator = BinaryLocator::new(config.binary);
    let found = if args.refresh {
        locator.refresh().await
    } else {
        locator.locate().await
    };

    match found {
        Ok(info) => {
            println!("{}", serde_json::to_string_pretty(&info)?);
            Ok(())
        }
        Err(e) => anyhow::bail!("{e}"),
    }
}

async fn exec_command(config: BridgeConfig, args: ExecArgs) -> Result<()> {
    let bridge = Bridge::new(config).context("Failed to initialize bridge")?;

    let mut request = ExecutionRequest::new(args.command).with_mode(args.mode.into());
    if let Some(cwd) = args.cwd {
        request = request.with_working_directory(cwd);
    }
    if let Some(session) = args.session {
        request = request.with_session(session);
    }
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout(Duration::from_millis(ms));
    }
    if args.text {
        request = request.with_output_format("text");
    }

    let outcome = bridge.execute(request, &args.identity).await;
    bridge.shutdown().await;
    let result = outcome.context("Request rejected")?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

async fn session_command(config: BridgeConfig, args: SessionArgs) -> Result<()> {
    let bridge = Bridge::new(config).context("Failed to initialize bridge")?;
    let _maintenance = bridge.spawn_maintenance();

    let session_id = args
        .id
        .unwrap_or_else(|| format!("cli-{}", std::process::id()));
    let (viewer, mut events) = mpsc::unbounded_channel();
    bridge
        .attach(&session_id, LOCAL_IDENTITY, viewer)
        .context("Failed to attach to session")?;

    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = events.recv().await {
            match event {
                BridgeEvent::Data { data, .. } => {
                    let _ = stdout.write_all(data.as_bytes());
                    let _ = stdout.flush();
                }
                BridgeEvent::SessionCreated { session_id } => {
                    eprintln!("[session {session_id} started]");
                }
                BridgeEvent::Closed {
                    session_id, reason, ..
                } => {
                    eprintln!("[session {session_id} closed: {reason:?}]");
                }
                BridgeEvent::Retry {
                    kind,
                    attempt,
                    delay_ms,
                    ..
                } => {
                    eprintln!("[retrying after {kind} error, attempt {attempt} in {delay_ms}ms]");
                }
            }
        }
    });

    info!(session_id = %session_id, "Type a command per line, {} to end", STOP_COMMAND);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        if line == STOP_COMMAND {
            break;
        }

        let mut request = ExecutionRequest::new(line)
            .with_session(session_id.clone())
            .with_mode(RequestedMode::Interactive);
        if let Some(cwd) = &args.cwd {
            request = request.with_working_directory(cwd.clone());
        }
        if let Some(ms) = args.timeout_ms {
            request = request.with_timeout(Duration::from_millis(ms));
        }

        match bridge.execute(request, LOCAL_IDENTITY).await {
            Ok(result) if result.success => {}
            Ok(result) => {
                if let Some(error) = result.error {
                    eprintln!("[{}] {}", error.kind, error.message);
                }
            }
            Err(e) => warn!(error = %e, "Command rejected"),
        }
    }

    if let Err(e) = bridge.stop(&session_id, LOCAL_IDENTITY).await {
        debug!(error = %e, "Session already gone");
    }
    bridge.shutdown().await;
    printer.abort();
    Ok(())
}

fn config_command(config: &BridgeConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to render configuration")?;
    print!("{yaml}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_args_parse() {
        let cli = Cli::try_parse_from([
            "coder-bridge",
            "exec",
            "build feature X",
            "--mode",
            "interactive",
            "--session",
            "s1",
            "--timeout-ms",
            "5000",
        ])
        .unwrap();

        match cli.command {
            Commands::Exec(args) => {
                assert_eq!(args.command, "build feature X");
                assert!(matches!(
                    RequestedMode::from(args.mode),
                    RequestedMode::Interactive
                ));
                assert_eq!(args.session.as_deref(), Some("s1"));
                assert_eq!(args.timeout_ms, Some(5000));
                assert_eq!(args.identity, LOCAL_IDENTITY);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from("coder-bridge.yml"));
    }
}
