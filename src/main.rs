//! TT-Jukebox - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tt_jukebox::{Config, Outcome, Session, SessionOptions, display};

/// Exit status after Ctrl+C, as shells report SIGINT
const INTERRUPTED: u8 = 130;

const EXAMPLES: &str = "\
Examples:
  tt-jukebox chat                        Find a chat model for your hardware
  tt-jukebox --model llama               Find configurations for a specific model
  tt-jukebox --list                      List all compatible models
  tt-jukebox --list --show-experimental  Include same-family experimental models
  tt-jukebox chat --force                Apply setup without asking
  tt-jukebox --model qwen --force --run  Set up and start the server";

#[derive(Parser, Debug)]
#[command(name = "tt-jukebox")]
#[command(about = "Match Tenstorrent hardware to validated models and prepare the serving environment", long_about = None)]
#[command(version, after_help = EXAMPLES)]
struct Cli {
    /// Task to find a model for (chat, code, image, video, agent, reasoning)
    task: Option<String>,

    /// Model name substring to search for
    #[arg(short, long)]
    model: Option<String>,

    /// List all compatible models for the detected hardware
    #[arg(short, long)]
    list: bool,

    /// Include unvalidated models from the same architecture family
    #[arg(short = 'e', long)]
    show_experimental: bool,

    /// Run the reconciliation pass even when nothing needs to change
    #[arg(long)]
    setup: bool,

    /// Apply changes without asking for confirmation
    #[arg(short, long)]
    force: bool,

    /// HuggingFace token for gated model downloads (or set HF_TOKEN)
    #[arg(long = "hf-token", alias = "token")]
    hf_token: Option<String>,

    /// Ignore the cached model specifications and refetch them
    #[arg(long)]
    refresh_cache: bool,

    /// Start the vLLM server once the environment is ready
    #[arg(long)]
    run: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "debug")]
    log_level: String,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

impl Cli {
    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            query: self.model.clone().or_else(|| self.task.clone()),
            list: self.list,
            show_experimental: self.show_experimental,
            setup: self.setup,
            force: self.force,
            hf_token: self.hf_token.clone(),
            refresh_cache: self.refresh_cache,
            run: self.run,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        // Exit here: runtime shutdown would wait on a blocked stdin read
        Ok(INTERRUPTED) => std::process::exit(i32::from(INTERRUPTED)),
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = ?e, "tt-jukebox failed");
            display::error(&format!("✗ {:#}", e));
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = Config::load(cli.config.clone())?;
    config.validate()?;

    let log_file = init_logging(&cli, &config.log_dir());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        scratch_dir = ?config.scratch_dir,
        specs_url = %config.specs_url,
        log_file = ?log_file,
        "Starting tt-jukebox"
    );

    let session = Session::new(config)?;
    let options = cli.session_options();

    let code = supervise(session.run(&options), interrupted()).await;

    if let Some(path) = log_file {
        display::info(&format!("Log file: {}", path.display()));
    }

    code
}

/// Drive the session until it finishes or `interrupt` fires
async fn supervise(
    session: impl Future<Output = Result<Outcome>>,
    interrupt: impl Future<Output = ()>,
) -> Result<u8> {
    let code = tokio::select! {
        result = session => {
            let outcome = result?;
            tracing::info!(outcome = ?outcome, "Session finished");
            outcome.exit_code()
        }
        _ = interrupt => {
            // Dropping the session future kills any running child process
            display::warning("\n⚠ Interrupted");
            tracing::warn!("Interrupted by user");
            return Ok(INTERRUPTED);
        }
    };

    u8::try_from(code).context("exit code out of range")
}

async fn interrupted() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

/// Log to a per-run file in `log_dir`, or stderr when it cannot be created
fn init_logging(cli: &Cli, log_dir: &Path) -> Option<PathBuf> {
    let (writer, path) = match open_log_file(log_dir) {
        Ok((file, path)) => (BoxMakeWriter::new(Arc::new(file)), Some(path)),
        Err(e) => {
            eprintln!("Warning: logging to stderr ({:#})", e);
            (BoxMakeWriter::new(std::io::stderr), None)
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(&cli.log_level)
        .with_writer(writer)
        .with_ansi(false);

    match cli.log_format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    path
}

fn open_log_file(log_dir: &Path) -> Result<(std::fs::File, PathBuf)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
    let path = log_dir.join(format!(
        "tt-jukebox-{}.log",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to create log file: {:?}", path))?;
    Ok((file, path))
}
