//! CLI entry point for vidmerge
//!
//! `merge` runs one merge-and-publish pass over local files and links; `serve` keeps
//! the workspace janitor and metrics endpoint running until Ctrl-C.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vidmerge::config::Config;
use vidmerge::{Daemon, DaemonError, LogReplySink};

/// Log filter used when `RUST_LOG` is unset. The library and this binary both log
/// under the `vidmerge` target.
const DEFAULT_LOG_FILTER: &str = "vidmerge=info";

/// vidmerge - merge videos and publish the result to two destinations
#[derive(Parser, Debug)]
#[command(name = "vidmerge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (ffmpeg, ffprobe). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge the given files or links and publish the result
    Merge {
        /// User the inputs are queued for
        #[arg(short, long, default_value_t = 0)]
        user: i64,

        /// Output container (mp4, mkv, webm, avi, mov, m4v)
        #[arg(short, long)]
        format: Option<String>,

        /// Local paths or direct video links, in merge order
        #[arg(required = true, num_args = 2..)]
        inputs: Vec<String>,
    },
    /// Run the janitor scheduler and metrics server until Ctrl-C
    Serve,
}

fn load_config(path: &Path) -> Result<Config, DaemonError> {
    if path.exists() {
        return Ok(Config::load(path)?);
    }
    warn!(path = %path.display(), "config file not found, using defaults");
    let mut config = Config::default();
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn init_daemon(args: &Args) -> Result<Daemon, DaemonError> {
    let config = load_config(&args.config)?;
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config).await
    }
}

async fn run(args: Args) -> Result<bool, DaemonError> {
    let daemon = init_daemon(&args).await?;

    match args.command {
        Command::Merge {
            user,
            format,
            inputs,
        } => {
            let reply = LogReplySink::new(user);
            let outcome = daemon
                .merge_inputs_until(user, format.as_deref(), &inputs, &reply, interrupted())
                .await?;
            println!("{}", outcome.report);
            Ok(outcome.succeeded())
        }
        Command::Serve => {
            let shutdown = tokio_util::sync::CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for Ctrl-C");
                }
                info!("shutdown requested");
                trigger.cancel();
            });
            info!(
                "metrics available on http://{}/metrics",
                daemon.config.metrics.bind
            );
            daemon.run_with_server(shutdown).await?;
            Ok(true)
        }
    }
}

/// Resolves on Ctrl-C; never resolves if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("interrupt received");
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "vidmerge starting");

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "vidmerge failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
