//! CLI entry point for the library transcoder
//!
//! Parses arguments, sets up logging and the stop signal, and runs one
//! sweep (or probes/checks a single file).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use library_transcoder::{install_termination_handler, Config, Daemon, StopSignal};
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::process::ExitCode;

/// Re-encode a media library to a smaller codec, one file at a time
#[derive(Parser, Debug)]
#[command(name = "library-transcoder")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Library root, overriding config and ROOT_PATH
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Enable debug logging for the transcoder
    #[arg(short, long)]
    verbose: bool,

    /// Skip startup checks (ffmpeg, ffprobe, lsof)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Print results as JSON on stdout
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk the library once (default)
    Run,
    /// Print what the prober reports for a file
    Probe { file: PathBuf },
    /// Print the eligibility decision for a file without encoding it
    Check { file: PathBuf },
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();
    if verbose {
        builder.filter_module("library_transcoder", LevelFilter::Debug);
    }
    builder.init();
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config =
        Config::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(root) = &args.root {
        config.library.root_path = root.clone();
    }
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;
    let stop = StopSignal::new();

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!("Library transcoder starting");
            info!("  Root: {}", config.library.root_path.display());
            info!("  CRF: {}", config.encoder.crf);
            info!(
                "  Re-encode {} above {} MB/h: {}",
                config.eligibility.current_codecs.join("/"),
                config.eligibility.current_max_mb_per_hour,
                config.eligibility.reencode_current
            );

            install_termination_handler(stop.clone()).context("Failed to install signal handler")?;

            let daemon = if args.skip_checks {
                warn!("Skipping startup checks (--skip-checks enabled)");
                Daemon::new_without_checks(config, stop)
            } else {
                Daemon::new(config, stop).context("Startup failed")?
            };

            let summary = daemon.run().await.context("Sweep failed")?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            }
            info!("Stopped");
        }
        Command::Probe { file } => {
            let daemon = Daemon::new_without_checks(config, stop);
            let descriptor = daemon
                .probe(&file)
                .await
                .with_context(|| format!("Failed to probe {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
        }
        Command::Check { file } => {
            let daemon = Daemon::new_without_checks(config, stop);
            let decision = daemon
                .check(&file)
                .await
                .with_context(|| format!("Failed to probe {}", file.display()))?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&decision)?);
            } else {
                match decision {
                    library_transcoder::EligibilityDecision::Eligible(by) => {
                        println!("{}: eligible ({:?})", file.display(), by)
                    }
                    library_transcoder::EligibilityDecision::Skip(reason) => {
                        println!("{}: skipped ({})", file.display(), reason)
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
