use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use music_track_enricher as lib;
use lib::checkpoint::CheckpointStore;
use lib::config::Config;
use lib::dedup::ChallengeSet;
use lib::scheduler::{exit_status, Enricher, RunOutcome};
use std::path::{Path, PathBuf};
use tracing::subscriber as tracing_subscriber_global;
use tracing::{error, info, warn};
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "track-enricher", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enrich every unique track of the challenge set, resuming if interrupted
    Run {
        /// Ignore not-found lookups recorded by earlier runs
        #[arg(long)]
        retry_not_found: bool,
    },
    /// Show how far the current run got
    Status,
    /// Forget the done-set so the next run starts over (the dataset is kept)
    ClearCheckpoint,
    /// Validate config file and exit
    ConfigValidate,
    /// Write the challenge set with each track's enrichment attached
    Export {
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
    },
}

fn resolve_config_path(explicit: Option<&PathBuf>) -> PathBuf {
    match explicit {
        Some(p) => p.clone(),
        None => {
            let etc_path = Path::new("/etc/track-enricher/config.toml");
            if etc_path.exists() {
                etc_path.to_path_buf()
            } else {
                PathBuf::from("config/example-config.toml")
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_ref());

    if let Commands::ConfigValidate = cli.command {
        match Config::from_path(&config_path) {
            Ok(_) => println!("OK"),
            Err(e) => {
                eprintln!("Config validation failed: {:#}", e);
                std::process::exit(2);
            }
        }
        return Ok(());
    }

    let cfg = Config::from_path(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // log -> tracing bridge, then stdout plus a daily file in cfg.log_dir.
    let _ = LogTracer::init();
    let file_appender: RollingFileAppender =
        tracing_appender::rolling::daily(&cfg.log_dir, "track-enricher.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stdout));
    if let Err(e) = tracing_subscriber_global::set_global_default(subscriber) {
        eprintln!("failed to set global tracing subscriber: {}", e);
    }

    let code = match cli.command {
        Commands::Run { retry_not_found } => {
            let mut cfg = cfg;
            cfg.retry_not_found |= retry_not_found;
            let result = run(&cfg).await;
            match &result {
                Ok(RunOutcome::Completed(_)) => {}
                Ok(RunOutcome::Interrupted(s)) => {
                    warn!(
                        "Stopped by operator after {} of {} pending tracks; run again to resume",
                        s.processed,
                        s.total - s.already_done
                    );
                }
                Err(e) => error!("Run failed: {:#}", e),
            }
            exit_status(&result)
        }
        Commands::Status => {
            let work = ChallengeSet::from_path(&cfg.challenge_set)?.work_items();
            let p = CheckpointStore::from_config(&cfg).progress(&work)?;
            println!("Unique tracks:   {}", p.total);
            println!("Done:            {}", p.done);
            println!("Pending:         {}", p.pending);
            println!("Records on disk: {}", p.records);
            println!(
                "Interrupted run: {}",
                if p.interrupted_run { "yes (run will resume)" } else { "no" }
            );
            if let Ok(conn) = lib::db::open_or_create(&cfg.lookup_db_path) {
                if let Ok(n) = lib::db::count_not_found(&conn) {
                    println!("Known lookup misses: {}", n);
                }
            }
            0
        }
        Commands::ClearCheckpoint => match CheckpointStore::from_config(&cfg).clear() {
            Ok(()) => {
                println!("Checkpoint cleared.");
                0
            }
            Err(e) => {
                eprintln!("Failed to clear checkpoint: {:#}", e);
                1
            }
        },
        Commands::Export { out } => {
            let (dataset, _) = CheckpointStore::from_config(&cfg).load()?;
            lib::export::export_challenge_set(&cfg.challenge_set, &dataset, &out)?;
            0
        }
        Commands::ConfigValidate => 0,
    };

    // process::exit skips destructors; flush the file writer first.
    drop(guard);
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(cfg: &Config) -> Result<RunOutcome> {
    let set = ChallengeSet::from_path(&cfg.challenge_set)?;
    let work = set.work_items();
    info!("Loaded {} unique tracks from {}", work.len(), cfg.challenge_set.display());

    let mut enricher = Enricher::from_config(cfg)?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Listening for ctrl-c failed: {}", e);
            std::future::pending::<()>().await;
        }
    };
    enricher.run(&work, shutdown).await
}
