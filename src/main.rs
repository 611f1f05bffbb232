//! Music Scrobbler - Main entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing_subscriber::EnvFilter;

use music_scrobbler::clock::SystemClock;
use music_scrobbler::config::{Config, ConfigOverrides, LogFormat};
use music_scrobbler::controller::PollController;
use music_scrobbler::engine::ScrobbleEngine;
use music_scrobbler::error::Result;
use music_scrobbler::history::HistoryStore;
use music_scrobbler::mpris::MprisSource;
use music_scrobbler::sink::SinkDispatcher;
use music_scrobbler::source::PlayerFilter;
use music_scrobbler::track::PlayerId;

#[derive(Parser)]
#[command(name = "music-scrobbler")]
#[command(author, version, about = "Scrobble what your media players play")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Seconds between polls
    #[arg(long, global = true, env = "SCROBBLE_INTERVAL")]
    interval: Option<u64>,

    /// Percentage of a track that must be heard (0-100)
    #[arg(long, global = true, env = "SCROBBLE_THRESHOLD_PERCENT")]
    threshold_percent: Option<f64>,

    /// Seconds between player rediscovery
    #[arg(long, global = true, env = "SPEAKER_REDISCOVERY_INTERVAL")]
    rediscovery_interval: Option<u64>,

    /// Local log format (jsonl or text)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Local log file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll players and scrobble (runs in foreground)
    Run,

    /// Create the config, data and log directories
    Init,

    /// Show or edit configuration
    Config {
        /// Print current configuration
        #[arg(long)]
        show: bool,

        /// Create default configuration file
        #[arg(long)]
        init: bool,
    },

    /// Inspect or reset scrobble history
    History {
        /// Print per-player history
        #[arg(long)]
        show: bool,

        /// Forget one player
        #[arg(long, value_name = "PLAYER")]
        clear: Option<String>,

        /// Forget every player
        #[arg(long)]
        clear_all: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before logging so log_level applies
    let mut config = if let Some(ref path) = cli.config {
        Config::load_from(path)?
    } else {
        Config::load()?
    };
    config.apply(&ConfigOverrides {
        interval_seconds: cli.interval,
        threshold_percent: cli.threshold_percent,
        rediscovery_interval_seconds: cli.rediscovery_interval,
        log_format: cli.log_format,
        log_path: cli.log_file.clone(),
    });

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.to_lowercase()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    config.validate()?;

    match cli.command {
        Some(Commands::Run) | None => run_scrobbler(config).await,

        Some(Commands::Init) => {
            let config_dir = Config::config_dir()?;
            let data_dir = config.data_dir()?;
            let log_path = config.log_path()?;
            std::fs::create_dir_all(&config_dir)?;
            std::fs::create_dir_all(&data_dir)?;
            if let Some(parent) = log_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            println!("Config directory: {}", config_dir.display());
            println!("Data directory:   {}", data_dir.display());
            println!("Scrobble log:     {}", log_path.display());
            Ok(())
        }

        Some(Commands::Config { show, init }) => {
            if init {
                let default_config = Config::default();
                default_config.save()?;
                println!(
                    "Created default configuration at {}",
                    Config::config_path()?.display()
                );
            } else if show {
                let contents = toml::to_string_pretty(&config)?;
                println!("{contents}");
            } else {
                println!("Configuration path: {}", Config::config_path()?.display());
            }
            Ok(())
        }

        Some(Commands::History {
            show,
            clear,
            clear_all,
        }) => {
            let store = HistoryStore::open(config.history_path()?).await?;
            if clear_all {
                let count = store.clear_all().await?;
                println!("Cleared history for {count} player(s)");
            } else if let Some(player) = clear {
                if store.clear(&PlayerId::new(player.as_str())).await? {
                    println!("Cleared history for {player}");
                } else {
                    println!("No history for {player}");
                }
            } else if show {
                print_history(&store).await;
            } else if let Some(path) = store.path() {
                println!("History path: {}", path.display());
            }
            Ok(())
        }
    }
}

async fn run_scrobbler(config: Config) -> Result<()> {
    let data_dir = config.data_dir()?;
    std::fs::create_dir_all(&data_dir)?;

    let store = HistoryStore::open(config.history_path()?).await?;
    if let Some(path) = store.path() {
        tracing::info!("History at {}", path.display());
    }

    let dispatcher = SinkDispatcher::from_config(&config)?;
    let source = MprisSource::new(Arc::new(SystemClock::new())).await?;

    let controller = PollController::new(
        Arc::new(source),
        store,
        ScrobbleEngine::new(config.engine_config()),
        dispatcher,
        config.controller_config(),
    )
    .with_filter(PlayerFilter::new(&config.players));

    // Handle shutdown signals
    let controller = Arc::new(controller);
    let controller_clone = controller.clone();

    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        tracing::info!("Received shutdown signal, stopping...");
        controller_clone.stop();
    });

    // Also handle SIGTERM
    #[cfg(unix)]
    {
        let controller_clone = controller.clone();
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::spawn(async move {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, stopping...");
                    controller_clone.stop();
                });
            }
            Err(e) => {
                tracing::warn!("Failed to register SIGTERM handler: {}. Use Ctrl+C to stop.", e);
            }
        }
    }

    controller.run().await
}

async fn print_history(store: &HistoryStore) {
    let entries = store.entries().await;
    if entries.is_empty() {
        println!("No history yet.");
        return;
    }

    for (player, state) in entries {
        println!("{player}");
        match state.current_track {
            Some(ref track) => println!(
                "  current:  {} ({} watched{})",
                track,
                state.watched,
                if state.scrobbled_this_play {
                    ", scrobbled"
                } else {
                    ""
                }
            ),
            None => println!("  current:  -"),
        }
        for (track, at) in &state.recent_scrobbles {
            println!("  recent:   {} at {}", track, at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
}
