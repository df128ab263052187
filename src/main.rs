//! Focus Monitor CLI
//!
//! Runs the capture service and inspects what it has recorded.

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use focus_monitor::{
    config::{self, Config, Paths},
    inference::{GeminiClient, GeminiConfig},
    server::{self, ServerConfig},
    FocusMonitor, SessionStore, VERSION,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "focus-monitor")]
#[command(version = VERSION)]
#[command(about = "Camera and microphone sampling with focus analysis", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service and resume any in-flight session
    Serve {
        /// Port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show the checkpointed session state
    Status,

    /// List archived sessions
    Sessions,

    /// Show configuration and resolved paths
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        init: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: Could not load config, using defaults: {e}");
            Config::default()
        }
    };
    let paths = config.paths();

    let dotenv = paths.root.join(".env");
    if dotenv.is_file() {
        if let Err(e) = config::load_dotenv(&dotenv) {
            eprintln!("Warning: Could not read {}: {e}", dotenv.display());
        }
    }

    match cli.command {
        Commands::Serve { port } => {
            init_tracing();
            if let Err(e) = cmd_serve(config, paths, port) {
                eprintln!("Error: {e:#}");
                std::process::exit(1);
            }
        }
        Commands::Status => {
            cmd_status(&paths);
        }
        Commands::Sessions => {
            cmd_sessions(&paths);
        }
        Commands::Config { init } => {
            if init {
                cmd_config_init(&config);
            }
            cmd_config(&config, &paths);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("focus_monitor=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn cmd_serve(config: Config, paths: Paths, port: Option<u16>) -> anyhow::Result<()> {
    paths
        .ensure_directories()
        .context("creating data directories")?;

    let gemini = GeminiConfig::from_config(&config);
    if gemini.api_key.is_none() {
        tracing::warn!(
            "No API key in {}; captures will fail until one is set",
            config::API_KEY_VARS.join(" or ")
        );
    }

    tracing::info!("Project root: {}", paths.root.display());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating async runtime")?;

    runtime.block_on(async move {
        let monitor = Arc::new(FocusMonitor::new(
            &config,
            paths,
            Arc::new(GeminiClient::new(gemini)),
        ));
        monitor.restore();

        let server_config = ServerConfig::new(port.unwrap_or(config.port));
        let (addr, shutdown_tx) = server::run(server_config, monitor.clone()).await?;
        println!("Dashboard: http://{addr}/");

        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl+C")?;

        println!();
        println!("Shutting down...");
        // Leave the session active in the checkpoint so the next start resumes it.
        monitor.shutdown();
        let _ = shutdown_tx.send(());
        Ok::<(), anyhow::Error>(())
    })
}

fn cmd_status(paths: &Paths) {
    let store = SessionStore::new(&paths.sessions_dir);

    println!("Focus Monitor Status");
    println!("====================");
    println!();

    let state = match store.load_checkpoint() {
        Ok(Some(state)) => state,
        Ok(None) => {
            println!("No session data found.");
            return;
        }
        Err(e) => {
            eprintln!("Error reading checkpoint: {e}");
            std::process::exit(1);
        }
    };

    let stats = state.stats(Utc::now(), None);
    println!("Status: {}", stats.status);
    if let Some(id) = state.session_id() {
        println!("Session: {id}");
    }
    if let Some(started) = state.started_at() {
        println!("Started: {}", local_time(started));
    }
    if stats.session_active {
        println!("Duration: {}", format_duration(stats.duration_seconds));
    }
    println!("Samples: {}", stats.samples_count);
    println!();

    if let Some(point) = state.focus_history().last() {
        println!("Last sample ({}):", local_time(point.timestamp));
        println!("  Focus level: {:.2}", point.focus_level);
        println!("  Focused: {}", point.is_focused);
        println!("  Away: {}", point.is_away);
        println!("  Noise: {:.1} dB", point.decibels);
        if !state.last_analysis().summary.is_empty() {
            println!("  Summary: {}", state.last_analysis().summary);
        }
    }
}

fn cmd_sessions(paths: &Paths) {
    let store = SessionStore::new(&paths.sessions_dir);
    let sessions = match store.load_archives() {
        Ok(sessions) => sessions,
        Err(e) => {
            eprintln!("Error reading sessions: {e}");
            std::process::exit(1);
        }
    };

    if sessions.is_empty() {
        println!("No archived sessions in {}", store.dir().display());
        return;
    }

    println!("{:<20} {:<20} {:>10} {:>8}", "ID", "STARTED", "DURATION", "SAMPLES");
    for session in &sessions {
        println!(
            "{:<20} {:<20} {:>10} {:>8}",
            session.id,
            local_time(session.start),
            format_duration((session.end - session.start).num_seconds()),
            session.samples_count
        );
    }
}

fn cmd_config(config: &Config, paths: &Paths) {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!("Project root: {:?}", paths.root);
    println!("Images: {:?}", paths.images_dir);
    println!("Sessions: {:?}", paths.sessions_dir);
    println!("Static: {:?}", paths.static_dir);
    println!(
        "API key: {}",
        if config::api_key_from_env().is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(config).unwrap_or_else(|_| "Error".to_string())
    );
}

fn cmd_config_init(config: &Config) {
    match config.save() {
        Ok(path) => {
            println!("Configuration written to {}", path.display());
            println!();
        }
        Err(e) => {
            eprintln!("Error saving config: {e}");
            std::process::exit(1);
        }
    }
}

fn local_time(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}
