//! AutoDeck client core - backend session and process log capture
//!
//! Thin CLI over the library: hold a session open against a local backend,
//! or tail a spawned command through the capture pipeline.

use anyhow::Result;
use autodeck::{
    capture::{CaptureController, StreamSource},
    config::AutoDeckConfig,
    session::{SessionManager, SubscribeConfig, Subscriber},
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Stdio;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "autodeck")]
#[command(version)]
#[command(about = "AutoDeck client core - backend session and process log capture")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AUTODECK_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the backend and print incoming messages
    Connect {
        /// Backend host
        #[arg(long)]
        host: Option<String>,

        /// Backend port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Spawn a command and stream its output through the capture pipeline
    Tail {
        /// Command to run
        command: String,

        /// Arguments to the command
        args: Vec<String>,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("autodeck={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = if let Some(config_path) = cli.config {
        let content = std::fs::read_to_string(&config_path)?;
        toml::from_str(&content)?
    } else {
        AutoDeckConfig::default()
    };

    match cli.command {
        Commands::Connect { host, port } => {
            run_connect(config, host, port).await?;
        }
        Commands::Tail { command, args } => {
            run_tail(config, command, args).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

async fn run_connect(
    mut config: AutoDeckConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.session.host = host;
    }
    if let Some(port) = port {
        config.session.port = port;
    }

    tracing::info!(url = %config.session.endpoint_url(), "Connecting to backend");
    let manager = SessionManager::new(config.session);

    let handlers = Subscriber::new()
        .with_status_change(|status| {
            tracing::info!(%status, "Session status changed");
        })
        .with_message(|envelope| {
            println!(
                "[{}] {}",
                envelope.kind,
                envelope
                    .data
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default()
            );
        });
    manager
        .connect_with(SubscribeConfig {
            task_id: "cli".to_string(),
            handlers,
        })
        .await;

    tracing::info!("Session running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    Ok(())
}

async fn run_tail(config: AutoDeckConfig, command: String, args: Vec<String>) -> Result<()> {
    let child = tokio::process::Command::new(&command)
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let controller = CaptureController::new(config.capture);
    controller
        .set_line_callback(|line, source| match source {
            StreamSource::Stdout => println!("{}", line),
            StreamSource::Stderr => eprintln!("{}", line),
        })
        .await;
    controller
        .set_status_callback(|active| {
            tracing::info!(active, "Capture status changed");
        })
        .await;

    if !controller.start_capture(child).await {
        anyhow::bail!("capture already running");
    }

    tracing::info!(%command, "Tailing command output. Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = wait_until_stopped(&controller) => {}
    }
    controller.stop_capture().await;

    let stats = controller.stats().await;
    tracing::info!(
        lines = stats.lines_emitted,
        stdout_bytes = stats.stdout.total_bytes_received,
        stderr_bytes = stats.stderr.total_bytes_received,
        "Capture finished"
    );

    Ok(())
}

async fn wait_until_stopped(controller: &CaptureController) {
    while controller.is_capturing() {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}

fn show_config(config: Option<&AutoDeckConfig>) -> Result<()> {
    let default_config = AutoDeckConfig::default();
    let config = config.unwrap_or(&default_config);
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
