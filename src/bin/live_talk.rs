//! CLI binary for rohana-live.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rohana_live::audio::capture::CpalCapture;
use rohana_live::audio::playback::CpalPlayback;
use rohana_live::audio::CpalBackend;
use rohana_live::{GeminiLiveService, LiveConfig, SessionController, Status};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Rohana Live: talk to a hosted speech model in real time.
#[derive(Parser)]
#[command(name = "rohana-live", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start a voice conversation.
    Talk,

    /// List available audio devices.
    Devices,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so status lines on stdout stay readable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("rohana_live=info,tungstenite=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Talk) {
        Command::Talk => run_talk(config).await,
        Command::Devices => list_devices(),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<LiveConfig> {
    if let Some(path) = path {
        return Ok(LiveConfig::from_file(path)?);
    }
    let default_path = LiveConfig::default_config_path();
    if default_path.is_file() {
        info!("loading config from {}", default_path.display());
        return Ok(LiveConfig::from_file(&default_path)?);
    }
    Ok(LiveConfig::default())
}

async fn run_talk(config: LiveConfig) -> anyhow::Result<()> {
    println!("Rohana Live v{}", env!("CARGO_PKG_VERSION"));

    // Fail before touching the microphone when no key is configured.
    config.service.api_key()?;

    let audio = Arc::new(CpalBackend::new(config.audio.clone()));
    let voice = Arc::new(GeminiLiveService::new(config.service.clone()));
    let controller = SessionController::spawn(config, audio, voice);
    let mut status = controller.subscribe();

    controller.open();
    println!("Press Ctrl+C to stop.\n");

    let mut failed = false;
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = status.borrow_and_update().clone();
                println!("{}", snapshot.label());
                if snapshot.status == Status::Error {
                    failed = true;
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    info!("received Ctrl+C, closing session...");
                }
                break;
            }
        }
    }

    controller.shutdown().await;
    if failed {
        anyhow::bail!("voice session ended with an error");
    }
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    println!("Input devices:");
    for name in CpalCapture::list_input_devices()? {
        println!("  - {name}");
    }

    println!("\nOutput devices:");
    for name in CpalPlayback::list_output_devices()? {
        println!("  - {name}");
    }

    Ok(())
}
