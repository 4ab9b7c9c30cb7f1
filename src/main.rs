use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use follow_bot::config::{FollowBotConfig, LINK_BAUDRATE};
use follow_bot::controller::{LoggingDrivetrain, SimulatedRangeFinder};

#[derive(Parser)]
#[command(name = "follow-bot", about = "Follow a tracked subject without hitting anything")]
struct Cli {
    /// JSON file overriding the built-in tuning
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Forward intents from Zenoh to the controller's serial link
    Relay {
        /// Serial port to try before scanning (repeatable)
        #[arg(long)]
        port: Vec<String>,
        #[arg(long)]
        baud: Option<u32>,
    },
    /// Run the motion controller on a serial link (bench motors and sensor)
    Controller {
        #[arg(long)]
        port: String,
        #[arg(long, default_value_t = LINK_BAUDRATE)]
        baud: u32,
        /// Fixed simulated obstacle distance; omit for "no echo"
        #[arg(long)]
        sim_distance_cm: Option<f32>,
    },
    /// Turn vision frames into intents for the relay
    Follow,
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match &cli.config {
        Some(path) => {
            info!("Loading config from {}", path.display());
            FollowBotConfig::load(path)?
        }
        None => FollowBotConfig::default(),
    };

    match cli.command {
        Mode::Relay { port, baud } => {
            let mut relay = config.relay;
            if !port.is_empty() {
                relay.port_candidates = port;
            }
            if let Some(baud) = baud {
                relay.baudrate = baud;
            }
            follow_bot::relay::service::run(relay).await
        }
        Mode::Controller {
            port,
            baud,
            sim_distance_cm,
        } => {
            let controller = config.controller;
            tokio::task::spawn_blocking(move || {
                follow_bot::controller::runtime::run(
                    &port,
                    baud,
                    controller,
                    LoggingDrivetrain::new(),
                    SimulatedRangeFinder::new(sim_distance_cm),
                )
            })
            .await?
        }
        Mode::Follow => follow_bot::synthesizer::runtime::run(config.synthesizer).await,
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("follow-bot error: {}", e);
        std::process::exit(1);
    }
}
