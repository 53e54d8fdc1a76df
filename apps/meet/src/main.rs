mod cli;
mod telemetry;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use meet_signaling::engine::rtc::RtcEngineFactory;
use meet_signaling::{Config, RoomClient, SessionCoordinator, SessionOutcome};
use rand::Rng;
use tracing::{debug, info};

use cli::Cli;
use telemetry::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("initializing logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let mut config = Config::from_env();
    if let Some(server) = cli.server {
        config = config.with_room_server(server);
    }
    let room = RoomClient::from_config(&config).context("invalid room server")?;
    let room_id = cli.room.unwrap_or_else(random_room_id);

    eprintln!("joining room {room_id} on {}", room.base_url());
    info!(room_id = %room_id, server = %room.base_url(), "starting session");

    let coordinator =
        SessionCoordinator::new(room, Arc::new(RtcEngineFactory), config.negotiation);
    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let summary = coordinator
        .run(&room_id, shutdown)
        .await
        .with_context(|| format!("session in room {room_id} failed"))?;

    let reason = match summary.outcome {
        SessionOutcome::RemoteClosed => "peer left",
        SessionOutcome::Disconnected => "connection lost",
        SessionOutcome::LocalShutdown => "interrupted",
    };
    eprintln!(
        "session ended ({reason}); joined as {} client {}, media {}",
        summary.role,
        summary.client_id,
        if summary.connected {
            "connected"
        } else {
            "never connected"
        }
    );
    Ok(())
}

fn random_room_id() -> String {
    format!("meet-{}", rand::thread_rng().gen_range(0..1000))
}
