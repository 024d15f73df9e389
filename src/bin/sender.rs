//! Audio Sender Application
//!
//! Captures audio and streams it to the paired receiver, either over the
//! link emulated on UDP or as VBAN.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wireless_audio_relay::{
    audio::{build_source, create_shared_ring, CaptureTask},
    config::AppConfig,
    network::{Link, UdpLink, VbanSender},
    session::SenderSession,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting audio sender");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())?;
    config.validate()?;

    if config.vban.enabled {
        run_vban(&config).await
    } else {
        run_link(&config).await
    }
}

async fn run_link(config: &AppConfig) -> Result<()> {
    let udp = UdpLink::bind(&config.link)?;

    eprintln!("\n=== Link ===");
    eprintln!("  Local address: {} ({})", config.link.local_address, udp.local_addr()?);
    eprintln!("  Peer:          {}", config.link.peer);
    if let Some(endpoint) = config.link.peer_endpoint {
        eprintln!("  Peer endpoint: {}", endpoint);
    }
    eprintln!();

    let link: Arc<dyn Link> = udp;
    let session = SenderSession::start(link, config, build_source(&config.stream))?;
    tracing::info!("Streaming - press Ctrl+C to stop");

    let mut check = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
            _ = check.tick() => {
                if !session.is_running() {
                    tracing::error!("Send loop ended");
                    break;
                }
            }
        }
    }

    let stats = session.stats().clone();
    let exit = session.stop();
    tracing::info!(
        frames = stats.frames_prepared(),
        sends = stats.sends(),
        retries = stats.retries(),
        failed_completions = stats.failed_completions(),
        "Sender finished: {:?}",
        exit
    );
    Ok(())
}

async fn run_vban(config: &AppConfig) -> Result<()> {
    let ring = create_shared_ring(config.stream.send_ring_capacity)?;
    let sender = VbanSender::connect(&config.vban, config.stream.sample_rate).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(sender.run(
        ring.clone(),
        Duration::from_millis(config.vban.poll_interval_ms),
        shutdown_rx,
    ));

    let mut capture = CaptureTask::start(
        build_source(&config.stream),
        ring,
        config.stream.tick_interval(),
    )?;
    tracing::info!("Streaming VBAN to {} - press Ctrl+C to stop", config.vban.peer);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    let _ = shutdown_tx.send(true);
    let stats = task.await?;
    capture.stop();
    tracing::info!(
        packets = stats.packets_sent,
        bytes = stats.bytes_sent,
        errors = stats.send_errors,
        "VBAN sender finished"
    );
    Ok(())
}
