//! Audio Receiver Application
//!
//! Receives the stream over the link emulated on UDP and writes raw 16-bit
//! mono PCM to standard output.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wireless_audio_relay::{
    audio::RawPcmSink,
    config::AppConfig,
    network::{Link, UdpLink},
    session::ReceiverSession,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries audio
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting audio receiver");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load_or_default(config_path.as_deref())?;
    config.validate()?;

    let udp = UdpLink::bind(&config.link)?;

    eprintln!("\n=== Link ===");
    eprintln!("  Local address: {} ({})", config.link.local_address, udp.local_addr()?);
    eprintln!("  Peer:          {}", config.link.peer);
    eprintln!();

    let link: Arc<dyn Link> = udp;
    let session = ReceiverSession::start(
        link,
        &config,
        Box::new(RawPcmSink::new(std::io::stdout())),
    )?;

    // Frames are tracked but not admitted to the playback ring until warmup ends
    tokio::time::sleep(config.stream.warmup()).await;
    session.gate().activate();
    tracing::info!("Receiving - press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    let stats = session.stats().clone();
    let underruns = session.underruns();
    let samples_played = session.samples_played();
    session.stop();
    tracing::info!(
        frames = stats.frames_received(),
        missed = stats.missed_packet_count(),
        parse_errors = stats.parse_errors(),
        underruns,
        samples_played,
        "Receiver finished"
    );
    Ok(())
}
