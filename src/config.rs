//! Relay configuration
//!
//! Loaded from a TOML file with `[link]`, `[stream]`, `[telemetry]` and
//! `[vban]` sections. Every field has a default, so an empty file is valid.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::PeerAddress;
use crate::protocol::{DrainPolicy, FrameLayout, SequenceWidth};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub link: LinkConfig,
    pub stream: StreamConfig,
    pub telemetry: TelemetryConfig,
    pub vban: VbanConfig,
}

/// Link primitive and peer pairing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// This node's link address
    pub local_address: PeerAddress,
    /// Peer frames are sent to
    pub peer: PeerAddress,
    /// UDP endpoint of the peer when the link is emulated over IP
    pub peer_endpoint: Option<SocketAddr>,
    /// Local socket for the UDP-emulated link
    pub bind_addr: SocketAddr,
    /// Where broadcast frames go on the UDP-emulated link
    pub broadcast_endpoint: SocketAddr,
    pub radio_channel: u8,
    /// Bound on queued link events per role
    pub event_queue_depth: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            local_address: PeerAddress::new([0x02, 0, 0, 0, 0, 0x01]),
            peer: PeerAddress::BROADCAST,
            peer_endpoint: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_LINK_PORT)),
            broadcast_endpoint: SocketAddr::from(([255, 255, 255, 255], DEFAULT_LINK_PORT)),
            radio_channel: DEFAULT_RADIO_CHANNEL,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
        }
    }
}

/// Selectable capture source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceKind {
    /// Synthetic test tone
    Sine { frequency_hz: f32, amplitude: f32 },
    /// Raw interleaved 16-bit little-endian PCM on standard input
    Stdin,
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::Sine {
            frequency_hz: 440.0,
            amplitude: 0.5,
        }
    }
}

/// Behaviour when the send ring cannot fill a payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrainMode {
    /// Pad immediately with random filler
    Filler,
    /// Wait up to `drain_timeout_ms`, then pad
    #[default]
    Block,
}

/// Audio stream and framing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_rate: u32,
    /// Interleaved channels delivered by the capture source
    pub capture_channels: u16,
    /// Samples per frame payload
    pub payload_samples: usize,
    pub seq_width: SequenceWidth,
    pub send_ring_capacity: usize,
    pub playback_ring_capacity: usize,
    pub drain_mode: DrainMode,
    pub drain_timeout_ms: u64,
    /// Times each prepared frame is transmitted
    pub send_copies: u32,
    /// Capture and playback cadence
    pub tick_interval_ms: u64,
    /// Receiver lead time before the stream gate opens
    pub warmup_ms: u64,
    pub source: SourceKind,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            capture_channels: DEFAULT_CAPTURE_CHANNELS,
            payload_samples: DEFAULT_PAYLOAD_SAMPLES,
            seq_width: SequenceWidth::U32,
            send_ring_capacity: DEFAULT_RING_CAPACITY,
            playback_ring_capacity: DEFAULT_RING_CAPACITY,
            drain_mode: DrainMode::default(),
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
            send_copies: DEFAULT_SEND_COPIES,
            tick_interval_ms: DEFAULT_TICK_MS,
            warmup_ms: DEFAULT_WARMUP_MS,
            source: SourceKind::default(),
        }
    }
}

impl StreamConfig {
    pub fn layout(&self) -> Result<FrameLayout> {
        Ok(FrameLayout::new(self.seq_width, self.payload_samples)?)
    }

    pub fn drain_policy(&self) -> DrainPolicy {
        match self.drain_mode {
            DrainMode::Filler => DrainPolicy::Filler,
            DrainMode::Block => DrainPolicy::Block {
                timeout: Duration::from_millis(self.drain_timeout_ms),
            },
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    /// Sample frames delivered per capture tick
    pub fn frames_per_tick(&self) -> usize {
        ((self.sample_rate as u64 * self.tick_interval_ms) / 1000).max(1) as usize
    }
}

/// Periodic statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_TELEMETRY_INTERVAL_SECS,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// VBAN alternate transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VbanConfig {
    pub enabled: bool,
    pub peer: SocketAddr,
    pub bind_addr: SocketAddr,
    pub stream_name: String,
    /// Minimum buffered samples before a packet is drained
    pub threshold: usize,
    pub samples_per_packet: usize,
    pub poll_interval_ms: u64,
}

impl Default for VbanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            peer: SocketAddr::from(([127, 0, 0, 1], DEFAULT_VBAN_PORT)),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            stream_name: "Guitar".to_string(),
            threshold: DEFAULT_VBAN_THRESHOLD,
            samples_per_packet: DEFAULT_VBAN_PACKET_SAMPLES,
            poll_interval_ms: DEFAULT_TICK_MS,
        }
    }
}

impl AppConfig {
    /// Default config file: `<config_dir>/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "wireless-audio-relay", "wireless-audio-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load `path` if given, else the default config file if present, else
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(default) if default.exists() => Self::load(&default),
            _ => {
                tracing::info!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Write the config as TOML, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let stream = &self.stream;

        for (name, capacity) in [
            ("send_ring_capacity", stream.send_ring_capacity),
            ("playback_ring_capacity", stream.playback_ring_capacity),
        ] {
            if !capacity.is_power_of_two() {
                return Err(Error::Config(format!(
                    "{} must be a power of two, got {}",
                    name, capacity
                )));
            }
        }

        let layout = stream.layout()?;
        if layout.frame_len() > MAX_LINK_FRAME {
            return Err(Error::Config(format!(
                "frame of {} bytes exceeds the {} byte link limit",
                layout.frame_len(),
                MAX_LINK_FRAME
            )));
        }

        if stream.tick_interval_ms == 0 || self.telemetry.interval_secs == 0 {
            return Err(Error::Config("intervals must be non-zero".into()));
        }
        if stream.send_copies == 0 {
            return Err(Error::Config("send_copies must be at least 1".into()));
        }
        if stream.capture_channels == 0 {
            return Err(Error::Config("capture_channels must be at least 1".into()));
        }
        if self.link.event_queue_depth == 0 {
            return Err(Error::Config("event_queue_depth must be at least 1".into()));
        }

        if self.vban.enabled {
            if self.vban.threshold > stream.send_ring_capacity {
                return Err(Error::Config(format!(
                    "VBAN threshold {} exceeds send ring capacity {}",
                    self.vban.threshold, stream.send_ring_capacity
                )));
            }
            if self.vban.poll_interval_ms == 0 {
                return Err(Error::Config("intervals must be non-zero".into()));
            }
        }

        Ok(())
    }
}
