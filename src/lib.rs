//! # Wireless Audio Relay
//!
//! Low-latency instrument audio over a lossy, connectionless link.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── SENDER ────────────────────────────────┐
//! │  ┌──────────────┐  1 ms tick  ┌──────────────┐                          │
//! │  │ SampleSource │ ──────────► │ CaptureTask  │  down-mix to mono        │
//! │  └──────────────┘             └──────┬───────┘                          │
//! │                                      ▼                                  │
//! │                             ┌─────────────────┐                         │
//! │                             │ SampleRing (TX) │                         │
//! │                             └────────┬────────┘                         │
//! │                                      ▼                                  │
//! │  ┌─────────────┐ SendComplete ┌─────────────┐  prepare: seq|crc|P x i16 │
//! │  │ EventQueue  │ ───────────► │  SendLoop   │ ──► Link::send (x2)       │
//! │  └─────────────┘              └─────────────┘                           │
//! └──────────────────────────────────────┬──────────────────────────────────┘
//!                                        │ lossy link (radio, UDP, sim)
//!                                        ▼
//! ┌─────────────────────────────── RECEIVER ───────────────────────────────┐
//! │  ┌─────────────┐   Received   ┌─────────────┐                           │
//! │  │ EventQueue  │ ───────────► │ ReceiveLoop │ parse ─► LossTracker      │
//! │  └─────────────┘              └──────┬──────┘        ─► Concealment     │
//! │                                      ▼                                  │
//! │                             ┌─────────────────┐                         │
//! │                             │   StreamGate    │  inactive: discard      │
//! │                             └────────┬────────┘                         │
//! │                                      ▼                                  │
//! │                             ┌─────────────────┐    ┌──────────────┐     │
//! │                             │ SampleRing (RX) │ ─► │ PlaybackTask │     │
//! │                             └─────────────────┘    └──────────────┘     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The sender never runs on a timer: each send is issued from the previous
//! send's completion, so the link's throughput sets the pace. The VBAN
//! transport in [`network::vban`] is the exception, draining the send ring
//! by occupancy instead.

pub mod audio;
pub mod bridge;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod telemetry;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for capture and playback
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Interleaved channels delivered by the capture peripheral
    pub const DEFAULT_CAPTURE_CHANNELS: u16 = 2;

    /// Samples per frame payload
    pub const DEFAULT_PAYLOAD_SAMPLES: usize = 48;

    /// Largest frame the link primitive carries
    pub const MAX_LINK_FRAME: usize = 250;

    /// Queued link events per role
    pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 12;

    /// Sample ring capacity (must be a power of 2)
    pub const DEFAULT_RING_CAPACITY: usize = 1024;

    /// Transmissions of each prepared frame
    pub const DEFAULT_SEND_COPIES: u32 = 2;

    /// Capture and playback tick in milliseconds
    pub const DEFAULT_TICK_MS: u64 = 1;

    /// Bound on waiting for a full payload before padding with filler
    pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 20;

    /// Receiver lead time before playback admission starts
    pub const DEFAULT_WARMUP_MS: u64 = 100;

    pub const DEFAULT_TELEMETRY_INTERVAL_SECS: u64 = 10;

    pub const DEFAULT_RADIO_CHANNEL: u8 = 8;

    /// UDP port of the emulated link
    pub const DEFAULT_LINK_PORT: u16 = 6970;

    pub const DEFAULT_VBAN_PORT: u16 = 6980;

    /// Buffered samples required before a VBAN packet is drained
    pub const DEFAULT_VBAN_THRESHOLD: usize = 256;

    /// Mono samples carried by each VBAN packet
    pub const DEFAULT_VBAN_PACKET_SAMPLES: usize = 256;
}
