//! VBAN streaming over UDP
//!
//! Alternate transport for receivers on a full network stack. The send ring
//! is drained in fixed packets once it holds at least the configured
//! threshold, and each packet goes out as one datagram to a single peer.
//! There is no completion clocking and no loss handling on this path.

use bytes::{BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::audio::ring::{Sample, SampleRing};
use crate::config::VbanConfig;
use crate::error::Result;

/// Header magic
pub const VBAN_MAGIC: [u8; 4] = *b"VBAN";

/// Fixed header size
pub const VBAN_HEADER_LEN: usize = 28;

/// Most samples a single VBAN packet may carry
pub const VBAN_MAX_SAMPLES: usize = 256;

const STREAM_NAME_LEN: usize = 16;

/// Data format code for 16-bit signed samples
const FORMAT_INT16: u8 = 0x01;

/// Sample rates addressable by the header's rate index
const SAMPLE_RATES: [u32; 21] = [
    6000, 12000, 24000, 48000, 96000, 192000, 384000, 8000, 16000, 32000, 64000, 128000, 256000,
    512000, 11025, 22050, 44100, 88200, 176400, 352800, 705600,
];

fn sample_rate_index(rate: u32) -> Option<u8> {
    SAMPLE_RATES.iter().position(|&r| r == rate).map(|i| i as u8)
}

/// Statistics for the VBAN sender
#[derive(Debug, Clone, Default)]
pub struct VbanStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
}

/// Fire-and-forget VBAN sender bound to one peer
pub struct VbanSender {
    socket: UdpSocket,
    peer: SocketAddr,
    header: [u8; VBAN_HEADER_LEN],
    samples_per_packet: usize,
    threshold: usize,
    frame_counter: u32,
    packet: BytesMut,
    stats: VbanStats,
}

impl VbanSender {
    /// Bind a local socket and connect it to the configured peer
    pub async fn connect(config: &VbanConfig, sample_rate: u32) -> Result<Self> {
        let rate_index = sample_rate_index(sample_rate).ok_or_else(|| {
            crate::Error::Config(format!("sample rate {} has no VBAN index", sample_rate))
        })?;
        if config.samples_per_packet == 0 || config.samples_per_packet > VBAN_MAX_SAMPLES {
            return Err(crate::Error::Config(format!(
                "VBAN packets carry 1..={} samples, got {}",
                VBAN_MAX_SAMPLES, config.samples_per_packet
            )));
        }

        let socket = UdpSocket::bind(config.bind_addr).await?;
        socket.connect(config.peer).await?;

        let mut header = [0u8; VBAN_HEADER_LEN];
        header[..4].copy_from_slice(&VBAN_MAGIC);
        header[4] = rate_index;
        header[5] = (config.samples_per_packet - 1) as u8;
        header[6] = 0; // mono
        header[7] = FORMAT_INT16;
        let name = config.stream_name.as_bytes();
        let name_len = name.len().min(STREAM_NAME_LEN);
        header[8..8 + name_len].copy_from_slice(&name[..name_len]);

        tracing::info!(
            "VBAN stream '{}' sending to {}",
            config.stream_name,
            config.peer
        );

        Ok(Self {
            socket,
            peer: config.peer,
            header,
            samples_per_packet: config.samples_per_packet,
            threshold: config.threshold.max(config.samples_per_packet),
            frame_counter: 0,
            packet: BytesMut::with_capacity(
                VBAN_HEADER_LEN + config.samples_per_packet * std::mem::size_of::<Sample>(),
            ),
            stats: VbanStats::default(),
        })
    }

    /// Build the next packet if the ring holds at least the threshold
    pub fn build_packet(&mut self, ring: &SampleRing) -> Option<Bytes> {
        if ring.len() < self.threshold {
            return None;
        }

        self.packet.clear();
        self.packet.put_slice(&self.header[..24]);
        self.packet.put_u32_le(self.frame_counter);
        self.frame_counter = self.frame_counter.wrapping_add(1);

        for _ in 0..self.samples_per_packet {
            // The threshold guarantees a full packet is buffered
            let sample = ring.read().unwrap_or(0);
            self.packet.put_i16_le(sample);
        }

        Some(self.packet.split().freeze())
    }

    /// Send every full packet currently buffered. Returns the packet count.
    pub async fn drain(&mut self, ring: &SampleRing) -> usize {
        let mut sent = 0;
        while let Some(packet) = self.build_packet(ring) {
            match self.socket.send(&packet).await {
                Ok(n) => {
                    self.stats.packets_sent += 1;
                    self.stats.bytes_sent += n as u64;
                    sent += 1;
                }
                Err(e) => {
                    self.stats.send_errors += 1;
                    tracing::error!("VBAN send to {} failed: {}", self.peer, e);
                    break;
                }
            }
        }
        sent
    }

    /// Reset the ring and drain it every `interval` until `shutdown` flips.
    pub async fn run(
        mut self,
        ring: std::sync::Arc<SampleRing>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> VbanStats {
        ring.reset();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain(&ring).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "VBAN sender stopped after {} packets ({} errors)",
            self.stats.packets_sent,
            self.stats.send_errors
        );
        self.stats
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn stats(&self) -> &VbanStats {
        &self.stats
    }
}
