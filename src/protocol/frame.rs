//! Frame layout, building and verification
//!
//! Wire layout, all fields little-endian:
//!
//! ```text
//! +----------------+----------+------------------------------+
//! | sequence (2|4) | crc (2)  | payload: P x i16 samples     |
//! +----------------+----------+------------------------------+
//! ```
//!
//! The CRC covers the whole frame with the CRC field zeroed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::audio::ring::{Sample, SampleRing};
use crate::error::FrameError;
use crate::network::Channel;
use crate::protocol::checksum::{Crc16, SEED};

const CHECKSUM_LEN: usize = 2;
const SAMPLE_BYTES: usize = std::mem::size_of::<Sample>();

/// Width of the on-wire sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceWidth {
    U16,
    U32,
}

impl SequenceWidth {
    pub const fn bytes(self) -> usize {
        match self {
            SequenceWidth::U16 => 2,
            SequenceWidth::U32 => 4,
        }
    }

    /// Largest representable sequence number; arithmetic wraps past it.
    pub const fn mask(self) -> u32 {
        match self {
            SequenceWidth::U16 => u16::MAX as u32,
            SequenceWidth::U32 => u32::MAX,
        }
    }
}

/// Fixed frame geometry shared by sender and receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    seq_width: SequenceWidth,
    payload_samples: usize,
}

impl FrameLayout {
    /// The payload is split into two halves for concealment, so it must hold
    /// an even, non-zero number of samples.
    pub fn new(seq_width: SequenceWidth, payload_samples: usize) -> Result<Self, FrameError> {
        if payload_samples == 0 || payload_samples % 2 != 0 {
            return Err(FrameError::InvalidLayout(format!(
                "payload must be an even, non-zero sample count, got {}",
                payload_samples
            )));
        }
        Ok(Self {
            seq_width,
            payload_samples,
        })
    }

    pub const fn seq_width(&self) -> SequenceWidth {
        self.seq_width
    }

    pub const fn payload_samples(&self) -> usize {
        self.payload_samples
    }

    #[inline]
    const fn checksum_offset(&self) -> usize {
        self.seq_width.bytes()
    }

    #[inline]
    pub const fn header_len(&self) -> usize {
        self.seq_width.bytes() + CHECKSUM_LEN
    }

    /// Total frame size in bytes
    #[inline]
    pub const fn frame_len(&self) -> usize {
        self.header_len() + self.payload_samples * SAMPLE_BYTES
    }

    /// Verify and split a received frame.
    ///
    /// Nothing in the frame is trusted unless the checksum matches.
    pub fn parse<'a>(&self, bytes: &'a [u8]) -> Result<ParsedFrame<'a>, FrameError> {
        if bytes.len() < self.frame_len() {
            return Err(FrameError::TooShort {
                len: bytes.len(),
                expected: self.frame_len(),
            });
        }

        let crc_at = self.checksum_offset();
        let stored = u16::from_le_bytes([bytes[crc_at], bytes[crc_at + 1]]);
        let computed = Crc16::new(SEED)
            .update(&bytes[..crc_at])
            .update(&[0; CHECKSUM_LEN])
            .update(&bytes[crc_at + CHECKSUM_LEN..])
            .finish();

        if stored != computed {
            return Err(FrameError::ChecksumMismatch { stored, computed });
        }

        let sequence = match self.seq_width {
            SequenceWidth::U16 => u32::from(u16::from_le_bytes([bytes[0], bytes[1]])),
            SequenceWidth::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        };

        Ok(ParsedFrame {
            sequence,
            payload: &bytes[self.header_len()..self.frame_len()],
        })
    }
}

/// A verified frame borrowing the receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFrame<'a> {
    pub sequence: u32,
    payload: &'a [u8],
}

impl<'a> ParsedFrame<'a> {
    /// Raw payload bytes
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn sample_count(&self) -> usize {
        self.payload.len() / SAMPLE_BYTES
    }

    /// Payload samples in order
    pub fn samples(&self) -> impl Iterator<Item = Sample> + 'a {
        self.payload
            .chunks_exact(SAMPLE_BYTES)
            .map(|b| Sample::from_le_bytes([b[0], b[1]]))
    }

    /// Decode the first `n` samples into `out`, replacing its contents
    pub fn decode_into(&self, n: usize, out: &mut Vec<Sample>) {
        out.clear();
        out.extend(self.samples().take(n));
    }
}

/// What to do when the send ring holds fewer than a payload's worth of samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPolicy {
    /// Fill the shortfall with random filler; for keepalive frames
    Filler,
    /// Wait up to `timeout` for enough samples, then fall back to filler
    Block { timeout: Duration },
}

/// Builds outgoing frames from the send ring.
///
/// Holds one frame buffer so the last frame can be re-sent unchanged.
pub struct FrameEncoder {
    layout: FrameLayout,
    buffer: Vec<u8>,
    /// Next sequence number per channel
    sequences: [u32; 2],
    rng: StdRng,
    frames_built: u64,
    filler_samples: u64,
    drain_timeouts: u64,
}

impl FrameEncoder {
    pub fn new(layout: FrameLayout) -> Self {
        Self {
            layout,
            buffer: vec![0; layout.frame_len()],
            sequences: [0; 2],
            rng: StdRng::from_entropy(),
            frames_built: 0,
            filler_samples: 0,
            drain_timeouts: 0,
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Sequence number the next frame on `channel` will carry
    pub fn next_sequence(&self, channel: Channel) -> u32 {
        self.sequences[channel.index()]
    }

    /// Build the next frame for `channel`, draining exactly one payload
    /// from `ring`. Returns the frame's sequence number; the bytes are
    /// available from [`frame`](Self::frame) until the next call.
    pub fn prepare(&mut self, channel: Channel, ring: &SampleRing, policy: DrainPolicy) -> u32 {
        let seq = self.sequences[channel.index()];
        self.sequences[channel.index()] = seq.wrapping_add(1) & self.layout.seq_width.mask();

        let width = self.layout.seq_width.bytes();
        self.buffer[..width].copy_from_slice(&seq.to_le_bytes()[..width]);

        if let DrainPolicy::Block { timeout } = policy {
            if !ring.wait_for(self.layout.payload_samples, timeout) {
                self.drain_timeouts += 1;
                tracing::trace!(
                    buffered = ring.len(),
                    "Send ring drain timed out, padding with filler"
                );
            }
        }

        let header_len = self.layout.header_len();
        for slot in self.buffer[header_len..].chunks_exact_mut(SAMPLE_BYTES) {
            let sample = match ring.read() {
                Ok(sample) => sample,
                Err(_) => {
                    self.filler_samples += 1;
                    self.rng.gen::<Sample>()
                }
            };
            slot.copy_from_slice(&sample.to_le_bytes());
        }

        let crc_at = self.layout.checksum_offset();
        self.buffer[crc_at..crc_at + CHECKSUM_LEN].fill(0);
        let crc = Crc16::new(SEED).update(&self.buffer).finish();
        self.buffer[crc_at..crc_at + CHECKSUM_LEN].copy_from_slice(&crc.to_le_bytes());

        self.frames_built += 1;
        seq
    }

    /// Bytes of the most recently prepared frame
    pub fn frame(&self) -> &[u8] {
        &self.buffer
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_built: self.frames_built,
            filler_samples: self.filler_samples,
            drain_timeouts: self.drain_timeouts,
        }
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    pub frames_built: u64,
    pub filler_samples: u64,
    pub drain_timeouts: u64,
}
