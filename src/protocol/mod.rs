//! Datagram protocol: framing, integrity checking and loss handling

pub mod checksum;
pub mod frame;
pub mod loss;

pub use checksum::Crc16;
pub use frame::{DrainPolicy, EncoderStats, FrameEncoder, FrameLayout, ParsedFrame, SequenceWidth};
pub use loss::{Classification, Concealment, LossTracker};
