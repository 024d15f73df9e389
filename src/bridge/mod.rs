//! Event-driven bridge between the link and the sample rings
//!
//! Link callbacks feed an [`EventQueue`] per role through an
//! [`EventRouter`]. The sender role runs a [`SendLoop`] clocked by send
//! completions; the receiver role runs a [`ReceiveLoop`] that parses,
//! classifies and admits frames to the playback ring behind a
//! [`StreamGate`].

pub mod gate;
pub mod queue;
pub mod receiver;
pub mod sender;

pub use gate::{StreamGate, StreamState};
pub use queue::{BridgeEvent, EventQueue, EventRouter, FramePool, PooledBuffer};
pub use receiver::{ReceiveLoop, ReceiverStats};
pub use sender::{SendLoop, SenderExit, SenderStats};
