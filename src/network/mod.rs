//! Link layer and transports
//!
//! [`Link`] is the radio primitive the bridge runs on. [`SimLink`] and
//! [`UdpLink`] provide it in-process and over IP; [`vban`] is an unclocked
//! alternative for receivers on a full network stack.

pub mod link;
pub mod sim;
pub mod udp;
pub mod vban;

pub use link::{
    Channel, HandlerId, HandlerSet, Link, LinkHandler, PeerAddress, PeerAttributes, SendStatus,
};
pub use sim::{DropFilter, SimLink, SimMedium};
pub use udp::{create_socket, UdpLink};
pub use vban::{VbanSender, VbanStats};
