//! Link-layer primitive: opaque frames to and from a peer address
//!
//! The radio (or its emulation) calls back into a [`LinkHandler`] when a send
//! completes or a frame arrives. Those callbacks run in a driver context and
//! must only copy and enqueue.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::LinkError;

/// Length of a link-layer hardware address
pub const ADDRESS_LEN: usize = 6;

/// Link-layer peer identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerAddress([u8; ADDRESS_LEN]);

impl PeerAddress {
    /// Reserved address reaching every listening node
    pub const BROADCAST: PeerAddress = PeerAddress([0xFF; ADDRESS_LEN]);

    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn octets(&self) -> [u8; ADDRESS_LEN] {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Logical channel a frame sent to this address travels on
    pub fn channel(&self) -> Channel {
        if self.is_broadcast() {
            Channel::Broadcast
        } else {
            Channel::Unicast
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self)
    }
}

impl FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; ADDRESS_LEN];
        let mut parts = s.split(|c| c == ':' || c == '-');

        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("Invalid peer address: {}", s))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("Invalid peer address: {}", s))?;
        }
        if parts.next().is_some() {
            return Err(format!("Invalid peer address: {}", s));
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for PeerAddress {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PeerAddress> for String {
    fn from(addr: PeerAddress) -> Self {
        addr.to_string()
    }
}

/// Logical sequence-number channel, chosen by the destination address class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Broadcast,
    Unicast,
}

impl Channel {
    pub const fn index(self) -> usize {
        match self {
            Channel::Broadcast => 0,
            Channel::Unicast => 1,
        }
    }
}

/// Outcome reported by the link once a send has left the radio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failed,
}

/// Attributes recorded when pairing a peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerAttributes {
    /// Radio channel the peer listens on
    pub radio_channel: u8,
    pub encrypt: bool,
    /// Transport endpoint, for links emulated over IP
    pub endpoint: Option<SocketAddr>,
}

/// Callbacks invoked by the link driver
pub trait LinkHandler: Send + Sync {
    fn on_send_complete(&self, peer: PeerAddress, status: SendStatus);

    /// `channel` is the class of the address the frame was sent to.
    fn on_receive(&self, peer: PeerAddress, channel: Channel, bytes: &[u8]);
}

/// Identifies a registered handler for later removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Send/receive primitive for opaque frames
pub trait Link: Send + Sync {
    /// This node's own address
    fn local_address(&self) -> PeerAddress;

    /// Queue `bytes` for transmission. Completion is reported asynchronously
    /// through [`LinkHandler::on_send_complete`].
    fn send(&self, peer: &PeerAddress, bytes: &[u8]) -> Result<(), LinkError>;

    fn register_handler(&self, handler: Arc<dyn LinkHandler>) -> HandlerId;

    fn unregister_handler(&self, id: HandlerId);

    fn is_peer_known(&self, peer: &PeerAddress) -> bool;

    fn add_peer(&self, peer: PeerAddress, attrs: PeerAttributes) -> Result<(), LinkError>;

    fn remove_peer(&self, peer: &PeerAddress) -> Result<(), LinkError>;
}

/// Registered handlers of one link; every callback fans out to all of them.
#[derive(Default)]
pub struct HandlerSet {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(HandlerId, Arc<dyn LinkHandler>)>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn LinkHandler>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        id
    }

    pub fn unregister(&self, id: HandlerId) {
        self.handlers.write().retain(|(h, _)| *h != id);
    }

    pub fn send_complete(&self, peer: PeerAddress, status: SendStatus) {
        for (_, handler) in self.handlers.read().iter() {
            handler.on_send_complete(peer, status);
        }
    }

    pub fn receive(&self, peer: PeerAddress, channel: Channel, bytes: &[u8]) {
        for (_, handler) in self.handlers.read().iter() {
            handler.on_receive(peer, channel, bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: PeerAddress = "7c:df:a1:01:6b:20".parse().unwrap();
        assert_eq!(addr.octets(), [0x7c, 0xdf, 0xa1, 0x01, 0x6b, 0x20]);
        assert_eq!(addr.to_string(), "7c:df:a1:01:6b:20");
        assert_eq!("7C-DF-A1-01-6B-20".parse::<PeerAddress>().unwrap(), addr);

        assert!("7c:df:a1:01:6b".parse::<PeerAddress>().is_err());
        assert!("7c:df:a1:01:6b:20:00".parse::<PeerAddress>().is_err());
        assert!("zz:df:a1:01:6b:20".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_broadcast_channel() {
        assert!(PeerAddress::BROADCAST.is_broadcast());
        assert_eq!(PeerAddress::BROADCAST.channel(), Channel::Broadcast);
        assert_eq!(PeerAddress::new([1; 6]).channel(), Channel::Unicast);
        assert_eq!(
            "ff:ff:ff:ff:ff:ff".parse::<PeerAddress>().unwrap(),
            PeerAddress::BROADCAST
        );
    }

    struct Count(AtomicU64);

    impl LinkHandler for Count {
        fn on_send_complete(&self, _peer: PeerAddress, _status: SendStatus) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }

        fn on_receive(&self, _peer: PeerAddress, _channel: Channel, _bytes: &[u8]) {}
    }

    #[test]
    fn test_handler_set_register_unregister() {
        let set = HandlerSet::new();
        let a = Arc::new(Count(AtomicU64::new(0)));
        let b = Arc::new(Count(AtomicU64::new(0)));

        let id_a = set.register(a.clone());
        set.register(b.clone());
        set.send_complete(PeerAddress::BROADCAST, SendStatus::Success);

        set.unregister(id_a);
        set.send_complete(PeerAddress::BROADCAST, SendStatus::Success);

        assert_eq!(a.0.load(Ordering::Relaxed), 1);
        assert_eq!(b.0.load(Ordering::Relaxed), 2);
        assert_eq!(set.handlers.read().len(), 1);
    }
}
