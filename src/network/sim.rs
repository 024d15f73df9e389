//! In-memory link medium
//!
//! Connects any number of [`SimLink`] nodes. Delivery happens inside `send`,
//! followed by the send-completion callback, so tests run deterministically
//! without a radio. A drop filter and injected send errors model a lossy
//! medium and a congested driver.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::LinkError;
use crate::network::link::{
    HandlerId, HandlerSet, Link, LinkHandler, PeerAddress, PeerAttributes, SendStatus,
};

/// Decides whether a frame in flight is lost: `(from, to, bytes) -> drop?`
pub type DropFilter = Box<dyn Fn(&PeerAddress, &PeerAddress, &[u8]) -> bool + Send + Sync>;

/// Shared medium all simulated nodes transmit on
#[derive(Default)]
pub struct SimMedium {
    nodes: DashMap<PeerAddress, Arc<HandlerSet>>,
    filter: RwLock<Option<DropFilter>>,
    pending_errors: AtomicU32,
    fatal_errors: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl SimMedium {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node with the given address
    pub fn attach(self: &Arc<Self>, address: PeerAddress) -> Arc<SimLink> {
        let handlers = Arc::new(HandlerSet::new());
        self.nodes.insert(address, handlers.clone());
        Arc::new(SimLink {
            address,
            medium: self.clone(),
            handlers,
            peers: DashMap::new(),
        })
    }

    /// Install a filter deciding which frames are lost in flight
    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.filter.write() = Some(filter);
    }

    /// Fail the next `count` sends. Transient failures report
    /// [`LinkError::NoBufferSpace`]; otherwise the failure is fatal.
    pub fn inject_send_errors(&self, count: u32, transient: bool) {
        self.fatal_errors.store(!transient, Ordering::SeqCst);
        self.pending_errors.store(count, Ordering::SeqCst);
    }

    /// Frames handed to a receiving node
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Frames removed by the drop filter
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn take_injected_error(&self) -> Option<LinkError> {
        self.pending_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| {
                if self.fatal_errors.load(Ordering::SeqCst) {
                    LinkError::SendFailed("injected driver failure".into())
                } else {
                    LinkError::NoBufferSpace
                }
            })
    }

    /// Deliver one frame; returns whether any node received it.
    fn transmit(&self, from: PeerAddress, to: PeerAddress, bytes: &[u8]) -> bool {
        let targets: Vec<(PeerAddress, Arc<HandlerSet>)> = self
            .nodes
            .iter()
            .filter(|node| *node.key() != from && (to.is_broadcast() || *node.key() == to))
            .map(|node| (*node.key(), node.value().clone()))
            .collect();

        let mut any = false;
        for (addr, handlers) in targets {
            let lost = self
                .filter
                .read()
                .as_ref()
                .is_some_and(|filter| filter(&from, &addr, bytes));
            if lost {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            handlers.receive(from, to.channel(), bytes);
            self.delivered.fetch_add(1, Ordering::Relaxed);
            any = true;
        }
        any
    }
}

/// One node on a [`SimMedium`]
pub struct SimLink {
    address: PeerAddress,
    medium: Arc<SimMedium>,
    handlers: Arc<HandlerSet>,
    peers: DashMap<PeerAddress, PeerAttributes>,
}

impl Link for SimLink {
    fn local_address(&self) -> PeerAddress {
        self.address
    }

    fn send(&self, peer: &PeerAddress, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.is_peer_known(peer) {
            return Err(LinkError::UnknownPeer(*peer));
        }
        if let Some(err) = self.medium.take_injected_error() {
            return Err(err);
        }

        let reached = self.medium.transmit(self.address, *peer, bytes);

        // Unicast completions report whether the peer acknowledged; broadcast
        // has no acknowledgement and always succeeds.
        let status = if reached || peer.is_broadcast() {
            SendStatus::Success
        } else {
            SendStatus::Failed
        };
        self.handlers.send_complete(*peer, status);
        Ok(())
    }

    fn register_handler(&self, handler: Arc<dyn LinkHandler>) -> HandlerId {
        self.handlers.register(handler)
    }

    fn unregister_handler(&self, id: HandlerId) {
        self.handlers.unregister(id);
    }

    fn is_peer_known(&self, peer: &PeerAddress) -> bool {
        self.peers.contains_key(peer)
    }

    fn add_peer(&self, peer: PeerAddress, attrs: PeerAttributes) -> Result<(), LinkError> {
        self.peers.insert(peer, attrs);
        Ok(())
    }

    fn remove_peer(&self, peer: &PeerAddress) -> Result<(), LinkError> {
        self.peers.remove(peer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::link::Channel;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        received: Mutex<Vec<(PeerAddress, Channel, Vec<u8>)>>,
        completed: Mutex<Vec<SendStatus>>,
    }

    impl LinkHandler for Recorder {
        fn on_send_complete(&self, _peer: PeerAddress, status: SendStatus) {
            self.completed.lock().push(status);
        }

        fn on_receive(&self, peer: PeerAddress, channel: Channel, bytes: &[u8]) {
            self.received.lock().push((peer, channel, bytes.to_vec()));
        }
    }

    const A: PeerAddress = PeerAddress::new([0xA; 6]);
    const B: PeerAddress = PeerAddress::new([0xB; 6]);

    #[test]
    fn test_unicast_delivery_and_completion() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        let b = medium.attach(B);

        let rx = Arc::new(Recorder::default());
        let tx = Arc::new(Recorder::default());
        b.register_handler(rx.clone());
        a.register_handler(tx.clone());

        assert!(matches!(a.send(&B, b"hi"), Err(LinkError::UnknownPeer(_))));

        a.add_peer(B, PeerAttributes::default()).unwrap();
        a.send(&B, b"hi").unwrap();

        assert_eq!(
            rx.received.lock().as_slice(),
            &[(A, Channel::Unicast, b"hi".to_vec())]
        );
        assert_eq!(tx.completed.lock().as_slice(), &[SendStatus::Success]);
    }

    #[test]
    fn test_broadcast_reaches_all_but_sender() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        let b = medium.attach(B);
        let c = medium.attach(PeerAddress::new([0xC; 6]));

        let rx_a = Arc::new(Recorder::default());
        let rx_b = Arc::new(Recorder::default());
        let rx_c = Arc::new(Recorder::default());
        a.register_handler(rx_a.clone());
        b.register_handler(rx_b.clone());
        c.register_handler(rx_c.clone());

        a.add_peer(PeerAddress::BROADCAST, PeerAttributes::default()).unwrap();
        a.send(&PeerAddress::BROADCAST, b"all").unwrap();

        assert!(rx_a.received.lock().is_empty());
        assert_eq!(rx_b.received.lock()[0].1, Channel::Broadcast);
        assert_eq!(rx_c.received.lock().len(), 1);
        assert_eq!(medium.delivered(), 2);
    }

    #[test]
    fn test_drop_filter_and_failed_status() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        let b = medium.attach(B);

        let rx = Arc::new(Recorder::default());
        let tx = Arc::new(Recorder::default());
        b.register_handler(rx.clone());
        a.register_handler(tx.clone());
        a.add_peer(B, PeerAttributes::default()).unwrap();

        medium.set_drop_filter(Box::new(|_, _, bytes| bytes[0] == 0));
        a.send(&B, &[0]).unwrap();
        a.send(&B, &[1]).unwrap();

        assert_eq!(rx.received.lock().len(), 1);
        assert_eq!(
            tx.completed.lock().as_slice(),
            &[SendStatus::Failed, SendStatus::Success]
        );
        assert_eq!(medium.dropped(), 1);
    }

    #[test]
    fn test_injected_errors() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        a.add_peer(B, PeerAttributes::default()).unwrap();

        medium.inject_send_errors(2, true);
        assert!(matches!(a.send(&B, &[0]), Err(LinkError::NoBufferSpace)));
        assert!(matches!(a.send(&B, &[0]), Err(LinkError::NoBufferSpace)));
        assert!(a.send(&B, &[0]).is_ok());

        medium.inject_send_errors(1, false);
        assert!(matches!(a.send(&B, &[0]), Err(LinkError::SendFailed(_))));
    }
}
