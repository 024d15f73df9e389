//! Link primitive emulated over UDP datagrams
//!
//! Lets two hosts without the wireless primitive run the same protocol.
//! Every datagram carries a small envelope standing in for the radio's own
//! addressing:
//!
//! ```text
//! +-------------+------------------+----------------+
//! | source (6)  | destination (6)  | frame bytes    |
//! +-------------+------------------+----------------+
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::network::link::{
    HandlerId, HandlerSet, Link, LinkHandler, PeerAddress, PeerAttributes, SendStatus,
    ADDRESS_LEN,
};

const ENVELOPE_LEN: usize = ADDRESS_LEN * 2;

/// Largest datagram accepted by the receive thread
const MAX_DATAGRAM: usize = 1500;

/// How often the receive thread checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Link primitive over a UDP socket
pub struct UdpLink {
    address: PeerAddress,
    socket: UdpSocket,
    broadcast_endpoint: SocketAddr,
    handlers: Arc<HandlerSet>,
    peers: DashMap<PeerAddress, PeerAttributes>,
    scratch: Mutex<Vec<u8>>,
    running: Arc<AtomicBool>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UdpLink {
    /// Bind the socket and start the receive thread
    pub fn bind(config: &LinkConfig) -> Result<Arc<Self>, LinkError> {
        let socket = create_socket(config.bind_addr)?;
        let handlers = Arc::new(HandlerSet::new());
        let running = Arc::new(AtomicBool::new(true));

        let link = Arc::new(Self {
            address: config.local_address,
            socket: socket.try_clone()?,
            broadcast_endpoint: config.broadcast_endpoint,
            handlers: handlers.clone(),
            peers: DashMap::new(),
            scratch: Mutex::new(Vec::with_capacity(MAX_DATAGRAM)),
            running: running.clone(),
            thread_handle: Mutex::new(None),
        });

        let local = config.local_address;
        let handle = thread::Builder::new()
            .name("udp-link-rx".into())
            .spawn(move || receive_loop(socket, local, handlers, running))?;
        *link.thread_handle.lock() = Some(handle);

        tracing::info!(
            "UDP link {} bound to {}",
            config.local_address,
            link.socket.local_addr()?
        );
        Ok(link)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stop the receive thread
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.lock().take() {
            let _ = handle.join();
        }
    }

    fn endpoint_of(&self, peer: &PeerAddress) -> Result<SocketAddr, LinkError> {
        let attrs = self.peers.get(peer).ok_or(LinkError::UnknownPeer(*peer))?;
        match attrs.endpoint {
            Some(endpoint) => Ok(endpoint),
            None if peer.is_broadcast() => Ok(self.broadcast_endpoint),
            None => Err(LinkError::SendFailed(format!(
                "peer {} has no UDP endpoint",
                peer
            ))),
        }
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.close();
    }
}

impl Link for UdpLink {
    fn local_address(&self) -> PeerAddress {
        self.address
    }

    fn send(&self, peer: &PeerAddress, bytes: &[u8]) -> Result<(), LinkError> {
        let endpoint = self.endpoint_of(peer)?;

        let result = {
            let mut datagram = self.scratch.lock();
            datagram.clear();
            datagram.extend_from_slice(&self.address.octets());
            datagram.extend_from_slice(&peer.octets());
            datagram.extend_from_slice(bytes);
            self.socket.send_to(&datagram, endpoint)
        };

        match result {
            Ok(_) => {
                self.handlers.send_complete(*peer, SendStatus::Success);
                Ok(())
            }
            Err(e) if is_no_buffer_space(&e) => Err(LinkError::NoBufferSpace),
            Err(e) => Err(LinkError::SendFailed(e.to_string())),
        }
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
        tracing::debug!("Adding peer {} at {:?}", peer, attrs.endpoint);
        self.peers.insert(peer, attrs);
        Ok(())
    }

    fn remove_peer(&self, peer: &PeerAddress) -> Result<(), LinkError> {
        self.peers.remove(peer);
        Ok(())
    }
}

/// Create a UDP socket able to send to broadcast addresses
pub fn create_socket(bind_addr: SocketAddr) -> Result<UdpSocket, LinkError> {
    let domain = if bind_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| LinkError::Bind(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| LinkError::Bind(e.to_string()))?;
    if bind_addr.is_ipv4() {
        socket
            .set_broadcast(true)
            .map_err(|e| LinkError::Bind(e.to_string()))?;
    }
    socket
        .bind(&bind_addr.into())
        .map_err(|e| LinkError::Bind(format!("{}: {}", bind_addr, e)))?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(POLL_INTERVAL))?;
    Ok(socket)
}

fn is_no_buffer_space(e: &io::Error) -> bool {
    // ENOBUFS
    let enobufs = cfg!(target_os = "linux") && e.raw_os_error() == Some(105);
    enobufs
        || matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory
        )
}

fn receive_loop(
    socket: UdpSocket,
    local: PeerAddress,
    handlers: Arc<HandlerSet>,
    running: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    while running.load(Ordering::Relaxed) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _from)) => len,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => {
                tracing::warn!("UDP link receive failed: {}", e);
                continue;
            }
        };

        if len <= ENVELOPE_LEN {
            tracing::trace!(len, "Ignoring datagram without payload");
            continue;
        }

        let mut src = [0u8; ADDRESS_LEN];
        let mut dst = [0u8; ADDRESS_LEN];
        src.copy_from_slice(&buf[..ADDRESS_LEN]);
        dst.copy_from_slice(&buf[ADDRESS_LEN..ENVELOPE_LEN]);
        let (src, dst) = (PeerAddress::new(src), PeerAddress::new(dst));

        // Own broadcasts loop back on some stacks
        if src == local || !(dst == local || dst.is_broadcast()) {
            continue;
        }

        handlers.receive(src, dst.channel(), &buf[ENVELOPE_LEN..len]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::link::Channel;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(PeerAddress, Channel, Vec<u8>)>>);

    impl LinkHandler for Recorder {
        fn on_send_complete(&self, _peer: PeerAddress, _status: SendStatus) {}

        fn on_receive(&self, peer: PeerAddress, channel: Channel, bytes: &[u8]) {
            self.0.lock().push((peer, channel, bytes.to_vec()));
        }
    }

    fn config(address: PeerAddress) -> LinkConfig {
        LinkConfig {
            local_address: address,
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..LinkConfig::default()
        }
    }

    #[test]
    fn test_udp_link_roundtrip() {
        let a_addr = PeerAddress::new([0xA; 6]);
        let b_addr = PeerAddress::new([0xB; 6]);
        let a = UdpLink::bind(&config(a_addr)).unwrap();
        let b = UdpLink::bind(&config(b_addr)).unwrap();

        let rx = Arc::new(Recorder::default());
        b.register_handler(rx.clone());

        assert!(matches!(a.send(&b_addr, b"x"), Err(LinkError::UnknownPeer(_))));

        a.add_peer(
            b_addr,
            PeerAttributes {
                endpoint: Some(b.local_addr().unwrap()),
                ..Default::default()
            },
        )
        .unwrap();
        a.send(&b_addr, b"frame").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while rx.0.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(
            rx.0.lock().as_slice(),
            &[(a_addr, Channel::Unicast, b"frame".to_vec())]
        );
    }
}
