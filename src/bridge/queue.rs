//! Bounded event queue between link callbacks and a role's event loop
//!
//! Link callbacks only copy and enqueue. Receive payloads are copied into
//! fixed-size buffers taken from a [`FramePool`], so the hot path never
//! allocates. When the queue or the pool is exhausted the event is dropped
//! and counted.

use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::MAX_LINK_FRAME;
use crate::error::QueueError;
use crate::network::{Channel, LinkHandler, PeerAddress, SendStatus};

/// Free list of fixed-size receive buffers
pub struct FramePool {
    free: ArrayQueue<Box<[u8]>>,
    buffer_len: usize,
}

impl FramePool {
    pub fn new(buffers: usize, buffer_len: usize) -> Arc<Self> {
        let free = ArrayQueue::new(buffers.max(1));
        for _ in 0..buffers.max(1) {
            let _ = free.push(vec![0u8; buffer_len].into_boxed_slice());
        }
        Arc::new(Self { free, buffer_len })
    }

    /// Copy `bytes` into a pooled buffer
    pub fn acquire(self: &Arc<Self>, bytes: &[u8]) -> Result<PooledBuffer, QueueError> {
        if bytes.len() > self.buffer_len {
            return Err(QueueError::Oversize(bytes.len()));
        }
        let mut buf = self.free.pop().ok_or(QueueError::PoolExhausted)?;
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(PooledBuffer {
            buf: Some(buf),
            len: bytes.len(),
            pool: self.clone(),
        })
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// A pool buffer holding one received frame; returned to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool: Arc<FramePool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            let _ = self.pool.free.push(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len).finish()
    }
}

/// Link event as seen by an event loop
#[derive(Debug)]
pub enum BridgeEvent {
    SendComplete {
        peer: PeerAddress,
        status: SendStatus,
        at: Instant,
    },
    Received {
        peer: PeerAddress,
        channel: Channel,
        data: PooledBuffer,
        at: Instant,
    },
    /// The role is being torn down
    Shutdown,
}

/// Multi-producer, single-consumer bounded event queue
pub struct EventQueue {
    tx: Sender<BridgeEvent>,
    rx: Receiver<BridgeEvent>,
    pool: Arc<FramePool>,
    closed: AtomicBool,
    dropped: AtomicU64,
    pool_exhausted: AtomicU64,
    oversize: AtomicU64,
}

impl EventQueue {
    /// Queue holding at most `depth` events. The receive pool has two spare
    /// buffers for the event being processed and one in flight.
    pub fn new(depth: usize) -> Arc<Self> {
        let depth = depth.max(1);
        let (tx, rx) = bounded(depth);
        Arc::new(Self {
            tx,
            rx,
            pool: FramePool::new(depth + 2, MAX_LINK_FRAME),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            pool_exhausted: AtomicU64::new(0),
            oversize: AtomicU64::new(0),
        })
    }

    fn enqueue(&self, event: BridgeEvent) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(QueueError::Full)
            }
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Closed),
        }
    }

    /// Never blocks
    pub fn push_send_complete(&self, peer: PeerAddress, status: SendStatus) -> Result<(), QueueError> {
        self.enqueue(BridgeEvent::SendComplete {
            peer,
            status,
            at: Instant::now(),
        })
    }

    /// Copy a received frame into a pooled buffer and enqueue it. Never blocks.
    pub fn push_received(
        &self,
        peer: PeerAddress,
        channel: Channel,
        bytes: &[u8],
    ) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let data = self.pool.acquire(bytes).map_err(|e| {
            match e {
                QueueError::Oversize(_) => self.oversize.fetch_add(1, Ordering::Relaxed),
                _ => self.pool_exhausted.fetch_add(1, Ordering::Relaxed),
            };
            e
        })?;
        self.enqueue(BridgeEvent::Received {
            peer,
            channel,
            data,
            at: Instant::now(),
        })
    }

    /// Block until the next event
    pub fn recv(&self) -> BridgeEvent {
        // Both ends live in `self`, so the channel never disconnects
        self.rx.recv().unwrap_or(BridgeEvent::Shutdown)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<BridgeEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(BridgeEvent::Shutdown),
        }
    }

    /// Refuse further events and wake the consumer with
    /// [`BridgeEvent::Shutdown`]. Queued events ahead of it are discarded
    /// as needed to make room.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut event = BridgeEvent::Shutdown;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    event = returned;
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Discard every pending event; returns how many were discarded.
    pub fn drain(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn pool_exhausted(&self) -> u64 {
        self.pool_exhausted.load(Ordering::Relaxed)
    }

    pub fn oversize(&self) -> u64 {
        self.oversize.load(Ordering::Relaxed)
    }

    /// Events lost for any reason: full queue, exhausted pool or oversize
    pub fn lost(&self) -> u64 {
        self.dropped() + self.pool_exhausted() + self.oversize()
    }
}

/// Link handler feeding one or both role queues.
///
/// Send completions are only routed for the paired peer. Receives are
/// routed from the paired peer, or from any peer when paired with the
/// broadcast address.
#[derive(Default)]
pub struct EventRouter {
    completions: Option<(Arc<EventQueue>, PeerAddress)>,
    receives: Option<(Arc<EventQueue>, PeerAddress)>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completions(mut self, queue: Arc<EventQueue>, peer: PeerAddress) -> Self {
        self.completions = Some((queue, peer));
        self
    }

    pub fn with_receives(mut self, queue: Arc<EventQueue>, peer: PeerAddress) -> Self {
        self.receives = Some((queue, peer));
        self
    }
}

impl LinkHandler for EventRouter {
    fn on_send_complete(&self, peer: PeerAddress, status: SendStatus) {
        if let Some((queue, paired)) = &self.completions {
            if peer == *paired {
                if let Err(e) = queue.push_send_complete(peer, status) {
                    tracing::trace!("Send completion dropped: {}", e);
                }
            }
        }
    }

    fn on_receive(&self, peer: PeerAddress, channel: Channel, bytes: &[u8]) {
        if let Some((queue, paired)) = &self.receives {
            if *paired != PeerAddress::BROADCAST && peer != *paired {
                return;
            }
            if let Err(e) = queue.push_received(peer, channel, bytes) {
                tracing::trace!("Receive event from {} dropped: {}", peer, e);
            }
        }
    }
}
