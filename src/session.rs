//! Stream sessions
//!
//! A session owns everything one active stream needs: rings, codec state,
//! loss trackers and telemetry live inside the role's loop, the session
//! holds the threads and the link registration. Stopping a session leaves
//! the link as it found it, so a new session can start on the same link.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::audio::{
    create_shared_ring, CaptureTask, PlaybackSink, PlaybackTask, SampleSource, SharedRing,
};
use crate::bridge::{
    EventQueue, EventRouter, ReceiveLoop, ReceiverStats, SendLoop, SenderExit, SenderStats,
    StreamGate,
};
use crate::config::AppConfig;
use crate::error::Result;
use crate::network::{HandlerId, Link, PeerAddress, PeerAttributes};
use crate::protocol::FrameEncoder;
use crate::telemetry::TelemetryAccumulator;

/// Pair with `peer` unless the link already knows it. Returns whether the
/// session added it.
fn pair_peer(link: &dyn Link, config: &AppConfig) -> Result<bool> {
    let peer = config.link.peer;
    if link.is_peer_known(&peer) {
        return Ok(false);
    }
    link.add_peer(
        peer,
        PeerAttributes {
            radio_channel: config.link.radio_channel,
            encrypt: false,
            endpoint: config.link.peer_endpoint,
        },
    )?;
    tracing::info!(%peer, "Peer added");
    Ok(true)
}

fn unpair_peer(link: &dyn Link, peer: &PeerAddress) {
    if let Err(e) = link.remove_peer(peer) {
        tracing::warn!(%peer, "Failed to remove peer: {}", e);
    }
}

/// Capture, frame and send one stream
pub struct SenderSession {
    link: Arc<dyn Link>,
    peer: PeerAddress,
    added_peer: bool,
    ring: SharedRing,
    queue: Arc<EventQueue>,
    handler: Option<HandlerId>,
    capture: Option<CaptureTask>,
    send_thread: Option<JoinHandle<SenderExit>>,
    stats: Arc<SenderStats>,
}

impl SenderSession {
    pub fn start(
        link: Arc<dyn Link>,
        config: &AppConfig,
        source: Box<dyn SampleSource>,
    ) -> Result<Self> {
        config.validate()?;
        let stream = &config.stream;
        let peer = config.link.peer;
        let layout = stream.layout()?;

        let ring = create_shared_ring(stream.send_ring_capacity)?;
        let queue = EventQueue::new(config.link.event_queue_depth);
        let capture = CaptureTask::start(source, ring.clone(), stream.tick_interval())?;

        let added_peer = pair_peer(link.as_ref(), config)?;
        let handler = link.register_handler(Arc::new(
            EventRouter::new().with_completions(queue.clone(), peer),
        ));

        let send_loop = SendLoop::new(
            link.clone(),
            peer,
            FrameEncoder::new(layout),
            ring.clone(),
            stream.drain_policy(),
            stream.send_copies,
            queue.clone(),
            TelemetryAccumulator::new(
                config.telemetry.interval(),
                stream.send_ring_capacity,
                Instant::now(),
            ),
        )
        .with_missed_ticks(capture.missed_tick_counter());
        let stats = send_loop.stats();

        let mut session = Self {
            link,
            peer,
            added_peer,
            ring,
            queue,
            handler: Some(handler),
            capture: Some(capture),
            send_thread: None,
            stats,
        };

        session.send_thread = Some(
            thread::Builder::new()
                .name("send-loop".into())
                .spawn(move || send_loop.run())?,
        );

        tracing::info!(%peer, "Sender session started");
        Ok(session)
    }

    pub fn stats(&self) -> &Arc<SenderStats> {
        &self.stats
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    /// Whether the send loop is still running
    pub fn is_running(&self) -> bool {
        self.send_thread
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Tear the session down and report how the send loop ended
    pub fn stop(mut self) -> SenderExit {
        self.shutdown().unwrap_or(SenderExit::Stopped)
    }

    fn shutdown(&mut self) -> Option<SenderExit> {
        // The handler registration marks a live session
        self.handler?;

        self.queue.close();
        let exit = match self.send_thread.take().map(JoinHandle::join) {
            Some(Ok(exit)) => exit,
            Some(Err(_)) => {
                tracing::error!("Send loop panicked");
                SenderExit::Stopped
            }
            None => SenderExit::Stopped,
        };

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(id) = self.handler.take() {
            self.link.unregister_handler(id);
        }
        self.queue.drain();
        if self.added_peer {
            unpair_peer(self.link.as_ref(), &self.peer);
        }
        self.ring.reset();

        tracing::info!(peer = %self.peer, "Sender session stopped");
        Some(exit)
    }
}

impl Drop for SenderSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Receive, conceal and play one stream
pub struct ReceiverSession {
    link: Arc<dyn Link>,
    peer: PeerAddress,
    added_peer: bool,
    ring: SharedRing,
    gate: Arc<StreamGate>,
    queue: Arc<EventQueue>,
    handler: Option<HandlerId>,
    playback: Option<PlaybackTask>,
    receive_thread: Option<JoinHandle<()>>,
    stats: Arc<ReceiverStats>,
}

impl ReceiverSession {
    /// Start receiving from the configured peer, or from anyone when it is
    /// the broadcast address. The gate starts inactive; open it once enough
    /// lead time has passed.
    pub fn start(
        link: Arc<dyn Link>,
        config: &AppConfig,
        sink: Box<dyn PlaybackSink>,
    ) -> Result<Self> {
        config.validate()?;
        let stream = &config.stream;

        let ring = create_shared_ring(stream.playback_ring_capacity)?;
        let gate = Arc::new(StreamGate::new());
        let queue = EventQueue::new(config.link.event_queue_depth);
        let playback = PlaybackTask::start(
            sink,
            ring.clone(),
            stream.tick_interval(),
            stream.frames_per_tick(),
        )?;

        let receive_loop = ReceiveLoop::new(
            stream.layout()?,
            ring.clone(),
            gate.clone(),
            queue.clone(),
            TelemetryAccumulator::new(
                config.telemetry.interval(),
                stream.playback_ring_capacity,
                Instant::now(),
            ),
        )
        .with_underruns(playback.underrun_counter());
        let stats = receive_loop.stats();

        let peer = config.link.peer;
        let added_peer = pair_peer(link.as_ref(), config)?;
        let handler = link.register_handler(Arc::new(
            EventRouter::new().with_receives(queue.clone(), peer),
        ));

        let mut session = Self {
            link,
            peer,
            added_peer,
            ring,
            gate,
            queue,
            handler: Some(handler),
            playback: Some(playback),
            receive_thread: None,
            stats,
        };

        session.receive_thread = Some(
            thread::Builder::new()
                .name("receive-loop".into())
                .spawn(move || receive_loop.run())?,
        );

        tracing::info!("Receiver session started");
        Ok(session)
    }

    pub fn gate(&self) -> &Arc<StreamGate> {
        &self.gate
    }

    pub fn stats(&self) -> &Arc<ReceiverStats> {
        &self.stats
    }

    pub fn ring(&self) -> &SharedRing {
        &self.ring
    }

    pub fn underruns(&self) -> u64 {
        self.playback.as_ref().map_or(0, |p| p.underruns())
    }

    /// Samples handed to the sink, excluding silence padding
    pub fn samples_played(&self) -> u64 {
        self.playback.as_ref().map_or(0, |p| p.samples_played())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(id) = self.handler.take() else {
            return;
        };

        self.gate.deactivate();
        self.link.unregister_handler(id);
        self.queue.close();
        if let Some(Err(_)) = self.receive_thread.take().map(JoinHandle::join) {
            tracing::error!("Receive loop panicked");
        }
        if let Some(mut playback) = self.playback.take() {
            playback.stop();
        }
        self.queue.drain();
        if self.added_peer {
            unpair_peer(self.link.as_ref(), &self.peer);
        }
        self.ring.reset();

        tracing::info!("Receiver session stopped");
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
