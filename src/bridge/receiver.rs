//! Receive loop
//!
//! Consumes receive events strictly in arrival order. Each event runs
//! through parse, loss classification, admission and telemetry before the
//! next one is taken from the queue.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::audio::ring::{Sample, SharedRing};
use crate::bridge::gate::StreamGate;
use crate::bridge::queue::{BridgeEvent, EventQueue};
use crate::network::{Channel, PeerAddress};
use crate::protocol::{Classification, Concealment, FrameLayout, LossTracker};
use crate::telemetry::{TelemetryAccumulator, TelemetryReport};

/// Lifetime counters, shared with the session handle
#[derive(Debug, Default)]
pub struct ReceiverStats {
    frames_received: AtomicU64,
    parse_errors: AtomicU64,
    missed_packet_count: AtomicU64,
    repeated: AtomicU64,
    stale: AtomicU64,
    samples_admitted: AtomicU64,
    frames_suppressed: AtomicU64,
    reports_emitted: AtomicU64,
    last_report: Mutex<Option<TelemetryReport>>,
}

impl ReceiverStats {
    /// Receive events taken off the queue, valid or not
    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Frames presumed lost from sequence gaps
    pub fn missed_packet_count(&self) -> u64 {
        self.missed_packet_count.load(Ordering::Relaxed)
    }

    pub fn repeated(&self) -> u64 {
        self.repeated.load(Ordering::Relaxed)
    }

    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    /// Samples written to the playback ring
    pub fn samples_admitted(&self) -> u64 {
        self.samples_admitted.load(Ordering::Relaxed)
    }

    /// Accepted frames discarded because the gate was inactive
    pub fn frames_suppressed(&self) -> u64 {
        self.frames_suppressed.load(Ordering::Relaxed)
    }

    pub fn reports_emitted(&self) -> u64 {
        self.reports_emitted.load(Ordering::Relaxed)
    }

    /// Most recent telemetry report
    pub fn last_report(&self) -> Option<TelemetryReport> {
        self.last_report.lock().clone()
    }
}

/// Receiver role event loop
pub struct ReceiveLoop {
    layout: FrameLayout,
    concealment: Concealment,
    trackers: HashMap<(PeerAddress, Channel), LossTracker>,
    ring: SharedRing,
    gate: Arc<StreamGate>,
    queue: Arc<EventQueue>,
    telemetry: TelemetryAccumulator,
    stats: Arc<ReceiverStats>,
    underruns: Option<Arc<AtomicU64>>,
    seen_underruns: u64,
    seen_queue_losses: u64,
    scratch: Vec<Sample>,
}

impl ReceiveLoop {
    pub fn new(
        layout: FrameLayout,
        ring: SharedRing,
        gate: Arc<StreamGate>,
        queue: Arc<EventQueue>,
        telemetry: TelemetryAccumulator,
    ) -> Self {
        Self {
            layout,
            concealment: Concealment::new(layout.payload_samples()),
            trackers: HashMap::new(),
            ring,
            gate,
            queue,
            telemetry,
            stats: Arc::new(ReceiverStats::default()),
            underruns: None,
            seen_underruns: 0,
            seen_queue_losses: 0,
            scratch: Vec::with_capacity(layout.payload_samples()),
        }
    }

    /// Report playback underruns from `counter` in telemetry
    pub fn with_underruns(mut self, counter: Arc<AtomicU64>) -> Self {
        self.seen_underruns = counter.load(Ordering::Relaxed);
        self.underruns = Some(counter);
        self
    }

    pub fn stats(&self) -> Arc<ReceiverStats> {
        self.stats.clone()
    }

    /// Run until the queue is closed
    pub fn run(mut self) {
        tracing::info!("Receive loop started");
        loop {
            // Wake at the end of each window even when nothing arrives
            let wait = self.telemetry.until_emit(Instant::now());
            let running = match self.queue.recv_timeout(wait) {
                Some(event) => self.handle(event),
                None => {
                    self.emit_telemetry();
                    true
                }
            };
            if !running {
                break;
            }
        }
        tracing::info!(
            frames = self.stats.frames_received(),
            missed = self.stats.missed_packet_count(),
            queue_losses = self.queue.lost(),
            "Receive loop stopped"
        );
    }

    /// Process one event. Returns false on shutdown.
    pub fn handle(&mut self, event: BridgeEvent) -> bool {
        match event {
            BridgeEvent::Received {
                peer,
                channel,
                data,
                at,
            } => {
                self.on_frame(peer, channel, &data, at);
            }
            BridgeEvent::SendComplete { .. } => {}
            BridgeEvent::Shutdown => return false,
        }

        self.emit_telemetry();
        true
    }

    /// Pick up counters kept outside the loop, then emit if the window is over
    fn emit_telemetry(&mut self) {
        let losses = self.queue.lost();
        self.telemetry
            .record_queue_drops(losses.saturating_sub(self.seen_queue_losses));
        self.seen_queue_losses = losses;

        if let Some(counter) = &self.underruns {
            let underruns = counter.load(Ordering::Relaxed);
            self.telemetry
                .record_underruns(underruns.saturating_sub(self.seen_underruns));
            self.seen_underruns = underruns;
        }

        if let Some(report) = self.telemetry.maybe_emit(Instant::now()) {
            self.stats.reports_emitted.fetch_add(1, Ordering::Relaxed);
            *self.stats.last_report.lock() = Some(report);
        }
    }

    fn on_frame(&mut self, peer: PeerAddress, channel: Channel, bytes: &[u8], at: Instant) {
        self.telemetry.record_arrival(at);
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match self.layout.parse(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                self.telemetry.record_parse_error();
                tracing::debug!(%peer, "Discarding frame: {}", e);
                return;
            }
        };
        self.telemetry.record_received(bytes.len());

        let width = self.layout.seq_width();
        let tracker = self
            .trackers
            .entry((peer, channel))
            .or_insert_with(|| LossTracker::new(width));
        let last = tracker.last_accepted();
        let class = tracker.classify(frame.sequence);

        match class {
            Classification::Gap(missed) => {
                self.stats
                    .missed_packet_count
                    .fetch_add(u64::from(missed), Ordering::Relaxed);
                self.telemetry.record_missed(missed);
                tracing::trace!(%peer, seq = frame.sequence, missed, "Sequence gap");
            }
            Classification::Repeated => {
                self.stats.repeated.fetch_add(1, Ordering::Relaxed);
            }
            Classification::Stale => {
                self.stats.stale.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    %peer,
                    seq = frame.sequence,
                    last = ?last,
                    "Stale frame discarded"
                );
            }
            Classification::Fresh => {}
        }

        let Some(admit) = self.concealment.admit_len(class) else {
            return;
        };

        if self.gate.is_active() {
            frame.decode_into(admit, &mut self.scratch);
            self.ring.write_bulk(&self.scratch);
            self.stats
                .samples_admitted
                .fetch_add(self.scratch.len() as u64, Ordering::Relaxed);
        } else {
            self.stats.frames_suppressed.fetch_add(1, Ordering::Relaxed);
        }
        self.telemetry.record_ring_free(self.ring.avail());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring::{create_shared_ring, SampleRing};
    use crate::constants::MAX_LINK_FRAME;
    use crate::protocol::{DrainPolicy, FrameEncoder, SequenceWidth};
    use std::thread;
    use std::time::Duration;

    const PEER: PeerAddress = PeerAddress::new([0xA; 6]);

    struct Harness {
        encoder: FrameEncoder,
        source: SampleRing,
        queue: Arc<EventQueue>,
        ring: SharedRing,
        gate: Arc<StreamGate>,
        receive: ReceiveLoop,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_interval(Duration::from_secs(10))
        }

        fn with_interval(interval: Duration) -> Self {
            let layout = FrameLayout::new(SequenceWidth::U32, 48).unwrap();
            let queue = EventQueue::new(12);
            let ring = create_shared_ring(1024).unwrap();
            let gate = Arc::new(StreamGate::new());
            gate.activate();
            let receive = ReceiveLoop::new(
                layout,
                ring.clone(),
                gate.clone(),
                queue.clone(),
                TelemetryAccumulator::new(interval, 1024, Instant::now()),
            );
            Self {
                encoder: FrameEncoder::new(layout),
                source: SampleRing::new(64).unwrap(),
                queue,
                ring,
                gate,
                receive,
            }
        }

        /// Build the next frame and return its bytes
        fn next_frame(&mut self) -> Vec<u8> {
            let samples: Vec<Sample> = (0..48).collect();
            self.source.write_bulk(&samples);
            self.encoder
                .prepare(Channel::Unicast, &self.source, DrainPolicy::Filler);
            self.encoder.frame().to_vec()
        }

        /// Deliver `bytes` and return the playback ring occupancy delta
        fn deliver(&mut self, bytes: &[u8]) -> usize {
            let before = self.ring.len();
            self.queue
                .push_received(PEER, Channel::Unicast, bytes)
                .unwrap();
            let event = self.queue.recv();
            assert!(self.receive.handle(event));
            self.ring.len() - before
        }
    }

    #[test]
    fn test_drop_one_frame_conceals_with_full_payload() {
        let mut h = Harness::new();
        let frames: Vec<Vec<u8>> = (0..5).map(|_| h.next_frame()).collect();

        assert_eq!(h.deliver(&frames[0]), 24);
        assert_eq!(h.deliver(&frames[1]), 24);
        assert_eq!(h.deliver(&frames[2]), 24);
        assert_eq!(h.deliver(&frames[4]), 48);

        let stats = h.receive.stats();
        assert_eq!(stats.missed_packet_count(), 1);
        assert_eq!(stats.samples_admitted(), 24 * 3 + 48);
    }

    #[test]
    fn test_admits_first_half_in_order() {
        let mut h = Harness::new();
        let frame = h.next_frame();
        h.deliver(&frame);

        let mut out = vec![0; 24];
        assert_eq!(h.ring.read_into(&mut out), 24);
        assert_eq!(out, (0..24).collect::<Vec<Sample>>());
    }

    #[test]
    fn test_duplicate_and_stale_not_admitted() {
        let mut h = Harness::new();
        let frames: Vec<Vec<u8>> = (0..3).map(|_| h.next_frame()).collect();

        h.deliver(&frames[0]);
        assert_eq!(h.deliver(&frames[0]), 0);
        h.deliver(&frames[2]);
        assert_eq!(h.deliver(&frames[1]), 0);

        let stats = h.receive.stats();
        assert_eq!(stats.repeated(), 1);
        assert_eq!(stats.stale(), 1);
        assert_eq!(stats.missed_packet_count(), 1);
    }

    #[test]
    fn test_corrupt_frame_counted_and_ignored() {
        let mut h = Harness::new();
        let first = h.next_frame();
        let mut second = h.next_frame();
        second[10] ^= 0xFF;
        let third = h.next_frame();

        h.deliver(&first);
        assert_eq!(h.deliver(&second), 0);
        assert_eq!(h.deliver(&[1, 2, 3]), 0);

        // The corrupt frame did not advance the stream, so frame 2 is a gap of one
        assert_eq!(h.deliver(&third), 48);
        let stats = h.receive.stats();
        assert_eq!(stats.parse_errors(), 2);
        assert_eq!(stats.frames_received(), 4);
        assert_eq!(stats.missed_packet_count(), 1);
    }

    #[test]
    fn test_inactive_gate_suppresses_admission() {
        let mut h = Harness::new();
        h.gate.deactivate();

        let frames: Vec<Vec<u8>> = (0..3).map(|_| h.next_frame()).collect();
        assert_eq!(h.deliver(&frames[0]), 0);
        assert_eq!(h.deliver(&frames[2]), 0);

        let stats = h.receive.stats();
        assert_eq!(stats.missed_packet_count(), 1);
        assert_eq!(stats.frames_suppressed(), 2);
        assert_eq!(h.ring.len(), 0);

        // Loss state kept advancing while inactive
        h.gate.activate();
        let next = h.next_frame();
        assert_eq!(h.deliver(&next), 24);
    }

    #[test]
    fn test_trackers_are_per_peer() {
        let mut h = Harness::new();
        let frame = h.next_frame();
        h.deliver(&frame);

        let other = PeerAddress::new([0xC; 6]);
        h.queue.push_received(other, Channel::Unicast, &frame).unwrap();
        let event = h.queue.recv();
        h.receive.handle(event);

        assert_eq!(h.receive.stats().repeated(), 0);
        assert_eq!(h.ring.len(), 48);
    }

    #[test]
    fn test_shutdown_ends_loop() {
        let mut h = Harness::new();
        h.queue.close();
        let event = h.queue.recv();
        assert!(!h.receive.handle(event));
    }

    #[test]
    fn test_reports_emitted_while_link_is_silent() {
        let h = Harness::with_interval(Duration::from_millis(10));
        let stats = h.receive.stats();
        let queue = h.queue.clone();
        let handle = thread::spawn(move || h.receive.run());

        thread::sleep(Duration::from_millis(200));
        queue.close();
        handle.join().unwrap();

        assert!(stats.reports_emitted() >= 5);
        let report = stats.last_report().unwrap();
        assert_eq!(report.frames_received, 0);
        assert_eq!(report.rx_kbps, 0.0);
    }

    #[test]
    fn test_underruns_and_queue_losses_reach_report() {
        let mut h = Harness::with_interval(Duration::ZERO);
        let underruns = Arc::new(AtomicU64::new(2));
        h.receive = h.receive.with_underruns(underruns.clone());

        underruns.fetch_add(3, Ordering::Relaxed);
        let oversize = vec![0u8; MAX_LINK_FRAME + 1];
        assert!(h.queue.push_received(PEER, Channel::Unicast, &oversize).is_err());

        let frame = h.next_frame();
        h.deliver(&frame);

        let report = h.receive.stats().last_report().unwrap();
        assert_eq!(report.underruns, 3);
        assert_eq!(report.queue_drops, 1);
        assert_eq!(report.frames_received, 1);
    }
}
