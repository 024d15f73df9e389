//! Self-clocked send loop
//!
//! One frame is sent to start the pipeline. After that a send is issued only
//! when the previous one completes, so the send rate follows the link's own
//! throughput. Each prepared frame goes out `copies` times before the next
//! one is built.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::audio::ring::SharedRing;
use crate::bridge::queue::{BridgeEvent, EventQueue};
use crate::error::LinkError;
use crate::network::{Channel, Link, PeerAddress, SendStatus};
use crate::protocol::{DrainPolicy, FrameEncoder};
use crate::telemetry::{TelemetryAccumulator, TelemetryReport};

/// Why the send loop ended
#[derive(Debug)]
pub enum SenderExit {
    /// Shut down on request
    Stopped,
    /// A send failed with a non-transient error
    Failed(LinkError),
}

/// Lifetime counters, shared with the session handle
#[derive(Debug, Default)]
pub struct SenderStats {
    frames_prepared: AtomicU64,
    sends: AtomicU64,
    completions: AtomicU64,
    failed_completions: AtomicU64,
    retries: AtomicU64,
    filler_samples: AtomicU64,
    failed: AtomicBool,
    reports_emitted: AtomicU64,
    last_report: Mutex<Option<TelemetryReport>>,
}

impl SenderStats {
    pub fn frames_prepared(&self) -> u64 {
        self.frames_prepared.load(Ordering::Relaxed)
    }

    /// Frames handed to the link, copies included
    pub fn sends(&self) -> u64 {
        self.sends.load(Ordering::Relaxed)
    }

    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    pub fn failed_completions(&self) -> u64 {
        self.failed_completions.load(Ordering::Relaxed)
    }

    /// Immediate retries after a transient send failure
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn filler_samples(&self) -> u64 {
        self.filler_samples.load(Ordering::Relaxed)
    }

    /// Whether the loop ended on a fatal send error
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn reports_emitted(&self) -> u64 {
        self.reports_emitted.load(Ordering::Relaxed)
    }

    /// Most recent telemetry report
    pub fn last_report(&self) -> Option<TelemetryReport> {
        self.last_report.lock().clone()
    }
}

/// Sender role event loop
pub struct SendLoop {
    link: Arc<dyn Link>,
    peer: PeerAddress,
    channel: Channel,
    encoder: FrameEncoder,
    ring: SharedRing,
    policy: DrainPolicy,
    copies: u32,
    copies_sent: u32,
    sent_at: Instant,
    queue: Arc<EventQueue>,
    telemetry: TelemetryAccumulator,
    stats: Arc<SenderStats>,
    missed_ticks: Option<Arc<AtomicU64>>,
    seen_missed_ticks: u64,
}

impl SendLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        link: Arc<dyn Link>,
        peer: PeerAddress,
        encoder: FrameEncoder,
        ring: SharedRing,
        policy: DrainPolicy,
        copies: u32,
        queue: Arc<EventQueue>,
        telemetry: TelemetryAccumulator,
    ) -> Self {
        Self {
            link,
            peer,
            channel: peer.channel(),
            encoder,
            ring,
            policy,
            copies: copies.max(1),
            copies_sent: 0,
            sent_at: Instant::now(),
            queue,
            telemetry,
            stats: Arc::new(SenderStats::default()),
            missed_ticks: None,
            seen_missed_ticks: 0,
        }
    }

    /// Report missed capture ticks from `counter` in telemetry
    pub fn with_missed_ticks(mut self, counter: Arc<AtomicU64>) -> Self {
        self.seen_missed_ticks = counter.load(Ordering::Relaxed);
        self.missed_ticks = Some(counter);
        self
    }

    pub fn stats(&self) -> Arc<SenderStats> {
        self.stats.clone()
    }

    /// Run until shutdown or a fatal send error
    pub fn run(mut self) -> SenderExit {
        tracing::info!(peer = %self.peer, "Send loop started");

        if let Err(e) = self.prepare_and_send() {
            return self.fail(e);
        }

        loop {
            // Wake at the end of each window even when completions stall
            let wait = self.telemetry.until_emit(Instant::now());
            match self.queue.recv_timeout(wait) {
                Some(BridgeEvent::SendComplete { peer, status, at }) => {
                    if peer != self.peer {
                        continue;
                    }
                    self.telemetry
                        .record_send_complete(at.saturating_duration_since(self.sent_at), status);
                    self.stats.completions.fetch_add(1, Ordering::Relaxed);
                    if status == SendStatus::Failed {
                        self.stats.failed_completions.fetch_add(1, Ordering::Relaxed);
                    }

                    let result = if self.copies_sent < self.copies {
                        self.transmit()
                    } else {
                        self.prepare_and_send()
                    };
                    if let Err(e) = result {
                        return self.fail(e);
                    }
                }
                Some(BridgeEvent::Received { .. }) | None => {}
                Some(BridgeEvent::Shutdown) => break,
            }

            self.emit_telemetry();
        }

        tracing::info!(
            frames = self.stats.frames_prepared(),
            sends = self.stats.sends(),
            "Send loop stopped"
        );
        SenderExit::Stopped
    }

    fn emit_telemetry(&mut self) {
        if let Some(counter) = &self.missed_ticks {
            let missed = counter.load(Ordering::Relaxed);
            self.telemetry
                .record_missed_ticks(missed.saturating_sub(self.seen_missed_ticks));
            self.seen_missed_ticks = missed;
        }

        if let Some(report) = self.telemetry.maybe_emit(Instant::now()) {
            self.stats.reports_emitted.fetch_add(1, Ordering::Relaxed);
            *self.stats.last_report.lock() = Some(report);
        }
    }

    fn prepare_and_send(&mut self) -> Result<(), LinkError> {
        let before = self.encoder.stats();
        let seq = self.encoder.prepare(self.channel, &self.ring, self.policy);
        let after = self.encoder.stats();
        let filler = after.filler_samples - before.filler_samples;
        self.telemetry
            .record_drain_timeouts(after.drain_timeouts - before.drain_timeouts);

        self.stats.frames_prepared.fetch_add(1, Ordering::Relaxed);
        self.stats.filler_samples.fetch_add(filler, Ordering::Relaxed);
        tracing::trace!(seq, filler, "Prepared frame");

        self.copies_sent = 0;
        self.transmit()
    }

    /// Send the current frame, retrying transient failures immediately
    fn transmit(&mut self) -> Result<(), LinkError> {
        loop {
            self.sent_at = Instant::now();
            match self.link.send(&self.peer, self.encoder.frame()) {
                Ok(()) => {
                    self.copies_sent += 1;
                    self.stats.sends.fetch_add(1, Ordering::Relaxed);
                    self.telemetry.record_sent(self.encoder.frame().len());
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    self.telemetry.record_retry();
                    tracing::debug!("Transient send failure, retrying: {}", e);
                    if self.queue.is_closed() {
                        // The pending shutdown event ends the loop
                        return Ok(());
                    }
                    thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail(self, error: LinkError) -> SenderExit {
        tracing::error!(peer = %self.peer, "Send failed, stopping sender: {}", error);
        self.stats.failed.store(true, Ordering::Relaxed);
        if let Err(e) = self.link.remove_peer(&self.peer) {
            tracing::warn!("Failed to remove peer {}: {}", self.peer, e);
        }
        SenderExit::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring::create_shared_ring;
    use crate::bridge::queue::EventRouter;
    use crate::network::{PeerAttributes, SimMedium};
    use crate::protocol::{FrameLayout, SequenceWidth};
    use std::time::Duration;

    const A: PeerAddress = PeerAddress::new([0xA; 6]);
    const B: PeerAddress = PeerAddress::new([0xB; 6]);

    fn send_loop(link: Arc<dyn Link>, queue: Arc<EventQueue>, copies: u32) -> SendLoop {
        send_loop_with(link, queue, copies, DrainPolicy::Filler, Duration::from_secs(10))
    }

    fn send_loop_with(
        link: Arc<dyn Link>,
        queue: Arc<EventQueue>,
        copies: u32,
        policy: DrainPolicy,
        interval: Duration,
    ) -> SendLoop {
        let layout = FrameLayout::new(SequenceWidth::U32, 48).unwrap();
        SendLoop::new(
            link,
            B,
            FrameEncoder::new(layout),
            create_shared_ring(1024).unwrap(),
            policy,
            copies,
            queue,
            TelemetryAccumulator::new(interval, 1024, Instant::now()),
        )
    }

    #[test]
    fn test_fatal_error_stops_and_unpairs() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        a.add_peer(B, PeerAttributes::default()).unwrap();

        let queue = EventQueue::new(12);
        a.register_handler(Arc::new(
            EventRouter::new().with_completions(queue.clone(), B),
        ));

        medium.inject_send_errors(1, false);
        let send = send_loop(a.clone(), queue, 2);
        let stats = send.stats();

        let exit = send.run();
        assert!(matches!(exit, SenderExit::Failed(LinkError::SendFailed(_))));
        assert!(stats.failed());
        assert!(!a.is_peer_known(&B));
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        let _b = medium.attach(B);
        a.add_peer(B, PeerAttributes::default()).unwrap();

        let queue = EventQueue::new(12);
        a.register_handler(Arc::new(
            EventRouter::new().with_completions(queue.clone(), B),
        ));

        medium.inject_send_errors(3, true);
        let send = send_loop(a.clone(), queue.clone(), 2);
        let stats = send.stats();
        let handle = thread::spawn(move || send.run());

        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.sends() < 20 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        queue.close();

        assert!(matches!(handle.join().unwrap(), SenderExit::Stopped));
        assert_eq!(stats.retries(), 3);
        assert!(stats.sends() >= 20);
        assert!(!stats.failed());
    }

    #[test]
    fn test_each_frame_sent_twice() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        let _b = medium.attach(B);
        a.add_peer(B, PeerAttributes::default()).unwrap();

        let queue = EventQueue::new(12);
        a.register_handler(Arc::new(
            EventRouter::new().with_completions(queue.clone(), B),
        ));

        let send = send_loop(a.clone(), queue.clone(), 2);
        let stats = send.stats();
        let handle = thread::spawn(move || send.run());

        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.frames_prepared() < 10 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        queue.close();
        handle.join().unwrap();

        // Every prepared frame but possibly the last went out twice
        let (frames, sends) = (stats.frames_prepared(), stats.sends());
        assert!(sends == frames * 2 || sends == frames * 2 - 1);
    }

    #[test]
    fn test_capture_and_drain_counters_reach_report() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        let _b = medium.attach(B);
        a.add_peer(B, PeerAttributes::default()).unwrap();

        let queue = EventQueue::new(12);
        a.register_handler(Arc::new(
            EventRouter::new().with_completions(queue.clone(), B),
        ));

        // The ring is never fed, so every frame waits out its drain timeout
        let missed_ticks = Arc::new(AtomicU64::new(0));
        let send = send_loop_with(
            a.clone(),
            queue.clone(),
            2,
            DrainPolicy::Block {
                timeout: Duration::from_millis(1),
            },
            Duration::from_millis(20),
        )
        .with_missed_ticks(missed_ticks.clone());
        let stats = send.stats();
        let handle = thread::spawn(move || send.run());

        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.reports_emitted() < 3 && Instant::now() < deadline {
            missed_ticks.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(1));
        }
        queue.close();
        handle.join().unwrap();

        let report = stats.last_report().unwrap();
        assert!(report.drain_timeouts > 0);
        assert!(report.missed_ticks > 0);
        assert!(report.send_count > 0);
    }

    #[test]
    fn test_reports_emitted_while_completions_stall() {
        let medium = SimMedium::new();
        let a = medium.attach(A);
        let _b = medium.attach(B);
        a.add_peer(B, PeerAttributes::default()).unwrap();

        // No handler is registered, so the first send never completes
        let queue = EventQueue::new(12);
        let send = send_loop_with(
            a.clone(),
            queue.clone(),
            2,
            DrainPolicy::Filler,
            Duration::from_millis(10),
        );
        let stats = send.stats();
        let handle = thread::spawn(move || send.run());

        thread::sleep(Duration::from_millis(200));
        queue.close();
        handle.join().unwrap();

        assert_eq!(stats.sends(), 1);
        assert!(stats.reports_emitted() >= 5);
    }
}
