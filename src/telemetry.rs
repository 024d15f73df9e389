//! Rolling link statistics
//!
//! A [`TelemetryAccumulator`] is owned by one event loop and updated inline.
//! Once the emission interval has elapsed, [`maybe_emit`] turns the window
//! into a [`TelemetryReport`], logs it and starts a new window.
//!
//! [`maybe_emit`]: TelemetryAccumulator::maybe_emit

use std::time::{Duration, Instant};

use crate::network::SendStatus;

/// Rates and averages over one emission window
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryReport {
    pub window: Duration,
    /// Transmit throughput in KB/s
    pub tx_kbps: f32,
    /// Receive throughput in KB/s
    pub rx_kbps: f32,
    /// Missed frames as a percentage of frames received
    pub missed_pct: f32,
    pub missed: u64,
    pub frames_received: u64,
    /// Average free space in the playback ring, in samples
    pub ring_free_avg: f32,
    pub ring_free_pct: f32,
    pub rx_interval_avg_us: f32,
    pub send_latency_avg_us: f32,
    pub send_count: u64,
    pub send_failures: u64,
    pub parse_errors: u64,
    pub queue_drops: u64,
    pub retries: u64,
    pub underruns: u64,
    /// Capture ticks that fired while the previous block was in progress
    pub missed_ticks: u64,
    pub drain_timeouts: u64,
}

/// Additive counters for the current window
#[derive(Debug)]
pub struct TelemetryAccumulator {
    interval: Duration,
    window_start: Instant,
    ring_capacity: usize,

    tx_bytes: u64,
    rx_bytes: u64,
    frames_received: u64,
    missed: u64,
    ring_free_sum: u64,
    ring_free_count: u64,
    last_arrival: Option<Instant>,
    rx_interval_sum: Duration,
    rx_interval_count: u64,
    send_latency_sum: Duration,
    send_count: u64,
    send_failures: u64,
    parse_errors: u64,
    queue_drops: u64,
    retries: u64,
    underruns: u64,
    missed_ticks: u64,
    drain_timeouts: u64,
}

impl TelemetryAccumulator {
    pub fn new(interval: Duration, ring_capacity: usize, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
            ring_capacity,
            tx_bytes: 0,
            rx_bytes: 0,
            frames_received: 0,
            missed: 0,
            ring_free_sum: 0,
            ring_free_count: 0,
            last_arrival: None,
            rx_interval_sum: Duration::ZERO,
            rx_interval_count: 0,
            send_latency_sum: Duration::ZERO,
            send_count: 0,
            send_failures: 0,
            parse_errors: 0,
            queue_drops: 0,
            retries: 0,
            underruns: 0,
            missed_ticks: 0,
            drain_timeouts: 0,
        }
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.tx_bytes += bytes as u64;
    }

    /// A send completion arrived `latency` after its send was issued
    pub fn record_send_complete(&mut self, latency: Duration, status: SendStatus) {
        self.send_latency_sum += latency;
        self.send_count += 1;
        if status == SendStatus::Failed {
            self.send_failures += 1;
        }
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// A receive event was dequeued at `at`
    pub fn record_arrival(&mut self, at: Instant) {
        self.frames_received += 1;
        if let Some(last) = self.last_arrival {
            self.rx_interval_sum += at.saturating_duration_since(last);
            self.rx_interval_count += 1;
        }
        self.last_arrival = Some(at);
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.rx_bytes += bytes as u64;
    }

    pub fn record_missed(&mut self, frames: u32) {
        self.missed += u64::from(frames);
    }

    pub fn record_ring_free(&mut self, free: usize) {
        self.ring_free_sum += free as u64;
        self.ring_free_count += 1;
    }

    pub fn record_parse_error(&mut self) {
        self.parse_errors += 1;
    }

    pub fn record_queue_drops(&mut self, drops: u64) {
        self.queue_drops += drops;
    }

    pub fn record_underruns(&mut self, underruns: u64) {
        self.underruns += underruns;
    }

    pub fn record_missed_ticks(&mut self, ticks: u64) {
        self.missed_ticks += ticks;
    }

    pub fn record_drain_timeouts(&mut self, timeouts: u64) {
        self.drain_timeouts += timeouts;
    }

    /// Time left in the current window. Event loops wait no longer than
    /// this so a silent link still produces reports.
    pub fn until_emit(&self, now: Instant) -> Duration {
        (self.window_start + self.interval).saturating_duration_since(now)
    }

    /// Emit and reset if the interval has elapsed
    pub fn maybe_emit(&mut self, now: Instant) -> Option<TelemetryReport> {
        let window = now.saturating_duration_since(self.window_start);
        if window < self.interval {
            return None;
        }

        let report = self.report(window);
        tracing::info!(
            tx_kbps = report.tx_kbps,
            rx_kbps = report.rx_kbps,
            missed_pct = report.missed_pct,
            missed = report.missed,
            ring_free_pct = report.ring_free_pct,
            ring_free_avg = report.ring_free_avg,
            rx_interval_us = report.rx_interval_avg_us,
            send_latency_us = report.send_latency_avg_us,
            sends = report.send_count,
            send_failures = report.send_failures,
            parse_errors = report.parse_errors,
            queue_drops = report.queue_drops,
            retries = report.retries,
            underruns = report.underruns,
            missed_ticks = report.missed_ticks,
            drain_timeouts = report.drain_timeouts,
            "Link statistics"
        );

        self.reset(now);
        Some(report)
    }

    fn report(&self, window: Duration) -> TelemetryReport {
        let secs = window.as_secs_f32().max(f32::EPSILON);
        let ring_free_avg = average(self.ring_free_sum as f32, self.ring_free_count);

        TelemetryReport {
            window,
            tx_kbps: self.tx_bytes as f32 * 0.001 / secs,
            rx_kbps: self.rx_bytes as f32 * 0.001 / secs,
            missed_pct: average(self.missed as f32, self.frames_received) * 100.0,
            missed: self.missed,
            frames_received: self.frames_received,
            ring_free_avg,
            ring_free_pct: if self.ring_capacity == 0 {
                0.0
            } else {
                ring_free_avg / self.ring_capacity as f32 * 100.0
            },
            rx_interval_avg_us: average(
                self.rx_interval_sum.as_micros() as f32,
                self.rx_interval_count,
            ),
            send_latency_avg_us: average(
                self.send_latency_sum.as_micros() as f32,
                self.send_count,
            ),
            send_count: self.send_count,
            send_failures: self.send_failures,
            parse_errors: self.parse_errors,
            queue_drops: self.queue_drops,
            retries: self.retries,
            underruns: self.underruns,
            missed_ticks: self.missed_ticks,
            drain_timeouts: self.drain_timeouts,
        }
    }

    fn reset(&mut self, now: Instant) {
        // Arrival spacing carries across windows
        let last_arrival = self.last_arrival;
        *self = Self::new(self.interval, self.ring_capacity, now);
        self.last_arrival = last_arrival;
    }
}

fn average(sum: f32, count: u64) -> f32 {
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}
