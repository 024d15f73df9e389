//! Sample sources and the timer-driven capture task
//!
//! A [`SampleSource`] stands in for the capture peripheral: each call to
//! `deliver_block` yields one block of interleaved samples. The capture task
//! wakes on a fixed tick, pulls a block, keeps channel 0 as mono and writes
//! it into the send ring.

use crossbeam_channel::{bounded, select, tick, Sender};
use std::f32::consts::TAU;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::ring::{Sample, SharedRing};
use crate::config::{SourceKind, StreamConfig};
use crate::error::Result;

/// Capture capability: delivers raw sample blocks on demand.
pub trait SampleSource: Send {
    /// Next block of interleaved samples, or `None` once the source is exhausted.
    fn deliver_block(&mut self) -> Result<Option<&[Sample]>>;

    /// Number of interleaved channels in each block
    fn channels(&self) -> u16;
}

/// Synthetic sine tone, used in place of live capture for testing a link.
pub struct SineGenerator {
    phase: f32,
    step: f32,
    amplitude: f32,
    channels: u16,
    block: Vec<Sample>,
}

impl SineGenerator {
    pub fn new(
        frequency_hz: f32,
        amplitude: f32,
        sample_rate: u32,
        channels: u16,
        frames_per_block: usize,
    ) -> Self {
        Self {
            phase: 0.0,
            step: TAU * frequency_hz / sample_rate as f32,
            amplitude: amplitude.clamp(0.0, 1.0),
            channels: channels.max(1),
            block: vec![0; frames_per_block * channels.max(1) as usize],
        }
    }
}

impl SampleSource for SineGenerator {
    fn deliver_block(&mut self) -> Result<Option<&[Sample]>> {
        for frame in self.block.chunks_mut(self.channels as usize) {
            let value = (self.phase.sin() * self.amplitude * i16::MAX as f32) as Sample;
            frame.fill(value);
            self.phase = (self.phase + self.step) % TAU;
        }
        Ok(Some(&self.block))
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// Interleaved signed 16-bit little-endian PCM read from any byte stream,
/// e.g. `arecord -f S16_LE -c 2 -r 48000 | sender`.
pub struct RawPcmSource<R> {
    reader: R,
    channels: u16,
    bytes: Vec<u8>,
    block: Vec<Sample>,
}

impl<R: Read + Send> RawPcmSource<R> {
    pub fn new(reader: R, channels: u16, frames_per_block: usize) -> Self {
        let samples = frames_per_block * channels.max(1) as usize;
        Self {
            reader,
            channels: channels.max(1),
            bytes: vec![0; samples * 2],
            block: vec![0; samples],
        }
    }
}

impl<R: Read + Send> SampleSource for RawPcmSource<R> {
    fn deliver_block(&mut self) -> Result<Option<&[Sample]>> {
        match self.reader.read_exact(&mut self.bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        for (sample, bytes) in self.block.iter_mut().zip(self.bytes.chunks_exact(2)) {
            *sample = Sample::from_le_bytes([bytes[0], bytes[1]]);
        }
        Ok(Some(&self.block))
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// Build the configured sample source
pub fn build_source(config: &StreamConfig) -> Box<dyn SampleSource> {
    let frames_per_block = config.frames_per_tick();
    match config.source {
        SourceKind::Sine {
            frequency_hz,
            amplitude,
        } => Box::new(SineGenerator::new(
            frequency_hz,
            amplitude,
            config.sample_rate,
            config.capture_channels,
            frames_per_block,
        )),
        SourceKind::Stdin => Box::new(RawPcmSource::new(
            std::io::stdin(),
            config.capture_channels,
            frames_per_block,
        )),
    }
}

/// Timer-driven capture into the send ring
pub struct CaptureTask {
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    samples_captured: Arc<AtomicU64>,
    missed_ticks: Arc<AtomicU64>,
}

impl CaptureTask {
    /// Spawn the capture thread, waking every `interval`.
    pub fn start(
        mut source: Box<dyn SampleSource>,
        ring: SharedRing,
        interval: Duration,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let samples_captured = Arc::new(AtomicU64::new(0));
        let missed_ticks = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let running_for_loop = running.clone();
        let captured = samples_captured.clone();
        let missed = missed_ticks.clone();

        let handle = thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let ticker = tick(interval);
                let channels = source.channels().max(1) as usize;
                let mut mono: Vec<Sample> = Vec::new();
                let mut last_tick = Instant::now();

                loop {
                    let at = select! {
                        recv(ticker) -> at => at.ok(),
                        recv(stop_rx) -> _ => None,
                    };
                    let Some(at) = at else { break };

                    let elapsed = at.saturating_duration_since(last_tick);
                    last_tick = at;
                    if elapsed >= interval * 2 {
                        let lost = elapsed.as_micros() / interval.as_micros().max(1) - 1;
                        missed.fetch_add(lost as u64, Ordering::Relaxed);
                    }

                    match source.deliver_block() {
                        Ok(Some(block)) => {
                            mono.clear();
                            mono.extend(block.iter().step_by(channels));
                            ring.write_bulk(&mono);
                            captured.fetch_add(mono.len() as u64, Ordering::Relaxed);
                        }
                        Ok(None) => {
                            tracing::info!("Sample source exhausted, stopping capture");
                            break;
                        }
                        Err(e) => {
                            tracing::error!("Capture failed: {}", e);
                            break;
                        }
                    }
                }

                running_for_loop.store(false, Ordering::SeqCst);
            })?;

        Ok(Self {
            running,
            stop_tx: Some(stop_tx),
            thread_handle: Some(handle),
            samples_captured,
            missed_ticks,
        })
    }

    /// Stop capturing and join the thread
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the stop channel and wakes the loop
        self.stop_tx.take();

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Total mono samples written to the ring
    pub fn samples_captured(&self) -> u64 {
        self.samples_captured.load(Ordering::Relaxed)
    }

    /// Ticks that elapsed while the previous block was still being handled
    pub fn missed_ticks(&self) -> u64 {
        self.missed_ticks.load(Ordering::Relaxed)
    }

    /// Shared handle on the missed tick count, for a loop that reports it
    pub fn missed_tick_counter(&self) -> Arc<AtomicU64> {
        self.missed_ticks.clone()
    }
}

impl Drop for CaptureTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring::create_shared_ring;
    use std::io::Cursor;

    #[test]
    fn test_sine_block_shape() {
        let mut sine = SineGenerator::new(440.0, 0.5, 48_000, 2, 48);
        let block = sine.deliver_block().unwrap().unwrap();
        assert_eq!(block.len(), 96);

        // Channels carry the same value
        for frame in block.chunks(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert!(block.iter().all(|s| s.unsigned_abs() <= i16::MAX as u16 / 2 + 1));
    }

    #[test]
    fn test_raw_pcm_source_decodes_le_and_ends() {
        let bytes: Vec<u8> = [1i16, -1, 300, -300]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let mut source = RawPcmSource::new(Cursor::new(bytes), 2, 2);

        assert_eq!(
            source.deliver_block().unwrap().unwrap(),
            &[1, -1, 300, -300]
        );
        assert!(source.deliver_block().unwrap().is_none());
    }

    #[test]
    fn test_capture_task_downmixes_into_ring() {
        let ring = create_shared_ring(1024).unwrap();
        let sine = SineGenerator::new(1000.0, 0.8, 48_000, 2, 48);

        let mut task =
            CaptureTask::start(Box::new(sine), ring.clone(), Duration::from_millis(1)).unwrap();
        assert!(ring.wait_for(96, Duration::from_secs(2)));
        task.stop();

        assert!(!task.is_running());
        assert_eq!(task.samples_captured() % 48, 0);
        assert!(task.samples_captured() >= 96);
    }

    #[test]
    fn test_capture_task_stops_on_exhausted_source() {
        let ring = create_shared_ring(64).unwrap();
        let source = RawPcmSource::new(Cursor::new(vec![0u8; 8]), 1, 4);

        let mut task =
            CaptureTask::start(Box::new(source), ring.clone(), Duration::from_millis(1)).unwrap();
        assert!(ring.wait_for(4, Duration::from_secs(2)));

        let deadline = Instant::now() + Duration::from_secs(2);
        while task.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(!task.is_running());
        assert_eq!(ring.len(), 4);
        task.stop();
    }
}
