//! Playback sinks and the timer-driven playback task

use crossbeam_channel::{bounded, select, tick, Sender};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::ring::{Sample, SharedRing};
use crate::error::Result;

/// Playback capability: accepts blocks of mono samples.
pub trait PlaybackSink: Send {
    fn accept_block(&mut self, samples: &[Sample]) -> Result<()>;
}

/// Writes mono signed 16-bit little-endian PCM to any byte stream,
/// e.g. `receiver | aplay -f S16_LE -c 1 -r 48000`.
pub struct RawPcmSink<W> {
    writer: W,
    bytes: Vec<u8>,
}

impl<W: Write + Send> RawPcmSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            bytes: Vec::new(),
        }
    }
}

impl<W: Write + Send> PlaybackSink for RawPcmSink<W> {
    fn accept_block(&mut self, samples: &[Sample]) -> Result<()> {
        self.bytes.clear();
        self.bytes
            .extend(samples.iter().flat_map(|s| s.to_le_bytes()));
        self.writer.write_all(&self.bytes)?;
        Ok(())
    }
}

/// Discards everything; used when only telemetry matters.
#[derive(Debug, Default)]
pub struct NullSink;

impl PlaybackSink for NullSink {
    fn accept_block(&mut self, _samples: &[Sample]) -> Result<()> {
        Ok(())
    }
}

/// Drains the playback ring into a sink on a fixed tick
pub struct PlaybackTask {
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    thread_handle: Option<JoinHandle<()>>,
    samples_played: Arc<AtomicU64>,
    underruns: Arc<AtomicU64>,
}

impl PlaybackTask {
    /// Spawn the playback thread. Every `interval` it hands `block_len`
    /// samples to the sink, padding with silence when the ring runs short.
    pub fn start(
        mut sink: Box<dyn PlaybackSink>,
        ring: SharedRing,
        interval: Duration,
        block_len: usize,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let samples_played = Arc::new(AtomicU64::new(0));
        let underruns = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let running_for_loop = running.clone();
        let played = samples_played.clone();
        let underrun_count = underruns.clone();

        let handle = thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let ticker = tick(interval);
                let mut block = vec![0; block_len];

                loop {
                    let woke = select! {
                        recv(ticker) -> at => at.is_ok(),
                        recv(stop_rx) -> _ => false,
                    };
                    if !woke {
                        break;
                    }

                    let n = ring.read_into(&mut block);
                    if n < block_len {
                        block[n..].fill(0);
                        underrun_count.fetch_add(1, Ordering::Relaxed);
                    }

                    if let Err(e) = sink.accept_block(&block) {
                        tracing::error!("Playback failed: {}", e);
                        break;
                    }
                    played.fetch_add(n as u64, Ordering::Relaxed);
                }

                running_for_loop.store(false, Ordering::SeqCst);
            })?;

        Ok(Self {
            running,
            stop_tx: Some(stop_tx),
            thread_handle: Some(handle),
            samples_played,
            underruns,
        })
    }

    /// Stop playback and join the thread
    pub fn stop(&mut self) {
        self.stop_tx.take();

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Samples taken from the ring, excluding silence padding
    pub fn samples_played(&self) -> u64 {
        self.samples_played.load(Ordering::Relaxed)
    }

    /// Ticks on which the ring held less than a full block
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Shared handle on the underrun count, for a loop that reports it
    pub fn underrun_counter(&self) -> Arc<AtomicU64> {
        self.underruns.clone()
    }
}

impl Drop for PlaybackTask {
    fn drop(&mut self) {
        self.stop();
    }
}
