//! Lock-free sample ring for 16-bit mono audio
//!
//! Single-producer single-consumer circular buffer that decouples the
//! capture/playback cadence from network timing. Writing into a full ring
//! overwrites the oldest unread sample instead of blocking, so the producer
//! side never stalls on a slow consumer.

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicI16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::RingError;

/// Signed 16-bit PCM sample
pub type Sample = i16;

/// Upper bound on a single condvar sleep while waiting for samples.
/// Producers notify without taking the wait lock, so a wakeup can be missed;
/// sleeping in short slices bounds the cost of that.
const WAIT_SLICE: Duration = Duration::from_millis(1);

/// Fixed-capacity circular sample buffer.
///
/// `write` and `read` may run concurrently from different threads as long as
/// there is exactly one writer and one reader.
pub struct SampleRing {
    /// Backing storage, length is a power of two
    buffer: Box<[AtomicI16]>,
    /// `capacity - 1`, used to map a cursor to a slot
    mask: usize,
    /// Monotonic write cursor, advanced only by the producer
    write: CachePadded<AtomicUsize>,
    /// Monotonic read cursor, advanced by the consumer and by the producer
    /// when it overwrites the oldest sample
    read: CachePadded<AtomicUsize>,
    wait_lock: Mutex<()>,
    ready: Condvar,
}

impl SampleRing {
    /// Create a zeroed ring with the given capacity in samples.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        Self::from_storage(vec![0; capacity])
    }

    /// Create a ring over caller-supplied backing storage.
    ///
    /// The storage length is the capacity and must be a power of two.
    pub fn from_storage(storage: Vec<Sample>) -> Result<Self, RingError> {
        let capacity = storage.len();
        if !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }

        let buffer = storage.into_iter().map(AtomicI16::new).collect();

        Ok(Self {
            buffer,
            mask: capacity - 1,
            write: CachePadded::new(AtomicUsize::new(0)),
            read: CachePadded::new(AtomicUsize::new(0)),
            wait_lock: Mutex::new(()),
            ready: Condvar::new(),
        })
    }

    /// Zero both cursors. Only valid while neither side is running.
    pub fn reset(&self) {
        self.read.store(0, Ordering::SeqCst);
        self.write.store(0, Ordering::SeqCst);
    }

    /// Write one sample, overwriting the oldest unread sample when full.
    #[inline]
    pub fn write(&self, sample: Sample) {
        let w = self.write.load(Ordering::Relaxed);
        let r = self.read.load(Ordering::Acquire);

        if w.wrapping_sub(r) >= self.capacity() {
            // Drop the oldest sample. Losing the race means the consumer
            // already freed a slot.
            let _ = self.read.compare_exchange(
                r,
                r.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }

        self.buffer[w & self.mask].store(sample, Ordering::Relaxed);
        self.write.store(w.wrapping_add(1), Ordering::Release);
    }

    /// Write a block of samples in order and wake any waiting reader.
    pub fn write_bulk(&self, samples: &[Sample]) {
        for &sample in samples {
            self.write(sample);
        }
        self.ready.notify_all();
    }

    /// Read the oldest sample.
    ///
    /// Reading an empty ring is reported as [`RingError::Empty`].
    #[inline]
    pub fn read(&self) -> Result<Sample, RingError> {
        loop {
            let r = self.read.load(Ordering::Acquire);
            let w = self.write.load(Ordering::Acquire);
            if r == w {
                return Err(RingError::Empty);
            }

            let sample = self.buffer[r & self.mask].load(Ordering::Relaxed);

            // A failed exchange means the producer overwrote this slot.
            if self
                .read
                .compare_exchange(r, r.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(sample);
            }
        }
    }

    /// Read up to `out.len()` samples, returning how many were read.
    pub fn read_into(&self, out: &mut [Sample]) -> usize {
        for (i, slot) in out.iter_mut().enumerate() {
            match self.read() {
                Ok(sample) => *slot = sample,
                Err(_) => return i,
            }
        }
        out.len()
    }

    /// Block until at least `n` samples are buffered or `timeout` elapses.
    ///
    /// Returns whether `n` samples are available.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.wait_lock.lock();

        while self.len() < n {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            self.ready.wait_for(&mut guard, slice);
        }
        true
    }

    /// Number of unread samples
    #[inline]
    pub fn len(&self) -> usize {
        // Load the read cursor first: it never passes the write cursor, so
        // the difference can only overestimate and is clamped.
        let r = self.read.load(Ordering::Acquire);
        let w = self.write.load(Ordering::Acquire);
        w.wrapping_sub(r).min(self.capacity())
    }

    /// Free slots before the next write overwrites unread data
    #[inline]
    pub fn avail(&self) -> usize {
        self.capacity() - self.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read.load(Ordering::Acquire) == self.write.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}

impl std::fmt::Debug for SampleRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleRing")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

/// Thread-safe handle to a sample ring
pub type SharedRing = Arc<SampleRing>;

/// Create a new shared sample ring
pub fn create_shared_ring(capacity: usize) -> Result<SharedRing, RingError> {
    SampleRing::new(capacity).map(Arc::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    #[test]
    fn test_ring_basic() {
        let ring = SampleRing::new(4).unwrap();
        assert!(ring.is_empty());
        assert_eq!(ring.avail(), 4);

        ring.write(1);
        ring.write(2);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.avail(), 2);

        assert_eq!(ring.read(), Ok(1));
        assert_eq!(ring.read(), Ok(2));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert_eq!(
            SampleRing::new(6).unwrap_err(),
            RingError::InvalidCapacity(6)
        );
        assert_eq!(
            SampleRing::new(0).unwrap_err(),
            RingError::InvalidCapacity(0)
        );
        assert!(SampleRing::from_storage(vec![0; 1024]).is_ok());
    }

    #[test]
    fn test_read_empty_is_error() {
        let ring = SampleRing::new(8).unwrap();
        assert_eq!(ring.read(), Err(RingError::Empty));

        ring.write(7);
        assert_eq!(ring.read(), Ok(7));
        assert_eq!(ring.read(), Err(RingError::Empty));
    }

    #[test]
    fn test_overwrites_oldest_when_full() {
        let ring = SampleRing::new(4).unwrap();
        ring.write_bulk(&[1, 2, 3, 4, 5, 6]);

        assert!(ring.is_full());
        assert_eq!(ring.len(), 4);

        let mut out = [0; 4];
        assert_eq!(ring.read_into(&mut out), 4);
        assert_eq!(out, [3, 4, 5, 6]);
    }

    #[test]
    fn test_reset() {
        let ring = SampleRing::new(4).unwrap();
        ring.write_bulk(&[1, 2, 3]);
        ring.reset();
        assert!(ring.is_empty());
        assert_eq!(ring.read(), Err(RingError::Empty));
    }

    #[test]
    fn test_wait_for_times_out() {
        let ring = SampleRing::new(16).unwrap();
        ring.write_bulk(&[0; 4]);
        assert!(ring.wait_for(4, Duration::from_millis(1)));
        assert!(!ring.wait_for(8, Duration::from_millis(5)));
    }

    #[test]
    fn test_wait_for_wakes_on_write() {
        let ring = create_shared_ring(64).unwrap();
        let producer = ring.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            producer.write_bulk(&[1; 48]);
        });

        assert!(ring.wait_for(48, Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_concurrent_spsc_preserves_order() {
        let ring = create_shared_ring(256).unwrap();
        let producer = ring.clone();

        let writer = thread::spawn(move || {
            for chunk in (0..20_000i16).collect::<Vec<_>>().chunks(32) {
                producer.write_bulk(chunk);
            }
        });

        let mut last = -1i32;
        let mut reads = 0usize;
        while !writer.is_finished() || !ring.is_empty() {
            if let Ok(sample) = ring.read() {
                // Overwrites may skip samples, never reorder or repeat them
                assert!(i32::from(sample) > last, "{} after {}", sample, last);
                last = i32::from(sample);
                reads += 1;
            }
        }
        writer.join().unwrap();

        assert!(reads > 0);
        assert!(ring.len() <= ring.capacity());
    }

    proptest! {
        #[test]
        fn prop_size_matches_model(ops in prop::collection::vec(any::<Option<i16>>(), 0..400)) {
            let ring = SampleRing::new(16).unwrap();
            let mut model = std::collections::VecDeque::new();

            for op in ops {
                match op {
                    Some(sample) => {
                        ring.write(sample);
                        if model.len() == 16 {
                            model.pop_front();
                        }
                        model.push_back(sample);
                    }
                    None => {
                        let expected = model.pop_front().ok_or(RingError::Empty);
                        prop_assert_eq!(ring.read(), expected);
                    }
                }
                prop_assert!(ring.len() <= ring.capacity());
                prop_assert_eq!(ring.len(), model.len());
            }
        }

        #[test]
        fn prop_keeps_last_n(extra in 0usize..100) {
            let ring = SampleRing::new(32).unwrap();
            let written: Vec<i16> = (0..(32 + extra) as i16).collect();
            ring.write_bulk(&written);

            let mut out = [0; 32];
            prop_assert_eq!(ring.read_into(&mut out), 32);
            prop_assert_eq!(&out[..], &written[extra..]);
        }
    }
}
