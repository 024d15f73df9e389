//! Sequence-based loss detection and repetition concealment

use crate::protocol::frame::SequenceWidth;

/// How a received sequence number relates to the stream position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Next expected frame, the first frame, or a sender restart at zero
    Fresh,
    /// Duplicate of the last accepted frame
    Repeated,
    /// Behind the accepted position; a late or reordered arrival
    Stale,
    /// Ahead of the expected frame; this many frames are presumed lost
    Gap(u32),
}

impl Classification {
    /// Whether the frame moves the stream forward
    pub fn is_accepted(&self) -> bool {
        matches!(self, Classification::Fresh | Classification::Gap(_))
    }
}

/// Tracks the last accepted sequence number of one peer/channel stream.
///
/// Differences are taken modulo the sequence width. A forward distance of
/// more than half the sequence space is read as a step backwards, which is
/// how a stale frame is told apart from a wrapped counter.
#[derive(Debug, Clone)]
pub struct LossTracker {
    width: SequenceWidth,
    last_accepted: Option<u32>,
    missed: u64,
    repeated: u64,
    stale: u64,
}

impl LossTracker {
    pub fn new(width: SequenceWidth) -> Self {
        Self {
            width,
            last_accepted: None,
            missed: 0,
            repeated: 0,
            stale: 0,
        }
    }

    /// Classify `seq` and advance the stream position on `Fresh` or `Gap`.
    pub fn classify(&mut self, seq: u32) -> Classification {
        let mask = self.width.mask();
        let seq = seq & mask;

        let class = match self.last_accepted {
            None => Classification::Fresh,
            Some(last) => {
                let diff = seq.wrapping_sub(last) & mask;
                let half = mask / 2 + 1;

                if diff == 0 {
                    Classification::Repeated
                } else if diff == 1 || seq == 0 {
                    Classification::Fresh
                } else if diff >= half {
                    Classification::Stale
                } else {
                    Classification::Gap(diff - 1)
                }
            }
        };

        match class {
            Classification::Fresh => self.last_accepted = Some(seq),
            Classification::Gap(n) => {
                self.missed += u64::from(n);
                self.last_accepted = Some(seq);
            }
            Classification::Repeated => self.repeated += 1,
            Classification::Stale => self.stale += 1,
        }

        class
    }

    pub fn last_accepted(&self) -> Option<u32> {
        self.last_accepted
    }

    /// Frames presumed lost over the tracker's lifetime
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn repeated(&self) -> u64 {
        self.repeated
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.width);
    }
}

/// Decides how much of each payload is admitted to the playback ring.
///
/// In steady state only the first half of a payload is admitted. After a gap
/// the whole payload is admitted, so the repeated half covers the lost
/// interval. The window returns to a single half on the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concealment {
    payload_samples: usize,
}

impl Concealment {
    pub fn new(payload_samples: usize) -> Self {
        Self { payload_samples }
    }

    /// Steady-state admission window
    pub fn half(&self) -> usize {
        self.payload_samples / 2
    }

    /// Samples to admit for a frame with this classification, if any
    pub fn admit_len(&self, class: Classification) -> Option<usize> {
        match class {
            Classification::Fresh => Some(self.half()),
            Classification::Gap(_) => Some(self.payload_samples),
            Classification::Repeated | Classification::Stale => None,
        }
    }
}
