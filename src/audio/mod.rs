//! Audio subsystem module

pub mod playback;
pub mod ring;
pub mod source;

pub use playback::{NullSink, PlaybackSink, PlaybackTask, RawPcmSink};
pub use ring::{create_shared_ring, Sample, SampleRing, SharedRing};
pub use source::{build_source, CaptureTask, RawPcmSource, SampleSource, SineGenerator};
