//! Real-time audio pipeline (spec §4.4/§4.5): ring buffer plus the
//! capture/playback processing engine built on top of it.

pub mod engine;
pub mod ring;

pub use engine::{CaptureEngine, PlaybackEngine, PttMode};
pub use ring::{AudioFrame, AudioRing, RingStats};
