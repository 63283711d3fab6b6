//! Capture/playback processing engine (spec §4.5): gain, noise gate, AGC,
//! peak metering and PTT gating on the way in; volume, mute and underrun
//! handling on the way out.
//!
//! The teacher's `audio.rs` callback (`build_input_stream`'s `make_callback`)
//! runs once per CPAL buffer and copies raw bytes straight into a pooled
//! buffer with no signal processing; here the same per-callback-block shape
//! is kept; the block moves through gain/gate/AGC math instead of a raw copy.

use crate::audio::ring::AudioRing;
use crate::config::{
    AGC_ATTACK_RATE, AGC_GAIN_MAX, AGC_GAIN_MIN, AGC_RELEASE_RATE, AGC_TARGET_RMS,
    DEFAULT_GAIN_PERCENT, DEFAULT_NOISE_GATE_THRESHOLD, FRAME_SAMPLES,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};

/// Slide-switch position governing when the transmitter may be active
/// (spec §4.5/§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttMode {
    /// Transmit continuously, ignoring the momentary button.
    Always,
    /// Transmit only while the momentary button is held.
    Ptt,
    /// Never transmit.
    Muted,
}

/// Metrics reported alongside each processed capture block, for level
/// meters and diagnostics (spec §4.5 "peak-metering").
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureMetrics {
    pub rms: f32,
    pub peak: i16,
    pub gated: bool,
    pub agc_gain: f32,
}

fn block_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    ((sum_sq / samples.len() as f64).sqrt()) as f32
}

fn block_peak(samples: &[i16]) -> i16 {
    samples.iter().map(|&s| s.unsigned_abs()).max().unwrap_or(0) as i16
}

/// Capture-side processing chain: gain → noise gate → AGC → (callback |
/// ring), plus the PTT-gating decision (spec §4.5).
pub struct CaptureEngine {
    input_gain_percent: AtomicU8,
    noise_gate_enabled: AtomicBool,
    noise_gate_threshold: AtomicI32,
    agc_enabled: AtomicBool,
    agc_gain: Mutex<f32>,
    ptt_mode: Mutex<PttMode>,
    button_held: AtomicBool,
}

impl CaptureEngine {
    pub fn new() -> Self {
        Self {
            input_gain_percent: AtomicU8::new(DEFAULT_GAIN_PERCENT),
            noise_gate_enabled: AtomicBool::new(false),
            noise_gate_threshold: AtomicI32::new(DEFAULT_NOISE_GATE_THRESHOLD),
            agc_enabled: AtomicBool::new(false),
            agc_gain: Mutex::new(1.0),
            ptt_mode: Mutex::new(PttMode::Ptt),
            button_held: AtomicBool::new(false),
        }
    }

    pub fn set_input_gain_percent(&self, percent: u8) {
        self.input_gain_percent.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn set_noise_gate(&self, enabled: bool, threshold: i32) {
        self.noise_gate_enabled.store(enabled, Ordering::Relaxed);
        self.noise_gate_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn set_agc(&self, enabled: bool) {
        self.agc_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn set_ptt_mode(&self, mode: PttMode) {
        *self.ptt_mode.lock() = mode;
    }

    pub fn set_button_held(&self, held: bool) {
        self.button_held.store(held, Ordering::Relaxed);
    }

    /// Whether the transmitter should be active right now (spec §4.5):
    /// ALWAYS transmits unconditionally, PTT only while the button is held,
    /// MUTED never transmits.
    pub fn is_transmitting(&self) -> bool {
        match *self.ptt_mode.lock() {
            PttMode::Always => true,
            PttMode::Ptt => self.button_held.load(Ordering::Relaxed),
            PttMode::Muted => false,
        }
    }

    /// Process one 20 ms capture block in place: gain, noise gate, AGC, in
    /// that order (spec §4.5 steps i-iv). Returns the level metrics for the
    /// processed block regardless of whether transmission is gated off —
    /// metering runs even while muted so the operator still sees input
    /// level.
    pub fn process(&self, samples: &mut [i16; FRAME_SAMPLES]) -> CaptureMetrics {
        let gain = self.input_gain_percent.load(Ordering::Relaxed) as f32 / 100.0;
        if (gain - 1.0).abs() > f32::EPSILON {
            for s in samples.iter_mut() {
                *s = (*s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }

        let rms = block_rms(samples);
        let peak = block_peak(samples);

        let gated = self.noise_gate_enabled.load(Ordering::Relaxed)
            && rms < self.noise_gate_threshold.load(Ordering::Relaxed) as f32;
        if gated {
            samples.fill(0);
        }

        let mut agc_gain = *self.agc_gain.lock();
        if self.agc_enabled.load(Ordering::Relaxed) && !gated && rms > 0.0 {
            let target_gain = (AGC_TARGET_RMS / rms).clamp(AGC_GAIN_MIN, AGC_GAIN_MAX);
            let rate = if target_gain < agc_gain {
                AGC_ATTACK_RATE
            } else {
                AGC_RELEASE_RATE
            };
            agc_gain += (target_gain - agc_gain) * rate;
            agc_gain = agc_gain.clamp(AGC_GAIN_MIN, AGC_GAIN_MAX);
            *self.agc_gain.lock() = agc_gain;
            for s in samples.iter_mut() {
                *s = (*s as f32 * agc_gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            }
        }

        CaptureMetrics { rms, peak, gated, agc_gain }
    }
}

impl Default for CaptureEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Playback-side processing: volume, mute, underrun-to-silence (spec §4.5).
pub struct PlaybackEngine {
    volume_percent: AtomicU8,
    muted: AtomicBool,
    underruns: AtomicU64,
}

impl PlaybackEngine {
    pub fn new() -> Self {
        Self {
            volume_percent: AtomicU8::new(DEFAULT_GAIN_PERCENT),
            muted: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
        }
    }

    pub fn set_volume_percent(&self, percent: u8) {
        self.volume_percent.store(percent.min(100), Ordering::Relaxed);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Pull the next frame's samples off `ring`, scaled by volume and muted
    /// if set. Writes silence and counts an underrun if the ring has
    /// nothing ready (spec §4.5).
    pub fn pull(&self, ring: &AudioRing) -> [i16; FRAME_SAMPLES] {
        let frame = match ring.pop() {
            Some(frame) => frame,
            None => {
                self.underruns.fetch_add(1, Ordering::Relaxed);
                return [0i16; FRAME_SAMPLES];
            }
        };

        if self.muted.load(Ordering::Relaxed) {
            return [0i16; FRAME_SAMPLES];
        }

        let volume = self.volume_percent.load(Ordering::Relaxed) as f32 / 100.0;
        let mut out = [0i16; FRAME_SAMPLES];
        for (dst, src) in out.iter_mut().zip(frame.samples.iter()) {
            *dst = (*src as f32 * volume).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        }
        out
    }
}

impl Default for PlaybackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::ring::AudioFrame;
    use pretty_assertions::assert_eq;

    #[test]
    fn ptt_mode_always_transmits_without_button() {
        let engine = CaptureEngine::new();
        engine.set_ptt_mode(PttMode::Always);
        assert!(engine.is_transmitting());
    }

    #[test]
    fn ptt_mode_ptt_requires_held_button() {
        let engine = CaptureEngine::new();
        engine.set_ptt_mode(PttMode::Ptt);
        assert!(!engine.is_transmitting());
        engine.set_button_held(true);
        assert!(engine.is_transmitting());
        engine.set_button_held(false);
        assert!(!engine.is_transmitting());
    }

    #[test]
    fn ptt_mode_muted_never_transmits() {
        let engine = CaptureEngine::new();
        engine.set_ptt_mode(PttMode::Muted);
        engine.set_button_held(true);
        assert!(!engine.is_transmitting());
    }

    #[test]
    fn noise_gate_zeroes_quiet_blocks() {
        let engine = CaptureEngine::new();
        engine.set_noise_gate(true, 1000);
        let mut samples = [50i16; FRAME_SAMPLES];
        let metrics = engine.process(&mut samples);
        assert!(metrics.gated);
        assert!(samples.iter().all(|&s| s == 0));
    }

    #[test]
    fn noise_gate_passes_loud_blocks() {
        let engine = CaptureEngine::new();
        engine.set_noise_gate(true, 100);
        let mut samples = [5000i16; FRAME_SAMPLES];
        let metrics = engine.process(&mut samples);
        assert!(!metrics.gated);
        assert!(samples.iter().any(|&s| s != 0));
    }

    #[test]
    fn agc_pulls_quiet_signal_toward_target_over_several_blocks() {
        let engine = CaptureEngine::new();
        engine.set_agc(true);
        let mut last_gain = 1.0;
        for _ in 0..50 {
            let mut samples = [200i16; FRAME_SAMPLES];
            let metrics = engine.process(&mut samples);
            last_gain = metrics.agc_gain;
        }
        assert!(last_gain > 1.0, "gain should have risen toward the target: {last_gain}");
        assert!(last_gain <= AGC_GAIN_MAX);
    }

    #[test]
    fn input_gain_scales_samples() {
        let engine = CaptureEngine::new();
        engine.set_input_gain_percent(50);
        let mut samples = [1000i16; FRAME_SAMPLES];
        engine.process(&mut samples);
        assert_eq!(samples[0], 500);
    }

    #[test]
    fn playback_underrun_on_empty_ring_writes_silence_and_counts() {
        let ring = AudioRing::new();
        let playback = PlaybackEngine::new();
        let out = playback.pull(&ring);
        assert!(out.iter().all(|&s| s == 0));
        assert_eq!(playback.underruns(), 1);
    }

    #[test]
    fn playback_mute_silences_available_frame() {
        let ring = AudioRing::new();
        ring.set_jitter_depth(1);
        ring.push(AudioFrame::from_samples(0, 0, &[1234i16; FRAME_SAMPLES]));
        let playback = PlaybackEngine::new();
        playback.set_muted(true);
        let out = playback.pull(&ring);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn playback_volume_scales_output() {
        let ring = AudioRing::new();
        ring.set_jitter_depth(1);
        ring.push(AudioFrame::from_samples(0, 0, &[1000i16; FRAME_SAMPLES]));
        let playback = PlaybackEngine::new();
        playback.set_volume_percent(50);
        let out = playback.pull(&ring);
        assert_eq!(out[0], 500);
    }
}
