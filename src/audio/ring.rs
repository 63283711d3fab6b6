//! SPSC audio ring (spec §3 "Audio frame", §4.4): a lock-free ring of
//! timestamped PCM frames with jitter pre-roll and sequence-gap accounting.
//!
//! The ring itself needs no mutex between producer and consumer (spec §5),
//! unlike the teacher's `AudioBufferPool` (`buffers.rs`), which pools
//! `Mutex<Vec<u8>>` buffers behind a free-list channel because it's shared
//! by many threads. Here there is exactly one writer and one reader per
//! ring, so two atomic indices are enough.

use crate::config::{AUDIO_RING_CAPACITY, DEFAULT_JITTER_DEPTH, FRAME_SAMPLES};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// One 20 ms PCM frame plus its sequence and capture timestamp (spec §3).
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub sequence: u16,
    pub timestamp_ms: u32,
    pub len: usize,
    pub samples: [i16; FRAME_SAMPLES],
}

impl AudioFrame {
    pub fn silence(sequence: u16, timestamp_ms: u32) -> Self {
        Self {
            sequence,
            timestamp_ms,
            len: FRAME_SAMPLES,
            samples: [0i16; FRAME_SAMPLES],
        }
    }

    pub fn from_samples(sequence: u16, timestamp_ms: u32, samples: &[i16]) -> Self {
        let mut buf = [0i16; FRAME_SAMPLES];
        let len = samples.len().min(FRAME_SAMPLES);
        buf[..len].copy_from_slice(&samples[..len]);
        Self {
            sequence,
            timestamp_ms,
            len,
            samples: buf,
        }
    }
}

/// Counters exposed for diagnostics (spec §8 invariant: `written = read +
/// current_count + dropped`).
#[derive(Debug, Default, Clone, Copy)]
pub struct RingStats {
    pub written: u64,
    pub read: u64,
    pub dropped: u64,
    pub underruns: u64,
}

struct Slot {
    occupied: std::sync::atomic::AtomicBool,
    frame: parking_lot::Mutex<Option<AudioFrame>>,
}

/// Lock-free (for the hot path) single-producer/single-consumer ring of
/// `AUDIO_RING_CAPACITY` frames.
///
/// The per-slot `Mutex<Option<AudioFrame>>` guards only payload storage, not
/// coordination: coordination (who may read/write which index) is entirely
/// the two atomic cursors below, so producer and consumer never contend
/// with each other on the same slot at the same time by construction. A
/// `parking_lot::Mutex` is used here rather than genuinely unsafe shared
/// memory because `AudioFrame` is larger than a machine word and Rust gives
/// no safe way to swap it atomically; this keeps the "writer never
/// overwrites unread data" contract (spec §4.4) intact without `unsafe`.
pub struct AudioRing {
    slots: Vec<Slot>,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    last_sequence: AtomicU64,
    has_last_sequence: std::sync::atomic::AtomicBool,
    last_received: AtomicU64,
    has_last_received: std::sync::atomic::AtomicBool,
    written: AtomicU64,
    read: AtomicU64,
    dropped: AtomicU64,
    underruns: AtomicU64,
    jitter_depth: AtomicUsize,
    jitter_ready: std::sync::atomic::AtomicBool,
}

impl AudioRing {
    pub fn new() -> Self {
        Self::with_capacity(AUDIO_RING_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                occupied: std::sync::atomic::AtomicBool::new(false),
                frame: parking_lot::Mutex::new(None),
            });
        }
        Self {
            slots,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            last_sequence: AtomicU64::new(0),
            has_last_sequence: std::sync::atomic::AtomicBool::new(false),
            last_received: AtomicU64::new(0),
            has_last_received: std::sync::atomic::AtomicBool::new(false),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            jitter_depth: AtomicUsize::new(DEFAULT_JITTER_DEPTH),
            jitter_ready: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_jitter_depth(&self, depth: usize) {
        self.jitter_depth.store(depth.max(1), Ordering::Relaxed);
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn fill(&self) -> usize {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Acquire);
        (w + self.capacity() - r) % self.capacity()
    }

    /// Enqueue a frame exactly as given, preserving its `sequence` field.
    /// Used for frames already sequenced by a remote sender (spec §4.6:
    /// inbound voice is routed straight onto the owning slot's ring) —
    /// pair with [`note_received`] for gap accounting on this path. Never
    /// overwrites unread data: if the ring is full, the frame is dropped
    /// and `dropped` increments.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Acquire);
        let next_w = (w + 1) % self.capacity();
        if next_w == r {
            // ring full (this cursor scheme holds capacity - 1 usable
            // frames); never overwrite unread data.
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        *self.slots[w].frame.lock() = Some(frame);
        self.slots[w].occupied.store(true, Ordering::Release);
        self.write_idx.store(next_w, Ordering::Release);
        self.written.fetch_add(1, Ordering::Relaxed);

        if self.fill() >= self.jitter_depth.load(Ordering::Relaxed) {
            self.jitter_ready.store(true, Ordering::Release);
        }
        true
    }

    /// Enqueue a locally captured frame, assigning its sequence as
    /// `last + 1` (spec §4.4: "on each write, the frame's sequence is set
    /// to (last+1)"). Used by the capture/encode side of the pipeline,
    /// where this ring IS the authority for the sequence stream.
    pub fn push_captured(&self, timestamp_ms: u32, samples: &[i16]) -> bool {
        let seq = self.next_sequence();
        self.push(AudioFrame::from_samples(seq, timestamp_ms, samples))
    }

    fn next_sequence(&self) -> u16 {
        let seq = if self.has_last_sequence.swap(true, Ordering::AcqRel) {
            (self.last_sequence.load(Ordering::Relaxed) as u16).wrapping_add(1)
        } else {
            0
        };
        self.last_sequence.store(seq as u64, Ordering::Relaxed);
        seq
    }

    /// Consumer side. Returns `None` on empty (and bumps `underruns`) or
    /// while the jitter gate hasn't armed yet (spec §4.4: a reader observes
    /// `ready=false` until `fill >= jitter_depth`; once ready it stays ready
    /// until empty, then re-arms).
    pub fn pop(&self) -> Option<AudioFrame> {
        if !self.jitter_ready.load(Ordering::Acquire) {
            return None;
        }

        let r = self.read_idx.load(Ordering::Acquire);
        let w = self.write_idx.load(Ordering::Acquire);
        if r == w {
            self.underruns.fetch_add(1, Ordering::Relaxed);
            self.jitter_ready.store(false, Ordering::Release);
            return None;
        }

        let frame = self.slots[r].frame.lock().take();
        self.slots[r].occupied.store(false, Ordering::Release);
        let next_r = (r + 1) % self.capacity();
        self.read_idx.store(next_r, Ordering::Release);
        self.read.fetch_add(1, Ordering::Relaxed);

        if next_r == self.write_idx.load(Ordering::Acquire) {
            // draining to empty re-arms the gate for the next pre-roll.
            self.jitter_ready.store(false, Ordering::Release);
        }
        frame
    }

    /// Whether the jitter gate is currently open, without consuming a frame.
    pub fn is_ready(&self) -> bool {
        self.jitter_ready.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            written: self.written.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
        }
    }

    /// Gap detection for frames arriving off the network (spec §4.4): given
    /// a frame carrying sequence `s`, reports how many frames were missed
    /// since the last one observed, and advances the "last received"
    /// bookmark used for this accounting (distinct from `next_sequence`'s
    /// own producer-side counter).
    pub fn note_received(&self, seq: u16) -> u16 {
        if !self.has_last_received.swap(true, Ordering::AcqRel) {
            self.last_received.store(seq as u64, Ordering::Relaxed);
            return 0;
        }
        let last = self.last_received.load(Ordering::Relaxed) as u16;
        let gap = seq.wrapping_sub(last).wrapping_sub(1);
        self.last_received.store(seq as u64, Ordering::Relaxed);
        gap
    }
}

impl Default for AudioRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn sequences_increase_by_one_on_every_enqueue() {
        let ring = AudioRing::new();
        ring.set_jitter_depth(1);
        for i in 0..10 {
            ring.push_captured(0, &[0i16; FRAME_SAMPLES]);
            let got = ring.pop().unwrap();
            assert_eq!(got.sequence, i);
        }
    }

    #[test]
    fn writing_then_reading_n_frames_empties_ring_in_order() {
        let ring = AudioRing::with_capacity(8);
        ring.set_jitter_depth(1);
        for _ in 0..5 {
            assert!(ring.push_captured(0, &[0i16; FRAME_SAMPLES]));
        }
        let mut seqs = vec![];
        while let Some(f) = ring.pop() {
            seqs.push(f.sequence);
        }
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        let stats = ring.stats();
        assert_eq!(stats.written, stats.read + stats.dropped);
    }

    #[test]
    fn full_ring_drops_without_corrupting_existing_frames() {
        let ring = AudioRing::with_capacity(4);
        ring.set_jitter_depth(1);
        for _ in 0..3 {
            assert!(ring.push_captured(0, &[0i16; FRAME_SAMPLES]));
        }
        // capacity 4 with this cursor scheme holds 3 usable frames.
        assert!(!ring.push_captured(0, &[0i16; FRAME_SAMPLES]));
        assert_eq!(ring.stats().dropped, 1);
        let first = ring.pop().unwrap();
        assert_eq!(first.sequence, 0);
    }

    #[test]
    fn jitter_gate_waits_for_preroll_depth() {
        let ring = AudioRing::new();
        ring.set_jitter_depth(3);
        ring.push_captured(0, &[0i16; FRAME_SAMPLES]);
        ring.push_captured(0, &[0i16; FRAME_SAMPLES]);
        assert!(ring.pop().is_none());
        ring.push_captured(0, &[0i16; FRAME_SAMPLES]);
        assert!(ring.is_ready());
        assert_eq!(ring.pop().unwrap().sequence, 0);
        assert_eq!(ring.pop().unwrap().sequence, 1);
        assert_eq!(ring.pop().unwrap().sequence, 2);
    }

    #[test]
    fn gap_detection_reports_missing_frames_and_zero_on_wrap() {
        let ring = AudioRing::new();
        assert_eq!(ring.note_received(10), 0); // first observation, no gap
        assert_eq!(ring.note_received(13), 2); // missed 11, 12
        assert_eq!(ring.note_received(0xFFFF), (0xFFFFu16).wrapping_sub(13).wrapping_sub(1));
        assert_eq!(ring.note_received(0x0000), 0); // wrap is a zero gap
    }

    #[test]
    fn invariant_written_equals_read_plus_fill_plus_dropped() {
        let ring = AudioRing::with_capacity(8);
        ring.set_jitter_depth(1);
        for _ in 0..6 {
            ring.push(AudioFrame::silence(0, 0));
        }
        ring.pop();
        ring.pop();
        let stats = ring.stats();
        let fill = ring.fill();
        assert_eq!(stats.written, stats.read + fill as u64 + stats.dropped);
    }

    #[test]
    fn sixty_five_thousand_enqueues_replay_without_reordering() {
        let ring = AudioRing::with_capacity(64);
        ring.set_jitter_depth(1);
        let mut next_expected: u32 = 0;
        for _ in 0..65_536u32 {
            ring.push_captured(0, &[0i16; FRAME_SAMPLES]);
            let got = ring.pop().unwrap();
            assert_eq!(got.sequence as u32, next_expected % 65_536);
            next_expected += 1;
        }
    }
}
