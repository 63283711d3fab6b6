//! Tunables centralized the way the teacher centralizes `DEFAULT_BUFFER_SIZE`
//! in `buffers.rs`, instead of scattering magic numbers through the core.

use std::time::Duration;

/// Number of dial positions (spec §1/§4.7).
pub const MAX_SLOTS: usize = 15;

/// Compile-time bound on a frequency's member list (spec §3).
pub const MAX_FREQUENCY_MEMBERS: usize = 100;

/// Audio ring capacity in frames (spec §4.4).
pub const AUDIO_RING_CAPACITY: usize = 32;

/// Default jitter pre-roll depth in frames == 60 ms at 20 ms/frame (spec §4.4).
pub const DEFAULT_JITTER_DEPTH: usize = 3;

/// Samples per audio frame: 20 ms at 8 kHz (spec §3/§6).
pub const FRAME_SAMPLES: usize = 160;

/// Capture/playback sample rate (spec §6).
pub const SAMPLE_RATE_HZ: u32 = 8000;

/// Maximum packet size on the wire, header included.
///
/// Spec §3 states a 512-byte ceiling, but spec §4.1 separately contracts
/// `Link::send` to `bytes <= 255` — the single-frame budget of the
/// physical transport every packet is actually handed to. Since nothing in
/// this crate moves bytes except through `Link::send`, the 255-byte
/// transport contract is the one fragmentation has to respect; the larger
/// figure is treated as describing a reassembled message's rough upper
/// bound rather than a single wire packet's. See DESIGN.md.
pub const MAX_PACKET_SIZE: usize = 255;

/// v2 fixed header length in bytes.
///
/// Spec §3 gives both a per-field byte table and a summary line ("Total
/// header: 24 bytes"); summing the table's own widths (2+1+1+1+1+2+8+2+1+1+4+4)
/// gives 28, not 24. The per-field table is authoritative here — it is what
/// the AAD rule and bit-exact wire compatibility (§6) actually bind — so the
/// header is 28 bytes and the summary line is treated as the typo. See
/// DESIGN.md.
pub const HEADER_LEN_V2: usize = 28;

/// legacy v1 fixed header length in bytes (spec §3).
pub const HEADER_LEN_V1: usize = 12;

/// Maximum payload bytes carried by a single fragment, after the v2 header.
pub const MAX_FRAGMENT_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_LEN_V2;

/// How long incomplete fragment sets are kept before being dropped (spec §4.2).
pub const REASSEMBLY_WINDOW: Duration = Duration::from_secs(2);

/// Call/join response wait (spec §4.6/§5).
pub const CALL_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Ack wait when `ack-required` is set (spec §5).
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Clear-channel-assessment probe window (spec §5).
pub const CAD_TIMEOUT: Duration = Duration::from_millis(100);

/// Deadline for a single link send (spec §5).
pub const LINK_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Sealed-packet count that forces a session key refresh (spec §4.3).
pub const KEY_PACKET_THRESHOLD: u64 = 1_000_000;

/// Wall-clock age that forces a session key refresh (spec §4.3).
pub const KEY_AGE_LIMIT: Duration = Duration::from_secs(3600);

/// PBKDF2-SHA256 iteration count for password-derived session keys (spec §4.3).
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Consecutive auth-fail/replay failures on a connected slot before a forced
/// rekey is attempted (spec §7).
pub const REKEY_FAILURE_LIMIT: u32 = 3;

/// Watchdog period for the slot-task liveness sweep (spec §7).
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(5);

/// Wire magic, little-endian on the wire (spec §3).
pub const WIRE_MAGIC: u16 = 0x5754;

/// AES-GCM/ChaCha-class tag length, used when sizing sealed buffers.
pub const AEAD_TAG_LEN: usize = 16;

/// AGC target RMS level (spec §4.5: "targeting an RMS of ~8000").
pub const AGC_TARGET_RMS: f32 = 8000.0;

/// AGC envelope clamp range (spec §4.5: "clamped to ×[0.25, 4.0]").
pub const AGC_GAIN_MIN: f32 = 0.25;
pub const AGC_GAIN_MAX: f32 = 4.0;

/// AGC envelope attack/release rates, applied per 20 ms block. Fast attack
/// (gain falls quickly when the signal is hot), slow release (gain climbs
/// back gradually once the signal quiets down), per spec §4.5.
pub const AGC_ATTACK_RATE: f32 = 0.5;
pub const AGC_RELEASE_RATE: f32 = 0.05;

/// Default noise-gate RMS threshold: blocks quieter than this are zeroed
/// when the gate is enabled (spec §4.5).
pub const DEFAULT_NOISE_GATE_THRESHOLD: i32 = 200;

/// Default capture input gain and playback volume, expressed as a percentage
/// (spec §4.7 volume rotary: 0-100).
pub const DEFAULT_GAIN_PERCENT: u8 = 100;
