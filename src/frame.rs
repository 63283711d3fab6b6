//! Frame codec (spec §3, §4.2): wire layout, integrity, and fragmentation.
//!
//! Packet building mirrors the teacher's manual byte-offset packing in
//! `server.rs::audio_multicast_loop` (`frame.extend_from_slice(...)` at fixed
//! offsets, header rebuilt once the true payload length is known) but
//! generalized to the full v2 header and checked on parse instead of being
//! assembled once and trusted.

use crate::config::{HEADER_LEN_V1, HEADER_LEN_V2, MAX_FRAGMENT_PAYLOAD, REASSEMBLY_WINDOW, WIRE_MAGIC};
use crate::error::Error;
use crate::ids::DeviceId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const CRC32_ISO_HDLC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
/// Legacy v1 uses CRC16-CCITT-FALSE (poly 0x1021, init 0xFFFF); the `crc`
/// crate calls this table `CRC_16_IBM_3740`.
const CRC16_CCITT: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_IBM_3740);

/// `channel` field (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Control = 0,
    Voice = 1,
    Priority = 2,
}

impl Channel {
    fn from_u8(v: u8) -> Result<Self, Error> {
        match v {
            0 => Ok(Channel::Control),
            1 => Ok(Channel::Voice),
            2 => Ok(Channel::Priority),
            other => Err(Error::UnknownMessageKind(other)),
        }
    }
}

/// Per-bit flags field (spec §3). Kept as discrete bools and packed/unpacked
/// by hand, matching the byte-level style the teacher uses for its own
/// header fields rather than pulling in a bitflags crate for eight bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags {
    pub encrypted: bool,
    pub compressed: bool,
    pub fragmented: bool,
    pub last_fragment: bool,
    pub ack_required: bool,
    pub retransmit: bool,
    pub priority: bool,
    pub broadcast: bool,
}

impl Flags {
    fn to_byte(self) -> u8 {
        (self.encrypted as u8)
            | (self.compressed as u8) << 1
            | (self.fragmented as u8) << 2
            | (self.last_fragment as u8) << 3
            | (self.ack_required as u8) << 4
            | (self.retransmit as u8) << 5
            | (self.priority as u8) << 6
            | (self.broadcast as u8) << 7
    }

    fn from_byte(b: u8) -> Self {
        Self {
            encrypted: b & 0x01 != 0,
            compressed: b & 0x02 != 0,
            fragmented: b & 0x04 != 0,
            last_fragment: b & 0x08 != 0,
            ack_required: b & 0x10 != 0,
            retransmit: b & 0x20 != 0,
            priority: b & 0x40 != 0,
            broadcast: b & 0x80 != 0,
        }
    }
}

/// Byte offsets within the 28-byte v2 header (see config.rs for the 24-vs-28
/// discrepancy note).
mod offset {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 2;
    pub const CHANNEL: usize = 3;
    pub const MSG_TYPE: usize = 4;
    pub const FLAGS: usize = 5;
    pub const SEQUENCE: usize = 6;
    pub const SRC_ID: usize = 8;
    pub const PAYLOAD_LEN: usize = 16;
    pub const FRAG_ID: usize = 18;
    pub const FRAG_COUNT: usize = 19;
    pub const TIMESTAMP: usize = 20;
    pub const INTEGRITY: usize = 24;
}

/// Parsed v2 header (spec §3). The payload itself is returned separately by
/// [`parse`] as a borrowed slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub channel: Channel,
    pub msg_type: u8,
    pub flags: Flags,
    pub sequence: u16,
    pub src_id: DeviceId,
    pub payload_len: u16,
    pub frag_id: u8,
    pub frag_count: u8,
    pub timestamp: u32,
}

/// Inputs needed to build a v2 packet (spec §4.2).
#[derive(Debug, Clone, Copy)]
pub struct BuildParams {
    pub channel: Channel,
    pub msg_type: u8,
    pub flags: Flags,
    pub sequence: u16,
    pub src_id: DeviceId,
    pub frag_id: u8,
    pub frag_count: u8,
    pub timestamp: u32,
}

/// Build one v2 packet, truncating the payload to the per-packet budget if
/// it doesn't fit (callers that want fragmentation should use [`fragment`]
/// instead of calling this directly with an oversized payload).
pub fn build(params: BuildParams, payload: &[u8]) -> Vec<u8> {
    let payload = &payload[..payload.len().min(MAX_FRAGMENT_PAYLOAD)];
    let mut buf = vec![0u8; HEADER_LEN_V2 + payload.len()];
    buf[offset::MAGIC..offset::MAGIC + 2].copy_from_slice(&WIRE_MAGIC.to_le_bytes());
    buf[offset::VERSION] = 2;
    buf[offset::CHANNEL] = params.channel as u8;
    buf[offset::MSG_TYPE] = params.msg_type;
    buf[offset::FLAGS] = params.flags.to_byte();
    buf[offset::SEQUENCE..offset::SEQUENCE + 2].copy_from_slice(&params.sequence.to_le_bytes());
    buf[offset::SRC_ID..offset::SRC_ID + 8].copy_from_slice(&params.src_id.to_wire());
    buf[offset::PAYLOAD_LEN..offset::PAYLOAD_LEN + 2]
        .copy_from_slice(&(payload.len() as u16).to_le_bytes());
    buf[offset::FRAG_ID] = params.frag_id;
    buf[offset::FRAG_COUNT] = params.frag_count;
    buf[offset::TIMESTAMP..offset::TIMESTAMP + 4].copy_from_slice(&params.timestamp.to_le_bytes());
    // integrity field (offset::INTEGRITY..+4) stays zeroed for the checksum pass
    buf[HEADER_LEN_V2..].copy_from_slice(payload);

    let crc = crc32_with_integrity_zeroed(&buf);
    buf[offset::INTEGRITY..offset::INTEGRITY + 4].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// CRC32 over the whole packet with the integrity field zeroed during
/// computation (spec §3/§4.2; this is also the AAD rule in §6 — the seal
/// call binds the same zeroed-integrity header bytes).
pub fn crc32_with_integrity_zeroed(packet: &[u8]) -> u32 {
    if packet.len() < offset::INTEGRITY + 4 {
        return CRC32_ISO_HDLC.checksum(packet);
    }
    let mut scratch = packet.to_vec();
    scratch[offset::INTEGRITY..offset::INTEGRITY + 4].fill(0);
    CRC32_ISO_HDLC.checksum(&scratch)
}

/// Parse a v2 packet, returning the header and a borrowed view of the
/// payload. Rejects short buffers, bad magic, wrong version, length
/// mismatch, and integrity mismatch, per spec §4.2. A recognized-but-stale
/// v1 packet is reported as [`Error::UnsupportedVersion`] once its own
/// magic/CRC16 check out, per spec §3.
pub fn parse(packet: &[u8]) -> Result<(Header, &[u8]), Error> {
    if packet.len() < HEADER_LEN_V1 {
        return Err(Error::ShortBuffer);
    }
    let magic = u16::from_le_bytes([packet[0], packet[1]]);
    if magic != WIRE_MAGIC {
        return Err(Error::BadMagic);
    }
    let version = packet[2];
    if version == 1 {
        return Err(parse_v1_enough_to_reject(packet));
    }
    if version != 2 {
        return Err(Error::UnsupportedVersion);
    }
    if packet.len() < HEADER_LEN_V2 {
        return Err(Error::ShortBuffer);
    }

    let channel = Channel::from_u8(packet[offset::CHANNEL])?;
    let msg_type = packet[offset::MSG_TYPE];
    let flags = Flags::from_byte(packet[offset::FLAGS]);
    let sequence = u16::from_le_bytes([packet[offset::SEQUENCE], packet[offset::SEQUENCE + 1]]);
    let mut src_bytes = [0u8; 8];
    src_bytes.copy_from_slice(&packet[offset::SRC_ID..offset::SRC_ID + 8]);
    let src_id = DeviceId::from_wire(&src_bytes)?;
    let payload_len = u16::from_le_bytes([packet[offset::PAYLOAD_LEN], packet[offset::PAYLOAD_LEN + 1]]);
    let frag_id = packet[offset::FRAG_ID];
    let frag_count = packet[offset::FRAG_COUNT];
    let timestamp = u32::from_le_bytes([
        packet[offset::TIMESTAMP],
        packet[offset::TIMESTAMP + 1],
        packet[offset::TIMESTAMP + 2],
        packet[offset::TIMESTAMP + 3],
    ]);
    let integrity = u32::from_le_bytes([
        packet[offset::INTEGRITY],
        packet[offset::INTEGRITY + 1],
        packet[offset::INTEGRITY + 2],
        packet[offset::INTEGRITY + 3],
    ]);

    if packet.len() != HEADER_LEN_V2 + payload_len as usize {
        return Err(Error::LengthMismatch);
    }
    if crc32_with_integrity_zeroed(packet) != integrity {
        return Err(Error::IntegrityMismatch);
    }

    let header = Header {
        version,
        channel,
        msg_type,
        flags,
        sequence,
        src_id,
        payload_len,
        frag_id,
        frag_count,
        timestamp,
    };
    Ok((header, &packet[HEADER_LEN_V2..]))
}

/// Offsets within the 12-byte legacy v1 header. v1 is decode-only: the spec
/// only requires recognizing it well enough to report `UnsupportedVersion`
/// (§3/§6), so this lays out just enough of a header to validate structure
/// and CRC16 before giving up — not full v1 message semantics.
mod offset_v1 {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 2;
    pub const MSG_TYPE: usize = 3;
    pub const SRC_ID: usize = 4;
    pub const PAYLOAD_LEN: usize = 8;
    pub const INTEGRITY: usize = 10;
}

fn parse_v1_enough_to_reject(packet: &[u8]) -> Error {
    if packet.len() < HEADER_LEN_V1 {
        return Error::ShortBuffer;
    }
    let payload_len = u16::from_le_bytes([
        packet[offset_v1::PAYLOAD_LEN],
        packet[offset_v1::PAYLOAD_LEN + 1],
    ]);
    if packet.len() != HEADER_LEN_V1 + payload_len as usize {
        return Error::LengthMismatch;
    }
    let integrity = u16::from_le_bytes([
        packet[offset_v1::INTEGRITY],
        packet[offset_v1::INTEGRITY + 1],
    ]);
    let mut scratch = packet.to_vec();
    scratch[offset_v1::INTEGRITY..offset_v1::INTEGRITY + 2].fill(0);
    if CRC16_CCITT.checksum(&scratch) != integrity {
        return Error::IntegrityMismatch;
    }
    Error::UnsupportedVersion
}

/// Split a payload across one or more v2 packets. A payload that fits in one
/// packet produces exactly one fragment with `last_fragment` set; anything
/// larger is split into `MAX_FRAGMENT_PAYLOAD`-sized chunks, all sharing
/// `sequence`, distinguished by `frag_id` (spec §4.2, §8 boundary case).
pub fn fragment(params: BuildParams, payload: &[u8]) -> Vec<Vec<u8>> {
    if payload.len() <= MAX_FRAGMENT_PAYLOAD {
        let mut p = params;
        p.frag_id = 0;
        p.frag_count = 1;
        p.flags.fragmented = false;
        p.flags.last_fragment = true;
        return vec![build(p, payload)];
    }

    let chunks: Vec<&[u8]> = payload.chunks(MAX_FRAGMENT_PAYLOAD).collect();
    let frag_count = chunks.len() as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut p = params;
            p.frag_id = i as u8;
            p.frag_count = frag_count;
            p.flags.fragmented = true;
            p.flags.last_fragment = i as u8 + 1 == frag_count;
            build(p, chunk)
        })
        .collect()
}

struct PendingSet {
    received_at: Instant,
    frag_count: u8,
    template: Header,
    parts: Vec<Option<Vec<u8>>>,
}

/// Reassembles fragmented payloads keyed by `(sender, sequence)`, dropping
/// incomplete sets older than [`REASSEMBLY_WINDOW`] (spec §4.2). Built on
/// `DashMap` the way the teacher keys live client state by `SocketAddr` in
/// `server.rs::ServerState::clients`.
pub struct Reassembler {
    pending: DashMap<(DeviceId, u16), PendingSet>,
    pub dropped: AtomicU64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Feed one fragment in. Returns the reassembled `(header, payload)`
    /// once the last fragment of a set arrives; `header.frag_id`/`frag_count`
    /// on the returned header describe the final fragment observed, payload
    /// is the concatenation in `frag_id` order.
    pub fn accept(&self, header: Header, payload: &[u8], now: Instant) -> Option<(Header, Vec<u8>)> {
        self.expire_stale(now);

        if header.frag_count <= 1 {
            return Some((header, payload.to_vec()));
        }

        let key = (header.src_id, header.sequence);
        let mut entry = self.pending.entry(key).or_insert_with(|| PendingSet {
            received_at: now,
            frag_count: header.frag_count,
            template: header,
            parts: vec![None; header.frag_count as usize],
        });

        if (header.frag_id as usize) < entry.parts.len() {
            entry.parts[header.frag_id as usize] = Some(payload.to_vec());
        }

        let complete = entry.parts.iter().all(Option::is_some);
        if complete {
            let mut whole = Vec::new();
            for part in &entry.parts {
                whole.extend_from_slice(part.as_ref().unwrap());
            }
            let template = entry.template;
            drop(entry);
            self.pending.remove(&key);
            return Some((template, whole));
        }
        drop(entry);
        None
    }

    fn expire_stale(&self, now: Instant) {
        let stale: Vec<_> = self
            .pending
            .iter()
            .filter(|e| now.duration_since(e.received_at) > REASSEMBLY_WINDOW)
            .map(|e| *e.key())
            .collect();
        for key in stale {
            self.pending.remove(&key);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(seq: u16) -> BuildParams {
        BuildParams {
            channel: Channel::Voice,
            msg_type: 0x30,
            flags: Flags::default(),
            sequence: seq,
            src_id: DeviceId::parse("12345678").unwrap(),
            frag_id: 0,
            frag_count: 1,
            timestamp: 1000,
        }
    }

    #[test]
    fn build_parse_round_trip_is_identity() {
        let packet = build(params(7), b"hello voice");
        let (header, payload) = parse(&packet).unwrap();
        assert_eq!(header.sequence, 7);
        assert_eq!(header.src_id, DeviceId::parse("12345678").unwrap());
        assert_eq!(payload, b"hello voice");
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert_eq!(parse(&[1, 2, 3]).unwrap_err(), Error::ShortBuffer);
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut packet = build(params(1), b"x");
        packet[0] ^= 0xFF;
        assert_eq!(parse(&packet).unwrap_err(), Error::BadMagic);
    }

    #[test]
    fn parse_rejects_integrity_mismatch() {
        let mut packet = build(params(1), b"x");
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert_eq!(parse(&packet).unwrap_err(), Error::IntegrityMismatch);
    }

    #[test]
    fn parse_rejects_length_mismatch() {
        let mut packet = build(params(1), b"hello");
        packet.push(0); // trailing junk, payload_len no longer matches
        assert_eq!(parse(&packet).unwrap_err(), Error::LengthMismatch);
    }

    #[test]
    fn legacy_v1_reports_unsupported_version() {
        let mut v1 = vec![0u8; HEADER_LEN_V1];
        v1[0..2].copy_from_slice(&WIRE_MAGIC.to_le_bytes());
        v1[2] = 1;
        let crc = CRC16_CCITT.checksum(&v1);
        v1[10..12].copy_from_slice(&crc.to_le_bytes());
        assert_eq!(parse(&v1).unwrap_err(), Error::UnsupportedVersion);
    }

    #[test]
    fn payload_at_budget_fits_one_fragment_one_over_makes_two() {
        let at_budget = vec![0xABu8; MAX_FRAGMENT_PAYLOAD];
        let frames = fragment(params(1), &at_budget);
        assert_eq!(frames.len(), 1);

        let over_budget = vec![0xABu8; MAX_FRAGMENT_PAYLOAD + 1];
        let frames = fragment(params(2), &over_budget);
        assert_eq!(frames.len(), 2);
        let (h0, _) = parse(&frames[0]).unwrap();
        assert!(!h0.flags.last_fragment);
        let (h1, _) = parse(&frames[1]).unwrap();
        assert!(h1.flags.last_fragment);
    }

    #[test]
    fn reassembler_joins_fragments_in_order() {
        let big = (0..(MAX_FRAGMENT_PAYLOAD + 50))
            .map(|i| (i % 256) as u8)
            .collect::<Vec<_>>();
        let packets = fragment(params(3), &big);
        assert_eq!(packets.len(), 2);

        let reasm = Reassembler::new();
        let now = Instant::now();
        let (h0, p0) = parse(&packets[0]).unwrap();
        assert!(reasm.accept(h0, p0, now).is_none());
        let (h1, p1) = parse(&packets[1]).unwrap();
        let (_, whole) = reasm.accept(h1, p1, now).unwrap();
        assert_eq!(whole, big);
    }

    #[test]
    fn reassembler_drops_stale_incomplete_sets() {
        let big = vec![0u8; MAX_FRAGMENT_PAYLOAD + 1];
        let packets = fragment(params(4), &big);
        let reasm = Reassembler::new();
        let t0 = Instant::now();
        let (h0, p0) = parse(&packets[0]).unwrap();
        assert!(reasm.accept(h0, p0, t0).is_none());

        let later = t0 + REASSEMBLY_WINDOW + std::time::Duration::from_millis(1);
        let (h1, p1) = parse(&packets[1]).unwrap();
        // the partial set from t0 is now stale and should be swept before
        // this fragment starts a fresh (still incomplete) set of its own.
        assert!(reasm.accept(h1, p1, later).is_none());
        assert_eq!(reasm.dropped.load(Ordering::Relaxed), 1);
    }
}
