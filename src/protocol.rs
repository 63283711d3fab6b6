//! Message taxonomy and dispatch primitives (spec §3 "Message taxonomy",
//! §4.6 "Protocol dispatcher").
//!
//! The full dispatcher — matching an inbound message against the live slot
//! table — lives in [`crate::device`], since it needs the slot table to
//! answer "which slot owns this". What belongs here is taxonomy-only: the
//! message kind enum, the per-channel sequence allocator, and the
//! stateless pieces of routing (auto-replies, target-id extraction) that
//! don't need the table at all.

use crate::error::Error;
use crate::ids::{DeviceId, FrequencyId};
use std::sync::atomic::{AtomicU16, Ordering};

/// One enumerated `msg_type` byte (spec §3). Grouped by high nibble exactly
/// as the table there groups them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    // 0x0x discovery
    DiscoveryRequest = 0x00,
    DiscoveryResponse = 0x01,
    Heartbeat = 0x02,
    Goodbye = 0x03,

    // 0x1x call control
    CallRequest = 0x10,
    CallAccept = 0x11,
    CallReject = 0x12,
    CallEnd = 0x13,
    CallHold = 0x14,
    CallResume = 0x15,

    // 0x2x frequency control
    FreqAnnounce = 0x20,
    FreqJoinRequest = 0x21,
    FreqJoinAccept = 0x22,
    FreqJoinReject = 0x23,
    FreqLeave = 0x24,
    FreqKick = 0x25,
    FreqClose = 0x26,
    FreqInvite = 0x27,
    FreqUpdate = 0x28,
    FreqMemberList = 0x29,

    // 0x3x voice
    VoiceData = 0x30,
    VoiceStart = 0x31,
    VoiceEnd = 0x32,
    VoiceSilence = 0x33,
    VoiceDtx = 0x34,

    // 0x4x control
    Mute = 0x40,
    Unmute = 0x41,
    Ping = 0x42,
    Pong = 0x43,
    Ack = 0x44,
    Nack = 0x45,
    RetransmitRequest = 0x46,

    // 0x5x status
    StatusUpdate = 0x50,
    QualityReport = 0x51,
    ErrorReport = 0x52,

    // 0x6x security
    KeyExchange = 0x60,
    KeyConfirm = 0x61,
    Rekey = 0x62,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Result<Self, Error> {
        use MessageKind::*;
        Ok(match v {
            0x00 => DiscoveryRequest,
            0x01 => DiscoveryResponse,
            0x02 => Heartbeat,
            0x03 => Goodbye,
            0x10 => CallRequest,
            0x11 => CallAccept,
            0x12 => CallReject,
            0x13 => CallEnd,
            0x14 => CallHold,
            0x15 => CallResume,
            0x20 => FreqAnnounce,
            0x21 => FreqJoinRequest,
            0x22 => FreqJoinAccept,
            0x23 => FreqJoinReject,
            0x24 => FreqLeave,
            0x25 => FreqKick,
            0x26 => FreqClose,
            0x27 => FreqInvite,
            0x28 => FreqUpdate,
            0x29 => FreqMemberList,
            0x30 => VoiceData,
            0x31 => VoiceStart,
            0x32 => VoiceEnd,
            0x33 => VoiceSilence,
            0x34 => VoiceDtx,
            0x40 => Mute,
            0x41 => Unmute,
            0x42 => Ping,
            0x43 => Pong,
            0x44 => Ack,
            0x45 => Nack,
            0x46 => RetransmitRequest,
            0x50 => StatusUpdate,
            0x51 => QualityReport,
            0x52 => ErrorReport,
            0x60 => KeyExchange,
            0x61 => KeyConfirm,
            0x62 => Rekey,
            other => return Err(Error::UnknownMessageKind(other)),
        })
    }

    /// High nibble grouping, used to decide how to extract a target id from
    /// the payload (spec §3/§4.6: call messages carry a device target,
    /// frequency messages carry a frequency target).
    pub fn is_call_control(self) -> bool {
        (self.as_u8() & 0xF0) == 0x10
    }

    pub fn is_frequency_control(self) -> bool {
        (self.as_u8() & 0xF0) == 0x20
    }

    pub fn is_voice(self) -> bool {
        (self.as_u8() & 0xF0) == 0x30
    }
}

/// Where an inbound message is addressed (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Device(DeviceId),
    Frequency(FrequencyId),
    /// Neither a call nor a frequency control message (discovery, link
    /// control, status, security) — these are handled without a slot
    /// lookup.
    Unaddressed,
}

/// Call and frequency control payloads open with their 8-digit target id in
/// ASCII-digit wire form, the same layout as [`DeviceId::to_wire`] /
/// [`FrequencyId::to_wire`] (spec §4.6: "a call message targets the device
/// whose id matches target_id in the payload").
pub fn route_target(kind: MessageKind, payload: &[u8]) -> Result<RouteTarget, Error> {
    if kind.is_call_control() {
        if payload.len() < 8 {
            return Err(Error::ShortBuffer);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[..8]);
        return Ok(RouteTarget::Device(DeviceId::from_wire(&bytes)?));
    }
    if kind.is_frequency_control() || kind.is_voice() {
        if payload.len() < 8 {
            return Err(Error::ShortBuffer);
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[..8]);
        return Ok(RouteTarget::Frequency(FrequencyId::from_wire(&bytes)?));
    }
    Ok(RouteTarget::Unaddressed)
}

/// `MSG_PING` yields an immediate `MSG_PONG` (spec §4.6); every other kind
/// has no context-free auto-reply.
pub fn auto_reply(kind: MessageKind) -> Option<MessageKind> {
    match kind {
        MessageKind::Ping => Some(MessageKind::Pong),
        _ => None,
    }
}

/// Per-sender sequence allocation, split control/voice (spec §4.6:
/// "per-channel (control vs voice) monotonic counters are acceptable, but
/// voice sequences MUST be reusable as the audio frame sequence"). Each
/// counter wraps at 2^16 per spec §3.
pub struct SequenceAllocator {
    control: AtomicU16,
    voice: AtomicU16,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self {
            control: AtomicU16::new(0),
            voice: AtomicU16::new(0),
        }
    }

    pub fn next_control(&self) -> u16 {
        self.control.fetch_add(1, Ordering::Relaxed)
    }

    /// The returned value is the same sequence the caller should stamp on
    /// the outgoing audio frame before it is enqueued on the ring, so voice
    /// packet sequence and frame sequence never diverge.
    pub fn next_voice(&self) -> u16 {
        self.voice.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_kind_round_trips_through_byte_form() {
        for kind in [
            MessageKind::DiscoveryRequest,
            MessageKind::CallRequest,
            MessageKind::FreqJoinAccept,
            MessageKind::VoiceData,
            MessageKind::Ping,
            MessageKind::StatusUpdate,
            MessageKind::Rekey,
        ] {
            assert_eq!(MessageKind::from_u8(kind.as_u8()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert_eq!(MessageKind::from_u8(0xFF).unwrap_err(), Error::UnknownMessageKind(0xFF));
    }

    #[test]
    fn ping_auto_replies_with_pong() {
        assert_eq!(auto_reply(MessageKind::Ping), Some(MessageKind::Pong));
        assert_eq!(auto_reply(MessageKind::Pong), None);
    }

    #[test]
    fn call_control_routes_to_device_target() {
        let id = DeviceId::parse("12345678").unwrap();
        let target = route_target(MessageKind::CallRequest, &id.to_wire()).unwrap();
        assert_eq!(target, RouteTarget::Device(id));
    }

    #[test]
    fn frequency_control_routes_to_frequency_target() {
        let id = FrequencyId::parse("87654321").unwrap();
        let target = route_target(MessageKind::FreqJoinRequest, &id.to_wire()).unwrap();
        assert_eq!(target, RouteTarget::Frequency(id));
    }

    #[test]
    fn discovery_is_unaddressed() {
        let target = route_target(MessageKind::DiscoveryRequest, &[]).unwrap();
        assert_eq!(target, RouteTarget::Unaddressed);
    }

    #[test]
    fn voice_sequence_counter_matches_across_calls() {
        let alloc = SequenceAllocator::new();
        assert_eq!(alloc.next_voice(), 0);
        assert_eq!(alloc.next_voice(), 1);
        assert_eq!(alloc.next_control(), 0);
        assert_eq!(alloc.next_voice(), 2);
    }
}
