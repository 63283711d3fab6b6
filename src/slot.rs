//! Slot manager & state machine (spec §3 "Slot", §4.7).
//!
//! No direct teacher analogue — the teacher has one implicit "slot" (the
//! TCP connection to the single server). The state machine, audio-focus
//! invariant, and 15-slot table are built fresh from spec §4.7, reusing
//! the teacher's concurrency primitives (`DashMap`-adjacent `Mutex`-guarded
//! table, per-slot `AudioRing`) where they fit the new shape.

use crate::audio::ring::AudioRing;
use crate::config::MAX_SLOTS;
use crate::crypto::{Context as CryptoContext, KeyPair};
use crate::error::Error;
use crate::ids::{DeviceId, FrequencyId, Password};
use crate::nvs::Nvs;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const CRC32_ISO_HDLC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
const NS_DIAL_SLOTS: &str = "dial_slots";

/// Spec §4.7 state machine:
/// `Empty -> (configure) -> Saved -> (connect) -> Connecting -> Connected`,
/// `Connecting -> Error` on timeout/reject/auth-failure,
/// `Connected -> Saved` on disconnect/kick, `any -> Empty` on clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Saved,
    Connecting,
    Connected,
    Error,
}

/// "Either a device or a frequency" (spec §9 Design Notes: model as a
/// tagged variant with two constructors, not a discriminant plus a union).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionTarget {
    Device(DeviceId),
    Frequency(FrequencyId),
}

/// Radio-reported link quality for the slot's peer (spec §3 "last signal
/// strength").
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SignalQuality {
    pub rssi: i16,
    pub snr: i16,
}

/// The persisted subset of a slot's fields (spec §4.7 "Persistence... kind,
/// code, display name, password"). Runtime state (task handle, counters)
/// is deliberately excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotConfig {
    pub target: ConnectionTarget,
    pub display_name: String,
    pub password: Option<Password>,
}

impl SlotConfig {
    /// Binary layout: `kind(1) | id(8) | name_len(1) | name | has_pw(1) |
    /// pw_len(1) | pw`. CRC32 over the whole record is appended and
    /// checked on load (spec §6: "MUST be validated on load").
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self.target {
            ConnectionTarget::Device(id) => {
                buf.push(0);
                buf.extend_from_slice(&id.to_wire());
            }
            ConnectionTarget::Frequency(id) => {
                buf.push(1);
                buf.extend_from_slice(&id.to_wire());
            }
        }
        let name_bytes = self.display_name.as_bytes();
        let name_len = name_bytes.len().min(255) as u8;
        buf.push(name_len);
        buf.extend_from_slice(&name_bytes[..name_len as usize]);
        match &self.password {
            Some(pw) => {
                buf.push(1);
                let pw_bytes = pw.as_str().as_bytes();
                buf.push(pw_bytes.len() as u8);
                buf.extend_from_slice(pw_bytes);
            }
            None => buf.push(0),
        }
        let crc = CRC32_ISO_HDLC.checksum(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::StorageIo);
        }
        let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored_crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        if CRC32_ISO_HDLC.checksum(body) != stored_crc {
            return Err(Error::StorageIo);
        }

        let mut cursor = 0usize;
        let kind = *body.get(cursor).ok_or(Error::StorageIo)?;
        cursor += 1;
        if body.len() < cursor + 8 {
            return Err(Error::StorageIo);
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&body[cursor..cursor + 8]);
        cursor += 8;
        let target = match kind {
            0 => ConnectionTarget::Device(DeviceId::from_wire(&id_bytes)?),
            1 => ConnectionTarget::Frequency(FrequencyId::from_wire(&id_bytes)?),
            _ => return Err(Error::StorageIo),
        };

        let name_len = *body.get(cursor).ok_or(Error::StorageIo)? as usize;
        cursor += 1;
        if body.len() < cursor + name_len {
            return Err(Error::StorageIo);
        }
        let display_name = String::from_utf8(body[cursor..cursor + name_len].to_vec())
            .map_err(|_| Error::StorageIo)?;
        cursor += name_len;

        let has_pw = *body.get(cursor).ok_or(Error::StorageIo)?;
        cursor += 1;
        let password = if has_pw == 1 {
            let pw_len = *body.get(cursor).ok_or(Error::StorageIo)? as usize;
            cursor += 1;
            if body.len() < cursor + pw_len {
                return Err(Error::StorageIo);
            }
            let pw_str =
                std::str::from_utf8(&body[cursor..cursor + pw_len]).map_err(|_| Error::StorageIo)?;
            Some(Password::new(pw_str)?)
        } else {
            None
        };

        Ok(Self { target, display_name, password })
    }
}

/// One of the fifteen dial positions (spec §3/§4.7).
pub struct Slot {
    pub config: Option<SlotConfig>,
    pub state: SlotState,
    pub peer_is_admin: bool,
    pub member_count: usize,
    pub muted: bool,
    pub audio_focus: bool,
    pub last_signal: SignalQuality,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub ring: AudioRing,
    pub crypto: CryptoContext,
    /// Ephemeral ECDH keypair held between sending/receiving `MSG_CALL_REQUEST`
    /// and the matching `MSG_CALL_ACCEPT`/`MSG_FREQ_JOIN_ACCEPT` (spec §4.3:
    /// `generate_keypair`/`compute_shared_secret`). Dropped once a session key
    /// is agreed — there is nothing left for it to do once the slot is
    /// Connected.
    pub pending_keypair: Option<KeyPair>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            config: None,
            state: SlotState::Empty,
            peer_is_admin: false,
            member_count: 0,
            muted: false,
            audio_focus: false,
            last_signal: SignalQuality::default(),
            bytes_sent: 0,
            bytes_received: 0,
            ring: AudioRing::new(),
            crypto: CryptoContext::empty(),
            pending_keypair: None,
        }
    }
}

/// Guards the 15-slot table plus the live-task cap (spec §4.7: "Hard cap:
/// 15 live tasks (one per slot). A 16th `connect` fails fast with
/// ResourceExhausted"). Modeled as an explicit counter rather than slot
/// occupancy alone, since a slot tearing down still holds its task a
/// moment after the slot itself has moved out of Connected.
pub struct SlotManager {
    slots: Mutex<Vec<Slot>>,
    live_tasks: AtomicUsize,
}

impl SlotManager {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_SLOTS);
        for _ in 0..MAX_SLOTS {
            slots.push(Slot::empty());
        }
        Self {
            slots: Mutex::new(slots),
            live_tasks: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        MAX_SLOTS
    }

    /// `Empty|Saved|Error -> (configure) -> Saved` (spec §4.7). Reconfiguring
    /// a connected slot is rejected — disconnect first.
    pub fn configure(&self, index: usize, config: SlotConfig) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Error::WrongTarget)?;
        if matches!(slot.state, SlotState::Connecting | SlotState::Connected) {
            return Err(Error::PermissionDenied);
        }
        slot.config = Some(config);
        slot.state = SlotState::Saved;
        Ok(())
    }

    /// `Saved -> Connecting` (spec §4.7), subject to the live-task cap.
    pub fn connect(&self, index: usize) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Error::WrongTarget)?;
        if slot.state != SlotState::Saved {
            return Err(Error::PermissionDenied);
        }
        if self.live_tasks.load(Ordering::Acquire) >= MAX_SLOTS {
            return Err(Error::ResourceExhausted);
        }
        self.live_tasks.fetch_add(1, Ordering::AcqRel);
        slot.state = SlotState::Connecting;
        Ok(())
    }

    /// `Connecting -> Connected` once the peer answers.
    pub fn mark_connected(&self, index: usize) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Error::WrongTarget)?;
        if slot.state != SlotState::Connecting {
            return Err(Error::PermissionDenied);
        }
        slot.state = SlotState::Connected;
        slot.pending_keypair = None;
        Ok(())
    }

    /// `Connecting -> Error` on timeout, reject, or auth failure (spec
    /// §4.7); releases the slot's live-task slot.
    pub fn mark_error(&self, index: usize) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Error::WrongTarget)?;
        if slot.state == SlotState::Connecting {
            self.live_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        slot.audio_focus = false;
        slot.pending_keypair = None;
        slot.state = SlotState::Error;
        Ok(())
    }

    /// `Connected -> Saved` on local disconnect, peer disconnect, or kick
    /// (spec §4.7); releases the slot's live-task slot and its crypto
    /// context is zeroed by replacing it.
    pub fn disconnect(&self, index: usize) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Error::WrongTarget)?;
        if slot.state == SlotState::Connected {
            self.live_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        slot.audio_focus = false;
        slot.crypto = CryptoContext::empty();
        slot.pending_keypair = None;
        slot.state = SlotState::Saved;
        Ok(())
    }

    /// `any -> Empty` on clear (spec §4.7).
    pub fn clear(&self, index: usize) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Error::WrongTarget)?;
        if matches!(slot.state, SlotState::Connecting | SlotState::Connected) {
            self.live_tasks.fetch_sub(1, Ordering::AcqRel);
        }
        *slot = Slot::empty();
        Ok(())
    }

    /// Rotating the dial (spec §4.7): switches audio focus to `index`,
    /// enforcing the invariant that at most one slot has focus and the
    /// focused slot must be Connected.
    pub fn set_focus(&self, index: usize) -> Result<(), Error> {
        let mut slots = self.slots.lock();
        if slots.get(index).ok_or(Error::WrongTarget)?.state != SlotState::Connected {
            return Err(Error::PermissionDenied);
        }
        for slot in slots.iter_mut() {
            slot.audio_focus = false;
        }
        slots[index].audio_focus = true;
        Ok(())
    }

    pub fn focused_index(&self) -> Option<usize> {
        self.slots.lock().iter().position(|s| s.audio_focus)
    }

    pub fn state_of(&self, index: usize) -> Result<SlotState, Error> {
        Ok(self.slots.lock().get(index).ok_or(Error::WrongTarget)?.state)
    }

    pub fn live_task_count(&self) -> usize {
        self.live_tasks.load(Ordering::Relaxed)
    }

    /// Scan the table for the first slot matching `predicate` (spec §4.6:
    /// the dispatcher locates "the slot whose configured target equals..."
    /// a value carried on an inbound message, rather than an index).
    pub fn position_where(&self, predicate: impl Fn(&Slot) -> bool) -> Option<usize> {
        self.slots.lock().iter().position(|s| predicate(s))
    }

    pub fn with_slot<R>(&self, index: usize, f: impl FnOnce(&Slot) -> R) -> Result<R, Error> {
        let slots = self.slots.lock();
        let slot = slots.get(index).ok_or(Error::WrongTarget)?;
        Ok(f(slot))
    }

    pub fn with_slot_mut<R>(&self, index: usize, f: impl FnOnce(&mut Slot) -> R) -> Result<R, Error> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(index).ok_or(Error::WrongTarget)?;
        Ok(f(slot))
    }

    /// Persist every configured slot's config to NVS (spec §4.7: "saved to
    /// NVS on mutation").
    pub fn persist_all(&self, nvs: &dyn Nvs) {
        let slots = self.slots.lock();
        for (i, slot) in slots.iter().enumerate() {
            let key = i.to_string();
            match &slot.config {
                Some(config) => nvs.put(NS_DIAL_SLOTS, &key, &config.encode()),
                None => nvs.erase(NS_DIAL_SLOTS, &key),
            }
        }
        nvs.commit();
    }

    /// Rehydrate every slot to Saved from NVS without auto-connecting
    /// (spec §4.7: "On boot, slots rehydrate to Saved without
    /// auto-connecting"). Corrupt records (failed CRC) are treated as
    /// absent rather than propagated, since a single bad slot record must
    /// not block boot.
    pub fn load_all(nvs: &dyn Nvs) -> Self {
        let manager = Self::new();
        let mut slots = manager.slots.lock();
        for (i, slot) in slots.iter_mut().enumerate() {
            if let Some(bytes) = nvs.get(NS_DIAL_SLOTS, &i.to_string()) {
                if let Ok(config) = SlotConfig::decode(&bytes) {
                    slot.config = Some(config);
                    slot.state = SlotState::Saved;
                }
            }
        }
        drop(slots);
        manager
    }
}

impl Default for SlotManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvs::InMemoryNvs;
    use pretty_assertions::assert_eq;

    fn device_config(n: u32) -> SlotConfig {
        SlotConfig {
            target: ConnectionTarget::Device(DeviceId::new(10_000_000 + n)),
            display_name: format!("peer-{n}"),
            password: None,
        }
    }

    #[test]
    fn full_lifecycle_empty_to_connected_to_saved_to_empty() {
        let mgr = SlotManager::new();
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Empty);
        mgr.configure(0, device_config(1)).unwrap();
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Saved);
        mgr.connect(0).unwrap();
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Connecting);
        mgr.mark_connected(0).unwrap();
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Connected);
        mgr.disconnect(0).unwrap();
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Saved);
        mgr.clear(0).unwrap();
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Empty);
    }

    #[test]
    fn connecting_slot_can_move_to_error_on_timeout() {
        let mgr = SlotManager::new();
        mgr.configure(0, device_config(1)).unwrap();
        mgr.connect(0).unwrap();
        mgr.mark_error(0).unwrap();
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Error);
        assert_eq!(mgr.live_task_count(), 0);
    }

    #[test]
    fn all_fifteen_slots_can_connect_and_the_counter_tracks_them() {
        let mgr = SlotManager::new();
        for i in 0..MAX_SLOTS {
            mgr.configure(i, device_config(i as u32)).unwrap();
            mgr.connect(i).unwrap();
        }
        assert_eq!(mgr.live_task_count(), MAX_SLOTS);

        // a connecting/connected slot can't be reconfigured or re-connected
        // out from under its live task.
        assert_eq!(mgr.configure(0, device_config(99)).unwrap_err(), Error::PermissionDenied);
        assert_eq!(mgr.connect(0).unwrap_err(), Error::PermissionDenied);
    }

    #[test]
    fn connect_refuses_once_the_live_task_cap_is_reached() {
        let mgr = SlotManager::new();
        for i in 0..MAX_SLOTS {
            mgr.configure(i, device_config(i as u32)).unwrap();
            mgr.connect(i).unwrap();
        }
        // simulate a task lingering past its slot's teardown: disconnect
        // puts the slot back in Saved and decrements the counter normally,
        // but a manager that raced a teardown could observe the counter
        // still at the cap while a slot is Saved again.
        mgr.disconnect(0).unwrap();
        mgr.live_tasks.fetch_add(1, Ordering::SeqCst);
        assert_eq!(mgr.connect(0).unwrap_err(), Error::ResourceExhausted);
    }

    #[test]
    fn only_one_slot_may_hold_audio_focus_and_it_must_be_connected() {
        let mgr = SlotManager::new();
        mgr.configure(0, device_config(1)).unwrap();
        mgr.connect(0).unwrap();
        assert_eq!(mgr.set_focus(0).unwrap_err(), Error::PermissionDenied);
        mgr.mark_connected(0).unwrap();
        mgr.set_focus(0).unwrap();
        assert_eq!(mgr.focused_index(), Some(0));

        mgr.configure(1, device_config(2)).unwrap();
        mgr.connect(1).unwrap();
        mgr.mark_connected(1).unwrap();
        mgr.set_focus(1).unwrap();
        assert_eq!(mgr.focused_index(), Some(1));
    }

    #[test]
    fn position_where_finds_the_matching_slot() {
        let mgr = SlotManager::new();
        mgr.configure(2, device_config(7)).unwrap();
        let found = mgr
            .position_where(|s| s.config.as_ref().map(|c| c.target) == Some(ConnectionTarget::Device(DeviceId::new(10_000_007))));
        assert_eq!(found, Some(2));
        assert_eq!(mgr.position_where(|s| s.state == SlotState::Connected), None);
    }

    #[test]
    fn config_encode_decode_round_trips_and_detects_corruption() {
        let config = SlotConfig {
            target: ConnectionTarget::Frequency(FrequencyId::new(11_112_222)),
            display_name: "group".into(),
            password: Some(Password::new("5555").unwrap()),
        };
        let bytes = config.encode();
        let decoded = SlotConfig::decode(&bytes).unwrap();
        assert_eq!(decoded, config);

        let mut corrupt = bytes.clone();
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        assert!(SlotConfig::decode(&corrupt).is_err());
    }

    #[test]
    fn persist_then_load_all_rehydrates_to_saved_without_connecting() {
        let nvs = InMemoryNvs::new();
        {
            let mgr = SlotManager::new();
            mgr.configure(0, device_config(1)).unwrap();
            mgr.configure(3, device_config(2)).unwrap();
            mgr.persist_all(&nvs);
        }

        let mgr = SlotManager::load_all(&nvs);
        assert_eq!(mgr.state_of(0).unwrap(), SlotState::Saved);
        assert_eq!(mgr.state_of(3).unwrap(), SlotState::Saved);
        assert_eq!(mgr.state_of(1).unwrap(), SlotState::Empty);
        assert_eq!(mgr.live_task_count(), 0);
    }
}
