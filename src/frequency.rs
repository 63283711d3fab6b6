//! Frequency (ad-hoc group) membership (spec §3 "Frequency membership",
//! §4.7 "Admin rules").
//!
//! Grounded in the teacher's `server.rs::ServerState::clients`
//! (`DashMap<SocketAddr, ClientInfo>`) for the concurrent-registry shape;
//! generalized from "one flat table of connected clients" to "many
//! independent groups, each with its own admin and membership rules".

use crate::config::MAX_FREQUENCY_MEMBERS;
use crate::crypto::derive_from_password;
use crate::error::Error;
use crate::ids::{DeviceId, FrequencyId, Password};
use dashmap::DashMap;

/// Whether a frequency answers discovery probes (spec §3/§GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Join gating (spec §3: "protection (none|password|approval|both)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    Password,
    Approval,
    Both,
}

impl Protection {
    fn requires_password(self) -> bool {
        matches!(self, Protection::Password | Protection::Both)
    }

    fn requires_approval(self) -> bool {
        matches!(self, Protection::Approval | Protection::Both)
    }
}

/// Outcome of a join request, used by the caller to decide which reply
/// message to send (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// No approval required: the caller is already a member.
    Accepted,
    /// Approval required: the caller has been recorded in pending and must
    /// wait for the admin.
    Pending,
}

/// One ad-hoc group conversation (spec §3).
pub struct Frequency {
    pub id: FrequencyId,
    pub admin: DeviceId,
    pub visibility: Visibility,
    pub protection: Protection,
    password: Option<Password>,
    members: Vec<DeviceId>,
    pending: Vec<DeviceId>,
    /// The shared voice-channel key every member ultimately holds (spec
    /// §4.3 generalized to a group: one key, not one pairwise session per
    /// pair of members). Password-protected frequencies derive it via
    /// PBKDF2 from the password so no member ever has to receive it over
    /// the air; unprotected ones draw it at random and `crate::device`
    /// delivers it to each joiner under a pairwise ECDH-wrapped envelope.
    group_key: [u8; 16],
}

impl Frequency {
    pub fn new(
        id: FrequencyId,
        admin: DeviceId,
        visibility: Visibility,
        protection: Protection,
        password: Option<Password>,
    ) -> Self {
        let group_key = match &password {
            Some(pw) => derive_from_password(pw.as_str(), &id.to_wire()).key,
            None => {
                use rand::RngCore;
                let mut key = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut key);
                key
            }
        };
        Self {
            id,
            admin,
            visibility,
            protection,
            password,
            members: vec![admin],
            pending: Vec::new(),
            group_key,
        }
    }

    /// The group's shared voice-channel key (spec §4.3).
    pub fn group_key(&self) -> [u8; 16] {
        self.group_key
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, device: DeviceId) -> bool {
        self.members.contains(&device)
    }

    pub fn is_admin(&self, device: DeviceId) -> bool {
        self.admin == device
    }

    /// `MSG_FREQ_JOIN_REQUEST` handling (spec §4.7): validates the password
    /// if required, then either admits the caller directly or files a
    /// pending request awaiting admin approval.
    pub fn request_join(
        &mut self,
        device: DeviceId,
        candidate_password: Option<&str>,
    ) -> Result<JoinOutcome, Error> {
        if self.is_member(device) {
            return Ok(JoinOutcome::Accepted);
        }
        if self.members.len() >= MAX_FREQUENCY_MEMBERS {
            return Err(Error::FrequencyFull);
        }
        if self.protection.requires_password() {
            let expected = self.password.as_ref().ok_or(Error::WrongPassword)?;
            let candidate = candidate_password.unwrap_or("");
            if !expected.matches(candidate) {
                return Err(Error::WrongPassword);
            }
        }
        if self.protection.requires_approval() {
            if !self.pending.contains(&device) {
                self.pending.push(device);
            }
            return Ok(JoinOutcome::Pending);
        }
        self.members.push(device);
        Ok(JoinOutcome::Accepted)
    }

    /// Admin converts a pending request into membership (spec §4.7:
    /// "pending→member"). Only the admin may call this.
    pub fn accept_pending(&mut self, caller: DeviceId, device: DeviceId) -> Result<(), Error> {
        if !self.is_admin(caller) {
            return Err(Error::PermissionDenied);
        }
        let idx = self.pending.iter().position(|&d| d == device).ok_or(Error::WrongTarget)?;
        self.pending.remove(idx);
        if !self.members.contains(&device) {
            if self.members.len() >= MAX_FREQUENCY_MEMBERS {
                return Err(Error::FrequencyFull);
            }
            self.members.push(device);
        }
        Ok(())
    }

    /// `MSG_FREQ_KICK` (spec §4.7): admin-only removal.
    pub fn kick(&mut self, caller: DeviceId, device: DeviceId) -> Result<(), Error> {
        if !self.is_admin(caller) {
            return Err(Error::PermissionDenied);
        }
        if device == self.admin {
            return Err(Error::PermissionDenied);
        }
        self.members.retain(|&d| d != device);
        Ok(())
    }

    /// `MSG_FREQ_LEAVE` handling (spec §4.7): a member removes itself, no
    /// admin check — unlike [`Self::kick`], anyone may leave their own
    /// membership.
    pub fn remove_member(&mut self, device: DeviceId) {
        self.members.retain(|&d| d != device);
    }

    pub fn pending_requests(&self) -> &[DeviceId] {
        &self.pending
    }

    pub fn members(&self) -> &[DeviceId] {
        &self.members
    }
}

/// Live frequency table. Concurrent map keyed by id, the way the teacher
/// keys `ClientInfo` by `SocketAddr`.
pub struct FrequencyRegistry {
    frequencies: DashMap<FrequencyId, Frequency>,
}

impl FrequencyRegistry {
    pub fn new() -> Self {
        Self {
            frequencies: DashMap::new(),
        }
    }

    /// `MSG_FREQ_ANNOUNCE` handling at creation time: draws a fresh id,
    /// retrying on the vanishingly unlikely collision with a live group
    /// (spec §3: "allocated randomly... re-issuable thereafter").
    pub fn create(
        &self,
        admin: DeviceId,
        visibility: Visibility,
        protection: Protection,
        password: Option<Password>,
    ) -> FrequencyId {
        loop {
            let id = FrequencyId::random();
            if self.frequencies.contains_key(&id) {
                continue;
            }
            self.frequencies
                .insert(id, Frequency::new(id, admin, visibility, protection, password));
            return id;
        }
    }

    pub fn get(&self, id: FrequencyId) -> Option<dashmap::mapref::one::Ref<'_, FrequencyId, Frequency>> {
        self.frequencies.get(&id)
    }

    pub fn get_mut(
        &self,
        id: FrequencyId,
    ) -> Option<dashmap::mapref::one::RefMut<'_, FrequencyId, Frequency>> {
        self.frequencies.get_mut(&id)
    }

    /// `MSG_FREQ_CLOSE` (spec §4.7): dissolves the group, returning its id
    /// to the free pool (removing it from this table is sufficient —
    /// [`create`] never excludes previously-used ids once they're gone).
    pub fn close(&self, caller: DeviceId, id: FrequencyId) -> Result<(), Error> {
        let is_admin = self
            .frequencies
            .get(&id)
            .map(|f| f.is_admin(caller))
            .ok_or(Error::WrongTarget)?;
        if !is_admin {
            return Err(Error::PermissionDenied);
        }
        self.frequencies.remove(&id);
        Ok(())
    }
}

impl Default for FrequencyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dev(n: u32) -> DeviceId {
        DeviceId::new(10_000_000 + n)
    }

    #[test]
    fn open_frequency_admits_joiners_directly() {
        let admin = dev(1);
        let mut f = Frequency::new(FrequencyId::new(10_000_001), admin, Visibility::Visible, Protection::None, None);
        let outcome = f.request_join(dev(2), None).unwrap();
        assert_eq!(outcome, JoinOutcome::Accepted);
        assert_eq!(f.member_count(), 2);
    }

    #[test]
    fn password_protected_frequency_rejects_wrong_password() {
        let admin = dev(1);
        let pw = Password::new("5555").unwrap();
        let mut f = Frequency::new(FrequencyId::new(10_000_001), admin, Visibility::Visible, Protection::Password, Some(pw));
        let err = f.request_join(dev(2), Some("0000")).unwrap_err();
        assert_eq!(err, Error::WrongPassword);
        let outcome = f.request_join(dev(2), Some("5555")).unwrap();
        assert_eq!(outcome, JoinOutcome::Accepted);
        assert_eq!(f.member_count(), 2);
    }

    #[test]
    fn approval_required_frequency_files_pending_request() {
        let admin = dev(1);
        let mut f = Frequency::new(FrequencyId::new(10_000_001), admin, Visibility::Visible, Protection::Approval, None);
        let outcome = f.request_join(dev(2), None).unwrap();
        assert_eq!(outcome, JoinOutcome::Pending);
        assert_eq!(f.member_count(), 1);
        assert_eq!(f.pending_requests(), &[dev(2)]);

        f.accept_pending(admin, dev(2)).unwrap();
        assert_eq!(f.member_count(), 2);
        assert!(f.pending_requests().is_empty());
    }

    #[test]
    fn non_admin_cannot_accept_or_kick() {
        let admin = dev(1);
        let mut f = Frequency::new(FrequencyId::new(10_000_001), admin, Visibility::Visible, Protection::Approval, None);
        f.request_join(dev(2), None).unwrap();
        let err = f.accept_pending(dev(3), dev(2)).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);

        f.accept_pending(admin, dev(2)).unwrap();
        let err = f.kick(dev(3), dev(2)).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
    }

    #[test]
    fn admin_can_kick_a_member() {
        let admin = dev(1);
        let mut f = Frequency::new(FrequencyId::new(10_000_001), admin, Visibility::Visible, Protection::None, None);
        f.request_join(dev(2), None).unwrap();
        f.kick(admin, dev(2)).unwrap();
        assert_eq!(f.member_count(), 1);
        assert!(!f.is_member(dev(2)));
    }

    #[test]
    fn registry_create_and_close_round_trips() {
        let registry = FrequencyRegistry::new();
        let admin = dev(1);
        let id = registry.create(admin, Visibility::Hidden, Protection::None, None);
        assert!(registry.get(id).is_some());
        registry.close(admin, id).unwrap();
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn non_admin_close_is_denied() {
        let registry = FrequencyRegistry::new();
        let admin = dev(1);
        let id = registry.create(admin, Visibility::Visible, Protection::None, None);
        let err = registry.close(dev(2), id).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
        assert!(registry.get(id).is_some());
    }
}
