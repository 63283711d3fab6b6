//! Identifiers: spec §3's `DeviceId`, `FrequencyId`, and `Password`.
//!
//! Both ids share a shape — eight decimal digits, ASCII on the wire — so
//! they're built on one private helper rather than duplicated by hand.

use crate::error::Error;
use std::fmt;

const DIGIT_ID_MIN: u32 = 10_000_000;
const DIGIT_ID_MAX: u32 = 99_999_999;

fn parse_digit_id(s: &str) -> Result<u32, Error> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::BadMagic);
    }
    s.parse::<u32>().map_err(|_| Error::BadMagic)
}

fn digit_id_to_ascii(value: u32) -> [u8; 8] {
    let s = format!("{:08}", value);
    let mut out = [0u8; 8];
    out.copy_from_slice(s.as_bytes());
    out
}

/// Eight decimal digits, stable for the device's lifetime (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Construct from a value already known to be in range (e.g. derived by
    /// [`crate::identity`]). Out-of-range values are clamped into range by
    /// the caller before this is reached; this is a last-ditch guard.
    pub fn new(value: u32) -> Self {
        debug_assert!((DIGIT_ID_MIN..=DIGIT_ID_MAX).contains(&value));
        Self(value.clamp(DIGIT_ID_MIN, DIGIT_ID_MAX))
    }

    /// Parse exactly eight ASCII digits (wire `src_id` field, or an operator
    /// custom-id override per spec §4.8).
    pub fn parse(s: &str) -> Result<Self, Error> {
        parse_digit_id(s).map(Self)
    }

    /// Parse from the eight raw ASCII-digit bytes carried on the wire.
    pub fn from_wire(bytes: &[u8; 8]) -> Result<Self, Error> {
        let s = std::str::from_utf8(bytes).map_err(|_| Error::BadMagic)?;
        Self::parse(s)
    }

    /// Render as the eight ASCII digit bytes carried on the wire.
    pub fn to_wire(self) -> [u8; 8] {
        digit_id_to_ascii(self.0)
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Eight decimal digits identifying an ad-hoc group conversation (spec §3).
/// Allocated randomly at creation, released to the free pool on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrequencyId(u32);

impl FrequencyId {
    pub fn new(value: u32) -> Self {
        debug_assert!((DIGIT_ID_MIN..=DIGIT_ID_MAX).contains(&value));
        Self(value.clamp(DIGIT_ID_MIN, DIGIT_ID_MAX))
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        parse_digit_id(s).map(Self)
    }

    pub fn from_wire(bytes: &[u8; 8]) -> Result<Self, Error> {
        let s = std::str::from_utf8(bytes).map_err(|_| Error::BadMagic)?;
        Self::parse(s)
    }

    pub fn to_wire(self) -> [u8; 8] {
        digit_id_to_ascii(self.0)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Draw a fresh id from the allocatable digit range. Collisions with a
    /// live registry are the caller's responsibility to retry (spec §3:
    /// "re-issuable thereafter").
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen_range(DIGIT_ID_MIN..=DIGIT_ID_MAX))
    }
}

impl fmt::Display for FrequencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Up to sixteen decimal digits (spec §3). Stored as the literal digit
/// string since it's compared, not arithmetically used.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Password(String);

impl Password {
    pub fn new(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();
        if raw.len() > 16 || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::BadMagic);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Constant-time equality — passwords gate frequency joins and must not
    /// leak timing information about where the mismatch occurred.
    pub fn matches(&self, candidate: &str) -> bool {
        use subtle::ConstantTimeEq;
        self.0.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn device_id_round_trips_through_wire_form() {
        let id = DeviceId::parse("12345678").unwrap();
        assert_eq!(id.to_wire(), *b"12345678");
        assert_eq!(DeviceId::from_wire(&id.to_wire()).unwrap(), id);
    }

    #[test]
    fn device_id_rejects_non_digit_or_wrong_length() {
        assert!(DeviceId::parse("1234567").is_err());
        assert!(DeviceId::parse("1234567a").is_err());
        assert!(DeviceId::parse("123456789").is_err());
    }

    #[test]
    fn frequency_id_random_is_in_range() {
        for _ in 0..100 {
            let id = FrequencyId::random();
            assert!(id.value() >= DIGIT_ID_MIN && id.value() <= DIGIT_ID_MAX);
        }
    }

    #[test]
    fn password_rejects_too_long_or_non_digits() {
        assert!(Password::new("12345678901234567").is_err());
        assert!(Password::new("12a4").is_err());
        assert!(Password::new("5555").is_ok());
    }

    #[test]
    fn password_matches_is_exact() {
        let pw = Password::new("5555").unwrap();
        assert!(pw.matches("5555"));
        assert!(!pw.matches("5556"));
        assert!(!pw.matches("555"));
    }
}
