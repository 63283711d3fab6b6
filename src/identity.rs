//! Device identity (spec §4.8): stable 8-digit id derived from hardware
//! entropy, persisted to NVS, with HMAC-signed auth tokens.
//!
//! No teacher analogue — the teacher identifies clients by ephemeral
//! `SocketAddr` and a random session key (`server.rs::random_key`). The
//! derivation here instead follows the spec's SHA-256-over-entropy
//! construction directly, and reuses `random_key`'s alphanumeric-sampling
//! idea only for the entropy fallback (random bytes when no hardware
//! source is available).

use crate::error::Error;
use crate::ids::DeviceId;
use crate::nvs::Nvs;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;

const NS_DEVICE_ID: &str = "device_id";
const KEY_RAW: &str = "raw";
const KEY_DIGITS: &str = "digits";

const DIGIT_ID_MIN: u32 = 10_000_000;
const DIGIT_ID_MAX: u32 = 99_999_999;
const DIGIT_ID_SPAN: u32 = DIGIT_ID_MAX - DIGIT_ID_MIN + 1;

/// Hardware entropy sources consulted in priority order (spec §4.8: "WiFi
/// MAC → Bluetooth MAC → eFuse UID → Flash unique id → random bytes").
/// A host implementation that has none of these simply returns `None` from
/// every method; [`collect_entropy`] falls back to random bytes.
pub trait EntropySource: Send + Sync {
    fn wifi_mac(&self) -> Option<[u8; 6]> {
        None
    }
    fn bluetooth_mac(&self) -> Option<[u8; 6]> {
        None
    }
    fn efuse_uid(&self) -> Option<Vec<u8>> {
        None
    }
    fn flash_unique_id(&self) -> Option<Vec<u8>> {
        None
    }
}

/// An [`EntropySource`] with none of the hardware sources available; every
/// device identifies itself from random bytes. Used on hosts without a
/// real radio/BLE stack.
pub struct NoHardwareEntropy;

impl EntropySource for NoHardwareEntropy {}

fn collect_entropy(source: &dyn EntropySource) -> Vec<u8> {
    if let Some(mac) = source.wifi_mac() {
        return mac.to_vec();
    }
    if let Some(mac) = source.bluetooth_mac() {
        return mac.to_vec();
    }
    if let Some(uid) = source.efuse_uid() {
        return uid;
    }
    if let Some(id) = source.flash_unique_id() {
        return id;
    }
    use rand::RngCore;
    let mut bytes = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// SHA-256 the raw entropy and map its first four bytes into the 8-digit
/// id space (spec §4.8).
fn derive_device_id(raw: &[u8]) -> DeviceId {
    let digest = Sha256::digest(raw);
    let first_four = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    DeviceId::new(DIGIT_ID_MIN + first_four % DIGIT_ID_SPAN)
}

/// The device's stable identity, established once at boot.
pub struct Identity {
    pub device_id: DeviceId,
    raw_entropy: Vec<u8>,
}

impl Identity {
    /// Load a previously persisted id, or derive and persist a fresh one
    /// (spec §4.8: "subsequent boots reuse the stored id"). `custom_id`, if
    /// given, overrides derivation but only when it is exactly eight
    /// digits — this is the operator override path (§4.8).
    pub fn load_or_create(
        nvs: &dyn Nvs,
        source: &dyn EntropySource,
        custom_id: Option<&str>,
    ) -> Result<Self, Error> {
        if let Some(custom) = custom_id {
            let device_id = DeviceId::parse(custom)?;
            let raw = device_id.to_wire().to_vec();
            nvs.put(NS_DEVICE_ID, KEY_DIGITS, &device_id.to_wire());
            nvs.put(NS_DEVICE_ID, KEY_RAW, &raw);
            nvs.commit();
            return Ok(Self { device_id, raw_entropy: raw });
        }

        if let Some(digits) = nvs.get(NS_DEVICE_ID, KEY_DIGITS) {
            if digits.len() == 8 {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&digits);
                let device_id = DeviceId::from_wire(&bytes)?;
                let raw = nvs.get(NS_DEVICE_ID, KEY_RAW).unwrap_or_default();
                return Ok(Self { device_id, raw_entropy: raw });
            }
        }

        let raw = collect_entropy(source);
        let device_id = derive_device_id(&raw);
        nvs.put(NS_DEVICE_ID, KEY_DIGITS, &device_id.to_wire());
        nvs.put(NS_DEVICE_ID, KEY_RAW, &raw);
        nvs.commit();
        Ok(Self { device_id, raw_entropy: raw })
    }

    pub fn raw_entropy(&self) -> &[u8] {
        &self.raw_entropy
    }
}

type HmacSha256 = Hmac<Sha256>;

/// `<id>.<unix_timestamp>.<hmac16hex>` (spec §4.8): the HMAC covers `id ||
/// timestamp` under a build-time secret, truncated to its first 8 bytes
/// (16 hex characters).
pub fn generate_auth_token(id: DeviceId, secret: &[u8], now_unix: u64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&id.to_wire());
    mac.update(now_unix.to_string().as_bytes());
    let tag = mac.finalize().into_bytes();
    let hex16: String = tag[..8].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{id}.{now_unix}.{hex16}")
}

/// Verify a token produced by [`generate_auth_token`], rejecting it once
/// `now_unix - timestamp` exceeds `max_age`.
pub fn verify_auth_token(
    token: &str,
    secret: &[u8],
    now_unix: u64,
    max_age: Duration,
) -> Result<DeviceId, Error> {
    let mut parts = token.split('.');
    let id_str = parts.next().ok_or(Error::AuthFail)?;
    let ts_str = parts.next().ok_or(Error::AuthFail)?;
    let tag_str = parts.next().ok_or(Error::AuthFail)?;
    if parts.next().is_some() {
        return Err(Error::AuthFail);
    }

    let id = DeviceId::parse(id_str)?;
    let timestamp: u64 = ts_str.parse().map_err(|_| Error::AuthFail)?;
    if now_unix.saturating_sub(timestamp) > max_age.as_secs() {
        return Err(Error::AuthFail);
    }

    let expected = generate_auth_token(id, secret, timestamp);
    let expected_tag = expected.rsplit('.').next().unwrap_or("");

    use subtle::ConstantTimeEq;
    if expected_tag.as_bytes().ct_eq(tag_str.as_bytes()).into() {
        Ok(id)
    } else {
        Err(Error::AuthFail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvs::InMemoryNvs;
    use pretty_assertions::assert_eq;

    #[test]
    fn derived_id_is_deterministic_and_in_range() {
        let a = derive_device_id(b"DE:AD:BE:EF:00:01");
        let b = derive_device_id(b"DE:AD:BE:EF:00:01");
        assert_eq!(a, b);
        assert!(a.value() >= DIGIT_ID_MIN && a.value() <= DIGIT_ID_MAX);
    }

    #[test]
    fn different_entropy_usually_derives_different_ids() {
        let a = derive_device_id(b"DE:AD:BE:EF:00:01");
        let b = derive_device_id(b"DE:AD:BE:EF:00:02");
        assert_ne!(a, b);
    }

    struct FixedWifi;
    impl EntropySource for FixedWifi {
        fn wifi_mac(&self) -> Option<[u8; 6]> {
            Some([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01])
        }
    }

    #[test]
    fn identity_persists_across_reload() {
        let nvs = InMemoryNvs::new();
        let first = Identity::load_or_create(&nvs, &FixedWifi, None).unwrap();
        let second = Identity::load_or_create(&nvs, &NoHardwareEntropy, None).unwrap();
        assert_eq!(first.device_id, second.device_id);
    }

    #[test]
    fn custom_id_override_requires_eight_digits() {
        let nvs = InMemoryNvs::new();
        assert!(Identity::load_or_create(&nvs, &NoHardwareEntropy, Some("123")).is_err());
        let id = Identity::load_or_create(&nvs, &NoHardwareEntropy, Some("55556666")).unwrap();
        assert_eq!(id.device_id, DeviceId::parse("55556666").unwrap());
    }

    #[test]
    fn auth_token_round_trips_within_max_age() {
        let id = DeviceId::parse("12345678").unwrap();
        let secret = b"build-time-secret";
        let token = generate_auth_token(id, secret, 1_000);
        let verified = verify_auth_token(&token, secret, 1_010, Duration::from_secs(60)).unwrap();
        assert_eq!(verified, id);
    }

    #[test]
    fn auth_token_rejected_once_expired() {
        let id = DeviceId::parse("12345678").unwrap();
        let secret = b"build-time-secret";
        let token = generate_auth_token(id, secret, 1_000);
        let err = verify_auth_token(&token, secret, 1_100, Duration::from_secs(60)).unwrap_err();
        assert_eq!(err, Error::AuthFail);
    }

    #[test]
    fn auth_token_rejected_with_wrong_secret() {
        let id = DeviceId::parse("12345678").unwrap();
        let token = generate_auth_token(id, b"secret-a", 1_000);
        let err = verify_auth_token(&token, b"secret-b", 1_005, Duration::from_secs(60)).unwrap_err();
        assert_eq!(err, Error::AuthFail);
    }
}
