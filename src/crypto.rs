//! Secure session layer (spec §4.3): AEAD seal/open, ECDH key agreement,
//! PSK/password-derived keys, nonce monotonicity, replay window, key-age
//! policy.
//!
//! Grounded in `examples/other_examples/.../summit-core/src/crypto.rs`,
//! which pairs `x25519_dalek` keypairs with `zeroize`-wrapped key material
//! for an analogous per-peer session design; the teacher's own PSK
//! derivation (`server.rs::ServerState::enable_psk`, SHA256 of `psk || salt`)
//! is generalized here into the spec's HKDF/PBKDF2 paths.

use crate::config::{AEAD_TAG_LEN, KEY_AGE_LIMIT, KEY_PACKET_THRESHOLD, PBKDF2_ITERATIONS};
use crate::error::Error;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use hkdf::Hkdf;
use hmac::Hmac;
use sha2::Sha256;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// A freshly generated X25519 keypair (spec §4.3 `generate_keypair`).
pub struct KeyPair {
    secret: StaticSecret,
    pub public: [u8; 32],
}

impl KeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = *PublicKey::from(&secret).as_bytes();
        Self { secret, public }
    }

    /// `compute_shared_secret(peer_pk)` (spec §4.3).
    pub fn shared_secret(&self, peer_public: &[u8; 32]) -> [u8; 32] {
        let peer = PublicKey::from(*peer_public);
        *self.secret.diffie_hellman(&peer).as_bytes()
    }
}

/// Derived session material: the first 16 bytes of an HKDF/PBKDF2 output
/// become the session key, the next 12 seed the nonce counter (spec §4.3).
pub struct DerivedSession {
    pub key: [u8; 16],
    pub nonce_seed: [u8; 12],
}

/// HKDF-SHA256 derivation from an ECDH shared secret, with an optional salt
/// (spec §4.3).
pub fn derive_from_shared_secret(shared_secret: &[u8; 32], salt: Option<&[u8]>) -> DerivedSession {
    let hk = Hkdf::<Sha256>::new(salt, shared_secret);
    let mut okm = [0u8; 28];
    hk.expand(b"wavetalk session v2", &mut okm)
        .expect("28 bytes is a valid HKDF-SHA256 output length");
    let mut key = [0u8; 16];
    let mut nonce_seed = [0u8; 12];
    key.copy_from_slice(&okm[..16]);
    nonce_seed.copy_from_slice(&okm[16..]);
    DerivedSession { key, nonce_seed }
}

/// PBKDF2-SHA256 derivation from an operator-entered password (spec §4.3).
/// Produces the same 16+12 byte layout as the ECDH path.
pub fn derive_from_password(password: &str, salt: &[u8]) -> DerivedSession {
    let mut okm = [0u8; 28];
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut okm)
        .expect("28 bytes is a valid PBKDF2 output length");
    let mut key = [0u8; 16];
    let mut nonce_seed = [0u8; 12];
    key.copy_from_slice(&okm[..16]);
    nonce_seed.copy_from_slice(&okm[16..]);
    DerivedSession { key, nonce_seed }
}

/// Per-peer crypto context (spec §3 "Crypto context").
pub struct Context {
    key: Zeroizing<[u8; 16]>,
    key_id: u16,
    counter: u64,
    high_water: Option<u64>,
    seal_count: u64,
    key_created: Instant,
    pub initialized: bool,
    pub agreed: bool,
}

impl Context {
    /// A context with no key installed yet (spec: "initialized/agreed flags").
    pub fn empty() -> Self {
        Self {
            key: Zeroizing::new([0u8; 16]),
            key_id: 0,
            counter: 0,
            high_water: None,
            seal_count: 0,
            key_created: Instant::now(),
            initialized: false,
            agreed: false,
        }
    }

    fn install(&mut self, key: [u8; 16], nonce_seed: &[u8; 12], key_id: u16) {
        self.key = Zeroizing::new(key);
        self.key_id = key_id;
        // first 8 bytes of the derived seed become the initial counter value.
        self.counter = u64::from_be_bytes(nonce_seed[4..12].try_into().unwrap());
        self.high_water = None;
        self.seal_count = 0;
        self.key_created = Instant::now();
        self.initialized = true;
    }

    /// Install a key derived via ECDH (spec §4.3).
    pub fn set_agreed_key(&mut self, derived: DerivedSession, key_id: u16) {
        self.install(derived.key, &derived.nonce_seed, key_id);
        self.agreed = true;
    }

    /// `set_psk(key16)` (spec §4.3): install a key directly, e.g. from a
    /// pre-shared key or a password derivation.
    pub fn set_psk(&mut self, key: [u8; 16], key_id: u16) {
        self.install(key, &[0u8; 12], key_id);
        self.agreed = true;
    }

    /// Constant-time PSK comparison (spec §4.3 side-channel rule), for
    /// verifying an operator-entered key against a stored one.
    pub fn psk_matches(candidate: &[u8; 16], expected: &[u8; 16]) -> bool {
        candidate.ct_eq(expected).into()
    }

    fn derive_nonce(&self, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0..2].copy_from_slice(&self.key_id.to_be_bytes());
        nonce[4..12].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Seal `plaintext` under `aad` (the serialized header with the
    /// integrity field zeroed, per spec §6). Increments the nonce counter
    /// before encrypting and refuses once the counter would wrap. Returns
    /// the counter value used alongside the ciphertext — the caller MUST
    /// carry it to the peer (outside this type) so [`Context::open`] can be
    /// given the same value back; nothing here puts it on the wire itself.
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<(u64, Vec<u8>), Error> {
        if !self.initialized {
            return Err(Error::KeyNotAgreed);
        }
        let next = self.counter.checked_add(1).ok_or(Error::NonceExhausted)?;
        self.counter = next;
        let nonce_bytes = self.derive_nonce(next);
        let cipher = Aes128Gcm::new_from_slice(self.key.as_ref()).expect("16-byte key");
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad })
            .map_err(|_| Error::AuthFail)?;
        self.seal_count += 1;
        Ok((next, ciphertext))
    }

    /// Open a sealed buffer. Rejects with `AuthFail` on tag mismatch
    /// (verified in constant time internally by the AEAD implementation),
    /// `NonceReplay` if the embedded counter is at or below the replay
    /// high-water mark, per spec §4.3/§8.
    pub fn open(&mut self, ciphertext: &[u8], aad: &[u8], counter: u64) -> Result<Vec<u8>, Error> {
        if !self.initialized {
            return Err(Error::KeyNotAgreed);
        }
        if ciphertext.len() < AEAD_TAG_LEN {
            return Err(Error::AuthFail);
        }
        if let Some(high) = self.high_water {
            if counter <= high {
                return Err(Error::NonceReplay);
            }
        }
        let nonce_bytes = self.derive_nonce(counter);
        let cipher = Aes128Gcm::new_from_slice(self.key.as_ref()).expect("16-byte key");
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: ciphertext, aad })
            .map_err(|_| Error::AuthFail)?;
        self.high_water = Some(counter);
        Ok(plaintext)
    }

    /// Spec §4.3/§8: refresh is required once the sealed-packet count
    /// crosses the threshold, or the key's wall-clock age exceeds the limit.
    pub fn needs_refresh(&self) -> bool {
        self.seal_count >= KEY_PACKET_THRESHOLD || self.key_created.elapsed() >= KEY_AGE_LIMIT
    }

    pub fn key_age(&self) -> Duration {
        self.key_created.elapsed()
    }

    pub fn seal_count(&self) -> u64 {
        self.seal_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn agreed_pair() -> (Context, Context) {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let shared_a = a.shared_secret(&b.public);
        let shared_b = b.shared_secret(&a.public);
        assert_eq!(shared_a, shared_b);
        let derived_a = derive_from_shared_secret(&shared_a, None);
        let derived_b = derive_from_shared_secret(&shared_b, None);
        let mut ctx_a = Context::empty();
        ctx_a.set_agreed_key(derived_a, 1);
        let mut ctx_b = Context::empty();
        ctx_b.set_agreed_key(derived_b, 1);
        (ctx_a, ctx_b)
    }

    #[test]
    fn ecdh_produces_matching_session_keys() {
        let (a, b) = agreed_pair();
        assert_eq!(a.key.as_ref(), b.key.as_ref());
    }

    #[test]
    fn seal_open_round_trip_is_identity() {
        let (mut sender, mut receiver) = agreed_pair();
        let aad = b"header-bytes";
        let (counter, sealed) = sender.seal(b"hello", aad).unwrap();
        let opened = receiver.open(&sealed, aad, counter).unwrap();
        assert_eq!(opened, b"hello");
    }

    #[test]
    fn open_fails_auth_on_wrong_aad() {
        let (mut sender, mut receiver) = agreed_pair();
        let (counter, sealed) = sender.seal(b"hello", b"aad-a").unwrap();
        let err = receiver.open(&sealed, b"aad-b", counter).unwrap_err();
        assert_eq!(err, Error::AuthFail);
    }

    #[test]
    fn replay_is_rejected_after_first_accept() {
        let (mut sender, mut receiver) = agreed_pair();
        let aad = b"aad";
        let (counter, sealed) = sender.seal(b"one", aad).unwrap();
        receiver.open(&sealed, aad, counter).unwrap();
        let err = receiver.open(&sealed, aad, counter).unwrap_err();
        assert_eq!(err, Error::NonceReplay);
    }

    #[test]
    fn password_derivation_is_deterministic_given_same_salt() {
        let salt = b"fixed-salt";
        let a = derive_from_password("1234", salt);
        let b = derive_from_password("1234", salt);
        assert_eq!(a.key, b.key);
        let c = derive_from_password("4321", salt);
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn needs_refresh_flags_on_age() {
        let mut ctx = Context::empty();
        ctx.set_psk([7u8; 16], 1);
        ctx.key_created = Instant::now() - KEY_AGE_LIMIT - Duration::from_secs(1);
        assert!(ctx.needs_refresh());
    }
}
