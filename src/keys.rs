//! Key material: identity keys, signed prekeys and one-time prekeys.
//!
//! All secret types zeroize on drop and redact themselves in `Debug` output.
//! Public types are fixed-size byte values with structural equality, so they
//! can be used directly as map keys.

use crate::crypto::{self, KEY_SIZE_32, SIGNATURE_SIZE};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::CryptoRngCore;
use std::collections::BTreeMap;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_SIZE_32]);

impl PublicKey {
    /// Size in bytes
    pub const SIZE: usize = KEY_SIZE_32;

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Create from a slice, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; KEY_SIZE_32] = bytes.try_into().map_err(|_| Error::InvalidKeySize {
            expected: KEY_SIZE_32,
            actual: bytes.len(),
        })?;
        Ok(Self(array))
    }

    /// Decode a base64 wire value.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64.decode(encoded)?;
        Self::from_slice(&bytes)
    }

    /// Encode for the wire.
    #[must_use]
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Get raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes as a fingerprint
        write!(
            f,
            "PublicKey({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}...)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(pk: X25519PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        PublicKey::from(X25519PublicKey::from(secret))
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <[u8; KEY_SIZE_32]>::deserialize(deserializer)?;
        Ok(Self::from_bytes(bytes))
    }
}

/// X25519 secret key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    /// Generate a new random secret key
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    /// Create from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Get the corresponding public key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    /// Perform X25519 Diffie-Hellman.
    ///
    /// The output must go through a KDF before use as a key.
    #[must_use]
    pub fn diffie_hellman(&self, public: &PublicKey) -> DhOutput {
        let shared = self.0.diffie_hellman(&public.to_x25519());
        DhOutput(*shared.as_bytes())
    }

    /// Raw secret bytes, for persistence and XEdDSA signing.
    ///
    /// Handle with care: the copy is not zeroized automatically.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; KEY_SIZE_32] {
        self.0.to_bytes()
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Output of Diffie-Hellman operation (32 bytes)
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput(pub(crate) [u8; KEY_SIZE_32]);

impl DhOutput {
    /// Returns a byte slice of the Diffie-Hellman operation output
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// Long-lived identity of one user device.
///
/// A single X25519 keypair serves both key agreement and, through XEdDSA,
/// signing of prekeys. Never rotated.
#[derive(Clone, Debug)]
pub struct IdentityKeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl IdentityKeyPair {
    /// Generate a new identity key pair
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self::from_secret(SecretKey::generate(rng))
    }

    /// Restore from a persisted secret key
    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Get the public identity key
    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Get the secret identity key
    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

/// One-time (or signed) prekey: an id plus an X25519 keypair.
#[derive(Clone)]
pub struct PreKey {
    /// Identifier published alongside the public key
    pub id: u32,
    secret: SecretKey,
    public: PublicKey,
}

impl PreKey {
    /// Generate a fresh prekey with the given id
    pub fn generate<R: CryptoRngCore>(rng: &mut R, id: u32) -> Self {
        Self::from_secret(id, SecretKey::generate(rng))
    }

    /// Restore from a persisted secret key
    #[must_use]
    pub fn from_secret(id: u32, secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { id, secret, public }
    }

    /// Generate `count` prekeys with consecutive ids starting at `start_id`
    pub fn generate_batch<R: CryptoRngCore>(rng: &mut R, start_id: u32, count: u32) -> Vec<Self> {
        (0..count)
            .map(|offset| Self::generate(rng, start_id.wrapping_add(offset)))
            .collect()
    }

    #[must_use]
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    #[must_use]
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for PreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKey")
            .field("id", &self.id)
            .field("public", &self.public)
            .finish()
    }
}

/// Medium-term prekey signed by the identity key.
#[derive(Clone, Debug)]
pub struct SignedPreKey {
    /// The signed keypair
    pub pre_key: PreKey,
    /// XEdDSA signature over `pre_key.public_key()` by the identity key
    pub signature: [u8; SIGNATURE_SIZE],
}

impl SignedPreKey {
    /// Generate a new signed prekey and sign its public key with `identity`.
    pub fn generate<R: CryptoRngCore>(rng: &mut R, identity: &IdentityKeyPair, id: u32) -> Self {
        let pre_key = PreKey::generate(rng, id);
        let signature = crypto::sign(rng, identity.secret_key(), pre_key.public_key().as_bytes());
        Self { pre_key, signature }
    }

    /// Signed prekey id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.pre_key.id
    }

    /// Check the signature against the owner's identity key
    pub fn verify(&self, identity: &PublicKey) -> Result<()> {
        crypto::verify(identity, self.pre_key.public_key().as_bytes(), &self.signature)
    }
}

/// Local pool of unused one-time prekeys.
///
/// Keys leave the pool exactly once: when a handshake referencing them is
/// received. A second handshake naming the same id fails with
/// [`Error::NoOneTimePreKeyAvailable`].
#[derive(Debug, Default, Clone)]
pub struct PreKeyPool {
    keys: BTreeMap<u32, PreKey>,
    next_id: u32,
}

impl PreKeyPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and add `count` fresh keys, returning them for publication
    pub fn replenish<R: CryptoRngCore>(&mut self, rng: &mut R, count: u32) -> Vec<PreKey> {
        let batch = PreKey::generate_batch(rng, self.next_id, count);
        self.next_id = self.next_id.wrapping_add(count);
        for key in &batch {
            self.keys.insert(key.id, key.clone());
        }
        batch
    }

    /// Insert a key restored from storage
    pub fn insert(&mut self, key: PreKey) {
        self.next_id = self.next_id.max(key.id.wrapping_add(1));
        self.keys.insert(key.id, key);
    }

    /// Remove and return the key with the given id
    pub fn consume(&mut self, id: u32) -> Result<PreKey> {
        self.keys.remove(&id).ok_or(Error::NoOneTimePreKeyAvailable)
    }

    /// Look up a key without consuming it
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&PreKey> {
        self.keys.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
