//! Double Ratchet protocol for forward-secure encryption
//!
//! ## Algorithm Overview
//!
//! The Double Ratchet combines:
//! 1. **Symmetric-key ratchet**: derives a fresh message key for each message
//! 2. **DH ratchet**: refreshes the root key whenever the peer presents a new
//!    ratchet public key
//!
//! ## State
//!
//! Each party maintains:
//! - Root key (RK): updated on every DH ratchet step
//! - Sending chain key (`CK_s`): set by the first sending step, then advanced
//!   per message
//! - Receiving chain key (`CK_r`): set by the first received header, then
//!   advanced per message
//! - DH key pair: rotated on every receiving DH ratchet step
//!
//! Decryption is transactional: the state only changes when the message
//! authenticates.

use crate::crypto::{aead_decrypt, aead_encrypt, kdf_ck, kdf_rk, MessageKey, SymmetricKey};
use crate::crypto::{KEY_SIZE_32, MESSAGE_KEY_SIZE};
use crate::error::{ChainKind, Error, Result};
use crate::keys::{PublicKey, SecretKey};
use rand_core::CryptoRngCore;
use std::collections::BTreeMap;
use tracing::debug;

/// Maximum number of message keys a single header may force us to skip
pub const MAX_SKIP: u32 = 1000;

/// Encoded header size: dh (32) || pn (4) || n (4)
pub const HEADER_SIZE: usize = 40;

const STATE_VERSION: u8 = 1;

const FLAG_DHR: u8 = 0b001;
const FLAG_CKS: u8 = 0b010;
const FLAG_CKR: u8 = 0b100;

/// Message header containing ratchet public key and message numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Sender's current DH ratchet public key
    pub dh: PublicKey,

    /// Length of the sender's previous sending chain
    pub pn: u32,

    /// Message number in the current sending chain
    pub n: u32,
}

impl Header {
    /// Big-endian wire encoding
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[..32].copy_from_slice(self.dh.as_bytes());
        bytes[32..36].copy_from_slice(&self.pn.to_be_bytes());
        bytes[36..].copy_from_slice(&self.n.to_be_bytes());
        bytes
    }

    /// Decode exactly [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(Error::InvalidHeader);
        }

        let dh = PublicKey::from_slice(&bytes[..32]).map_err(|_| Error::InvalidHeader)?;
        let pn = u32::from_be_bytes(bytes[32..36].try_into().map_err(|_| Error::InvalidHeader)?);
        let n = u32::from_be_bytes(bytes[36..40].try_into().map_err(|_| Error::InvalidHeader)?);

        Ok(Self { dh, pn, n })
    }
}

/// Encrypted message with header and ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message header (not encrypted, but authenticated)
    pub header: Header,

    /// `iv || ciphertext || tag`
    pub ciphertext: Vec<u8>,
}

impl Message {
    /// Serialize as `header || ciphertext`
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Deserialize message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidMessageFormat);
        }
        let header = Header::from_bytes(&bytes[..HEADER_SIZE])?;
        Ok(Self {
            header,
            ciphertext: bytes[HEADER_SIZE..].to_vec(),
        })
    }
}

/// Per-session Double Ratchet state.
///
/// Single-writer: callers must serialize `encrypt` and `decrypt` on one state.
#[derive(Clone)]
pub struct RatchetState {
    dhs: SecretKey,
    dhs_public: PublicKey,
    dhr: Option<PublicKey>,
    rk: SymmetricKey,
    cks: Option<SymmetricKey>,
    ckr: Option<SymmetricKey>,
    ns: u32,
    nr: u32,
    pn: u32,
    ad: Vec<u8>,
    skipped: BTreeMap<(PublicKey, u32), MessageKey>,
}

impl RatchetState {
    fn new(rk: SymmetricKey, ad: Vec<u8>, dhs: SecretKey, dhr: Option<PublicKey>) -> Self {
        Self {
            dhs_public: dhs.public_key(),
            dhs,
            dhr,
            rk,
            cks: None,
            ckr: None,
            ns: 0,
            nr: 0,
            pn: 0,
            ad,
            skipped: BTreeMap::new(),
        }
    }

    /// Initialize the initiator's state after X3DH.
    ///
    /// `peer_ratchet_key` is the responder's signed prekey. The sending chain
    /// is derived lazily by the first `encrypt`.
    pub fn init_initiator<R: CryptoRngCore>(
        rng: &mut R,
        shared_secret: SymmetricKey,
        ad: Vec<u8>,
        peer_ratchet_key: PublicKey,
    ) -> Self {
        Self::new(shared_secret, ad, SecretKey::generate(rng), Some(peer_ratchet_key))
    }

    /// Initialize the responder's state after X3DH, using the signed prekey
    /// the initiator ran the handshake against as the first ratchet key.
    #[must_use]
    pub fn init_responder(shared_secret: SymmetricKey, ad: Vec<u8>, own_ratchet_key: SecretKey) -> Self {
        Self::new(shared_secret, ad, own_ratchet_key, None)
    }

    /// Encrypt a message.
    ///
    /// The AEAD binds `session ad || ad || header`.
    ///
    /// # Errors
    /// `Error::MissingChainKey` if no sending chain exists and no peer
    /// ratchet key is known yet.
    pub fn encrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<Message> {
        if self.cks.is_none() {
            let dhr = self.dhr.ok_or(Error::MissingChainKey(ChainKind::Sending))?;
            let (rk, cks) = kdf_rk(&self.rk, &self.dhs.diffie_hellman(&dhr))?;
            self.rk = rk;
            self.cks = Some(cks);
            debug!(pn = self.pn, "sending ratchet step");
        }

        let cks = self
            .cks
            .as_ref()
            .ok_or(Error::MissingChainKey(ChainKind::Sending))?;
        let (cks, message_key) = kdf_ck(cks)?;
        self.cks = Some(cks);

        let header = Header {
            dh: self.dhs_public,
            pn: self.pn,
            n: self.ns,
        };
        self.ns = self.ns.wrapping_add(1);

        let ciphertext = aead_encrypt(rng, &message_key, plaintext, &self.full_ad(ad, &header))?;
        Ok(Message { header, ciphertext })
    }

    /// Decrypt a message.
    ///
    /// Runs against a working copy and commits it only when the message
    /// authenticates, so a forged or corrupted message leaves the state as
    /// it was.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &Message,
        ad: &[u8],
    ) -> Result<Vec<u8>> {
        let mut working = self.clone();
        let plaintext = working.decrypt_uncommitted(rng, message, ad)?;
        *self = working;
        Ok(plaintext)
    }

    fn decrypt_uncommitted<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &Message,
        ad: &[u8],
    ) -> Result<Vec<u8>> {
        let header = message.header;
        let full_ad = self.full_ad(ad, &header);

        if let Some(message_key) = self.skipped.remove(&(header.dh, header.n)) {
            debug!(n = header.n, "using skipped message key");
            return aead_decrypt(&message_key, &message.ciphertext, &full_ad);
        }

        if Some(header.dh) != self.dhr {
            if self.ckr.is_some() {
                self.skip_message_keys(header.pn)?;
            }
            self.dh_ratchet(rng, &header)?;
        } else if header.n < self.nr {
            return Err(Error::DuplicateMessage {
                message_number: header.n,
            });
        }

        self.skip_message_keys(header.n)?;

        let ckr = self
            .ckr
            .as_ref()
            .ok_or(Error::MissingChainKey(ChainKind::Receiving))?;
        let (ckr, message_key) = kdf_ck(ckr)?;
        self.ckr = Some(ckr);
        self.nr = self.nr.wrapping_add(1);

        aead_decrypt(&message_key, &message.ciphertext, &full_ad)
    }

    /// Receiving DH ratchet step, eagerly deriving the next sending chain.
    fn dh_ratchet<R: CryptoRngCore>(&mut self, rng: &mut R, header: &Header) -> Result<()> {
        self.pn = self.ns;
        self.ns = 0;
        self.nr = 0;
        self.dhr = Some(header.dh);

        let (rk, ckr) = kdf_rk(&self.rk, &self.dhs.diffie_hellman(&header.dh))?;
        self.rk = rk;
        self.ckr = Some(ckr);

        self.dhs = SecretKey::generate(rng);
        self.dhs_public = self.dhs.public_key();

        let (rk, cks) = kdf_rk(&self.rk, &self.dhs.diffie_hellman(&header.dh))?;
        self.rk = rk;
        self.cks = Some(cks);

        debug!(pn = self.pn, "receiving ratchet step");
        Ok(())
    }

    /// Cache message keys of the receiving chain from `nr` up to `until`.
    fn skip_message_keys(&mut self, until: u32) -> Result<()> {
        if until <= self.nr {
            return Ok(());
        }
        if until > self.nr.saturating_add(MAX_SKIP) {
            return Err(Error::RatchetExhausted {
                current: self.nr,
                requested: until,
                max_skip: MAX_SKIP,
            });
        }

        let dhr = self.dhr.ok_or(Error::MissingChainKey(ChainKind::Receiving))?;
        let mut chain_key = self
            .ckr
            .clone()
            .ok_or(Error::MissingChainKey(ChainKind::Receiving))?;

        while self.nr < until {
            let (next, message_key) = kdf_ck(&chain_key)?;
            self.skipped.insert((dhr, self.nr), message_key);
            chain_key = next;
            self.nr += 1;
        }
        self.ckr = Some(chain_key);
        Ok(())
    }

    fn full_ad(&self, ad: &[u8], header: &Header) -> Vec<u8> {
        let mut full = Vec::with_capacity(self.ad.len() + ad.len() + HEADER_SIZE);
        full.extend_from_slice(&self.ad);
        full.extend_from_slice(ad);
        full.extend_from_slice(&header.to_bytes());
        full
    }

    /// Peer ratchet key this state last ratcheted to
    #[must_use]
    pub fn remote_ratchet_key(&self) -> Option<&PublicKey> {
        self.dhr.as_ref()
    }

    /// Our current ratchet public key (`header.dh` of the next message we send)
    #[must_use]
    pub fn local_ratchet_key(&self) -> &PublicKey {
        &self.dhs_public
    }

    /// Associated data fixed by the handshake
    #[must_use]
    pub fn associated_data(&self) -> &[u8] {
        &self.ad
    }

    /// True if a cached key exists for this header
    #[must_use]
    pub fn has_skipped_key(&self, header: &Header) -> bool {
        self.skipped.contains_key(&(header.dh, header.n))
    }

    /// Number of cached out-of-order message keys
    #[must_use]
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Messages sent on the current sending chain
    #[must_use]
    pub fn sent_count(&self) -> u32 {
        self.ns
    }

    /// Messages received on the current receiving chain
    #[must_use]
    pub fn received_count(&self) -> u32 {
        self.nr
    }

    #[cfg(test)]
    pub(crate) fn root_key(&self) -> &SymmetricKey {
        &self.rk
    }

    /// Versioned binary encoding.
    ///
    /// `version || dhs || dhs_pub || flags || [dhr] || rk || [cks] || [ckr] ||
    /// ns || nr || pn || len(ad) || ad || count || (dh || n || mk)*`,
    /// all integers big-endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + 6 * KEY_SIZE_32 + 20 + self.ad.len() + self.skipped.len() * (36 + MESSAGE_KEY_SIZE),
        );
        out.push(STATE_VERSION);
        out.extend_from_slice(&self.dhs.to_bytes());
        out.extend_from_slice(self.dhs_public.as_bytes());

        let mut flags = 0u8;
        if self.dhr.is_some() {
            flags |= FLAG_DHR;
        }
        if self.cks.is_some() {
            flags |= FLAG_CKS;
        }
        if self.ckr.is_some() {
            flags |= FLAG_CKR;
        }
        out.push(flags);

        if let Some(dhr) = &self.dhr {
            out.extend_from_slice(dhr.as_bytes());
        }
        out.extend_from_slice(self.rk.as_bytes());
        if let Some(cks) = &self.cks {
            out.extend_from_slice(cks.as_bytes());
        }
        if let Some(ckr) = &self.ckr {
            out.extend_from_slice(ckr.as_bytes());
        }

        out.extend_from_slice(&self.ns.to_be_bytes());
        out.extend_from_slice(&self.nr.to_be_bytes());
        out.extend_from_slice(&self.pn.to_be_bytes());

        out.extend_from_slice(&len_u32(self.ad.len()).to_be_bytes());
        out.extend_from_slice(&self.ad);

        out.extend_from_slice(&len_u32(self.skipped.len()).to_be_bytes());
        for ((dh, n), message_key) in &self.skipped {
            out.extend_from_slice(dh.as_bytes());
            out.extend_from_slice(&n.to_be_bytes());
            out.extend_from_slice(message_key.as_bytes());
        }
        out
    }

    /// Decode a state produced by [`RatchetState::to_bytes`].
    ///
    /// # Errors
    /// `Error::UnsupportedVersion` for an unknown version byte,
    /// `Error::InvalidStateEncoding` for truncated or inconsistent input.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = StateReader::new(bytes);

        let version = reader.u8()?;
        if version != STATE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let dhs = SecretKey::from_bytes(reader.array()?);
        let dhs_public = PublicKey::from_bytes(reader.array()?);
        if dhs.public_key() != dhs_public {
            return Err(Error::InvalidStateEncoding);
        }

        let flags = reader.u8()?;
        if flags & !(FLAG_DHR | FLAG_CKS | FLAG_CKR) != 0 {
            return Err(Error::InvalidStateEncoding);
        }

        let dhr = if flags & FLAG_DHR != 0 {
            Some(PublicKey::from_bytes(reader.array()?))
        } else {
            None
        };
        let rk = SymmetricKey::from_bytes(reader.array()?);
        let cks = if flags & FLAG_CKS != 0 {
            Some(SymmetricKey::from_bytes(reader.array()?))
        } else {
            None
        };
        let ckr = if flags & FLAG_CKR != 0 {
            Some(SymmetricKey::from_bytes(reader.array()?))
        } else {
            None
        };

        let ns = reader.u32()?;
        let nr = reader.u32()?;
        let pn = reader.u32()?;

        let ad_len = reader.u32()? as usize;
        let ad = reader.take(ad_len)?.to_vec();

        let count = reader.u32()?;
        let mut skipped = BTreeMap::new();
        for _ in 0..count {
            let dh = PublicKey::from_bytes(reader.array()?);
            let n = reader.u32()?;
            let message_key = MessageKey::from_bytes(reader.array()?);
            skipped.insert((dh, n), message_key);
        }

        if !reader.is_empty() {
            return Err(Error::InvalidStateEncoding);
        }

        Ok(Self {
            dhs,
            dhs_public,
            dhr,
            rk,
            cks,
            ckr,
            ns,
            nr,
            pn,
            ad,
            skipped,
        })
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

struct StateReader<'a> {
    bytes: &'a [u8],
}

impl<'a> StateReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() < len {
            return Err(Error::InvalidStateEncoding);
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?
            .try_into()
            .map_err(|_| Error::InvalidStateEncoding)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl std::fmt::Debug for RatchetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatchetState")
            .field("dhs", &self.dhs_public)
            .field("dhr", &self.dhr)
            .field("ns", &self.ns)
            .field("nr", &self.nr)
            .field("pn", &self.pn)
            .field("skipped_keys", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

impl serde::Serialize for RatchetState {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for RatchetState {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct StateVisitor;

        impl<'de> serde::de::Visitor<'de> for StateVisitor {
            type Value = RatchetState;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("an encoded ratchet state")
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Self::Value, E> {
                RatchetState::from_bytes(v).map_err(E::custom)
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    bytes.push(byte);
                }
                RatchetState::from_bytes(&bytes).map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_bytes(StateVisitor)
    }
}
