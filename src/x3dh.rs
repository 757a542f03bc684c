//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! ## Protocol Flow
//!
//! 1. **Responder (Bob)** publishes a prekey bundle containing:
//!    - Identity key (long-term X25519 key)
//!    - Signed prekey (medium-term) with an XEdDSA signature by the identity key
//!    - Optionally one one-time prekey
//!
//! 2. **Initiator (Alice)** verifies the signature, then computes:
//!    - DH1 = `DH(IK_A, SPK_B)`
//!    - DH2 = `DH(EK_A, IK_B)`
//!    - DH3 = `DH(EK_A, SPK_B)`
//!    - DH4 = `DH(EK_A, OPK_B)` [if OPK available]
//!    - SK = `HKDF(0xFF^32, DH1 || DH2 || DH3 [|| DH4], "TRILL_X3DH")`
//!
//! 3. **Responder (Bob)** receives a [`PreKeyPreamble`] naming Alice's identity
//!    and ephemeral keys plus the prekey ids she used, and computes the same SK.
//!
//! Both sides bind the session to `AD = IK_A || IK_B`.

use crate::crypto::{derive_x3dh_secret, SymmetricKey, SIGNATURE_SIZE};
use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, PreKey, PublicKey, SecretKey, SignedPreKey};
use crate::network::PreKeyBundleWire;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Prekey bundle fetched from the directory to start a session with one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreKeyBundle {
    /// Long-term identity key (X25519 public key)
    pub identity_key: PublicKey,

    /// Id of the signed prekey, echoed back in the preamble
    pub signed_prekey_id: u32,

    /// Medium-term signed prekey
    pub signed_prekey: PublicKey,

    /// XEdDSA signature over `signed_prekey` by `identity_key`
    pub signed_prekey_signature: [u8; SIGNATURE_SIZE],

    /// Optional one-time prekey; enables the fourth DH term
    pub one_time_prekey: Option<(u32, PublicKey)>,
}

impl PreKeyBundle {
    /// Assemble a bundle for publication from local key material.
    #[must_use]
    pub fn new(
        identity: &IdentityKeyPair,
        signed_prekey: &SignedPreKey,
        one_time_prekey: Option<&PreKey>,
    ) -> Self {
        Self {
            identity_key: *identity.public_key(),
            signed_prekey_id: signed_prekey.id(),
            signed_prekey: *signed_prekey.pre_key.public_key(),
            signed_prekey_signature: signed_prekey.signature,
            one_time_prekey: one_time_prekey.map(|opk| (opk.id, *opk.public_key())),
        }
    }

    /// Decode the base64 wire form, checking every key and signature length.
    ///
    /// # Errors
    /// `Error::InvalidKeySize` for a field of the wrong length,
    /// `Error::Serialization` for invalid base64.
    pub fn from_wire(wire: &PreKeyBundleWire) -> Result<Self> {
        let identity_key = PublicKey::from_base64(&wire.identity_key)?;
        let signed_prekey = PublicKey::from_base64(&wire.signed_prekey)?;

        let signature_bytes = BASE64.decode(&wire.signature)?;
        let signed_prekey_signature: [u8; SIGNATURE_SIZE] =
            signature_bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::InvalidKeySize {
                    expected: SIGNATURE_SIZE,
                    actual: signature_bytes.len(),
                })?;

        let one_time_prekey = match (&wire.one_time_prekey_id, &wire.one_time_prekey) {
            (Some(id), Some(key)) => Some((*id, PublicKey::from_base64(key)?)),
            (None, None) => None,
            _ => return Err(Error::InvalidMessageFormat),
        };

        Ok(Self {
            identity_key,
            signed_prekey_id: wire.signed_prekey_id,
            signed_prekey,
            signed_prekey_signature,
            one_time_prekey,
        })
    }

    /// Encode for the directory.
    #[must_use]
    pub fn to_wire(&self) -> PreKeyBundleWire {
        PreKeyBundleWire {
            identity_key: self.identity_key.to_base64(),
            signed_prekey_id: self.signed_prekey_id,
            signed_prekey: self.signed_prekey.to_base64(),
            signature: BASE64.encode(self.signed_prekey_signature),
            one_time_prekey_id: self.one_time_prekey.map(|(id, _)| id),
            one_time_prekey: self.one_time_prekey.map(|(_, key)| key.to_base64()),
        }
    }

    /// Verifies the XEdDSA signature on the signed prekey.
    ///
    /// # Errors
    /// `Error::SignatureInvalid` if verification fails
    pub fn verify_signature(&self) -> Result<()> {
        crate::crypto::verify(
            &self.identity_key,
            self.signed_prekey.as_bytes(),
            &self.signed_prekey_signature,
        )
    }
}

/// Handshake keys an initiating session attaches to its messages until the
/// responder replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyPreamble {
    /// Initiator's identity public key
    pub identity_key: PublicKey,

    /// Initiator's ephemeral public key (the session's base key)
    pub ephemeral_key: PublicKey,

    /// Responder signed prekey the initiator used
    pub signed_prekey_id: u32,

    /// Responder one-time prekey the initiator used, if any
    pub one_time_prekey_id: Option<u32>,
}

/// Output of either side of the handshake.
#[derive(Debug)]
pub struct X3dhResult {
    /// Shared secret; becomes the first root key
    pub shared_secret: SymmetricKey,

    /// `IK_A || IK_B` on both sides
    pub associated_data: Vec<u8>,

    /// Ephemeral public key used in the handshake
    pub ephemeral_key: PublicKey,

    /// Ephemeral secret (initiator only)
    pub ephemeral_secret: Option<SecretKey>,
}

/// Initiates X3DH key agreement (Alice's side).
///
/// The peer's signed prekey signature is verified before any DH is computed.
///
/// # Errors
/// `Error::SignatureInvalid` if the signed prekey is not signed by `peer_identity`
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    own_identity: &IdentityKeyPair,
    peer_identity: &PublicKey,
    peer_signed_prekey: &PublicKey,
    peer_one_time_prekey: Option<&PublicKey>,
    peer_signature: &[u8; SIGNATURE_SIZE],
) -> Result<X3dhResult> {
    crate::crypto::verify(peer_identity, peer_signed_prekey.as_bytes(), peer_signature)?;

    let ephemeral = SecretKey::generate(rng);

    let dh1 = own_identity.secret_key().diffie_hellman(peer_signed_prekey);
    let dh2 = ephemeral.diffie_hellman(peer_identity);
    let dh3 = ephemeral.diffie_hellman(peer_signed_prekey);
    let dh4 = peer_one_time_prekey.map(|opk| ephemeral.diffie_hellman(opk));

    let shared_secret = derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    let mut associated_data = Vec::with_capacity(64);
    associated_data.extend_from_slice(own_identity.public_key().as_bytes());
    associated_data.extend_from_slice(peer_identity.as_bytes());

    Ok(X3dhResult {
        shared_secret,
        associated_data,
        ephemeral_key: ephemeral.public_key(),
        ephemeral_secret: Some(ephemeral),
    })
}

/// Runs [`initiate`] against a fetched bundle and builds the preamble to send.
pub fn initiate_with_bundle<R: CryptoRngCore>(
    rng: &mut R,
    own_identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<(X3dhResult, PreKeyPreamble)> {
    let result = initiate(
        rng,
        own_identity,
        &bundle.identity_key,
        &bundle.signed_prekey,
        bundle.one_time_prekey.as_ref().map(|(_, key)| key),
        &bundle.signed_prekey_signature,
    )?;

    let preamble = PreKeyPreamble {
        identity_key: *own_identity.public_key(),
        ephemeral_key: result.ephemeral_key,
        signed_prekey_id: bundle.signed_prekey_id,
        one_time_prekey_id: bundle.one_time_prekey.map(|(id, _)| id),
    };
    Ok((result, preamble))
}

/// Responds to X3DH initiation (Bob's side).
///
/// `own_one_time_prekey` must be the key named by the preamble, already
/// removed from the local pool by the caller.
pub fn receive(
    own_identity: &IdentityKeyPair,
    own_signed_prekey: &SecretKey,
    own_one_time_prekey: Option<&SecretKey>,
    peer_identity: &PublicKey,
    peer_ephemeral: &PublicKey,
) -> Result<X3dhResult> {
    let dh1 = own_signed_prekey.diffie_hellman(peer_identity);
    let dh2 = own_identity.secret_key().diffie_hellman(peer_ephemeral);
    let dh3 = own_signed_prekey.diffie_hellman(peer_ephemeral);
    let dh4 = own_one_time_prekey.map(|opk| opk.diffie_hellman(peer_ephemeral));

    let shared_secret = derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    let mut associated_data = Vec::with_capacity(64);
    associated_data.extend_from_slice(peer_identity.as_bytes());
    associated_data.extend_from_slice(own_identity.public_key().as_bytes());

    Ok(X3dhResult {
        shared_secret,
        associated_data,
        ephemeral_key: *peer_ephemeral,
        ephemeral_secret: None,
    })
}
