//! Cryptographic primitives for X3DH and the Double Ratchet.
//!
//! Key derivation (HKDF-SHA256 with the protocol's fixed labels), the
//! AES-256-CBC + HMAC-SHA256 message AEAD, hashing, and the signing
//! wrappers used for signed prekeys. Symmetric keys zeroize on drop.

use crate::error::{Error, Result};
use crate::keys::{DhOutput, PublicKey, SecretKey};
use crate::xeddsa::{self, XEdSigningKey};

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const X3DH_INFO: &[u8] = b"TRILL_X3DH";
const ROOT_INFO: &[u8] = b"TRILL";
const CHAIN_INFO: &[u8] = b"TRILL_CK";
const CHAIN_IKM: &[u8] = b"CK";

pub const KEY_SIZE_32: usize = 32;
pub const MESSAGE_KEY_SIZE: usize = 64;
pub const SIGNATURE_SIZE: usize = 64;
pub const IV_SIZE: usize = 16;
pub const TAG_SIZE: usize = 32;

/// Largest HKDF-SHA256 output: 255 blocks of 32 bytes.
pub const HKDF_MAX_OUTPUT: usize = 255 * 32;

/// 256-bit symmetric key (root or chain key) with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_SIZE_32]);

impl SymmetricKey {
    /// Creates a symmetric key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Returns the key as a byte array reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// 64-byte per-message key: AES-256 key followed by HMAC-SHA256 key.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct MessageKey([u8; MESSAGE_KEY_SIZE]);

impl MessageKey {
    #[must_use]
    pub fn from_bytes(bytes: [u8; MESSAGE_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; MESSAGE_KEY_SIZE] {
        &self.0
    }

    fn cipher_key(&self) -> &[u8] {
        &self.0[..KEY_SIZE_32]
    }

    fn mac_key(&self) -> &[u8] {
        &self.0[KEY_SIZE_32..]
    }
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageKey([REDACTED])")
    }
}

/// Generate a fresh X25519 keypair.
pub fn generate_keypair<R: CryptoRngCore>(rng: &mut R) -> (SecretKey, PublicKey) {
    let secret = SecretKey::generate(rng);
    let public = secret.public_key();
    (secret, public)
}

/// X25519 Diffie-Hellman.
#[must_use]
pub fn dh(secret: &SecretKey, public: &PublicKey) -> DhOutput {
    secret.diffie_hellman(public)
}

/// XEdDSA signature over `data` by the holder of the X25519 `secret`.
pub fn sign<R: CryptoRngCore>(
    rng: &mut R,
    secret: &SecretKey,
    data: &[u8],
) -> [u8; SIGNATURE_SIZE] {
    let mut z = Zeroizing::new([0u8; 64]);
    rng.fill_bytes(&mut *z);
    XEdSigningKey::from_secret(secret).sign(data, &z)
}

/// Verify an XEdDSA signature under an X25519 public key.
///
/// # Errors
/// `Error::SignatureInvalid` on any mismatch or malformed signature.
pub fn verify(public: &PublicKey, data: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> Result<()> {
    xeddsa::verify(public, data, signature)
}

#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key size"),
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// HKDF-SHA256 (RFC 5869) extract-and-expand.
///
/// # Errors
/// `Error::OutputTooLarge` if `len` exceeds [`HKDF_MAX_OUTPUT`].
pub fn hkdf(salt: &[u8], ikm: &[u8], info: &[u8], len: usize) -> Result<Zeroizing<Vec<u8>>> {
    if len > HKDF_MAX_OUTPUT {
        return Err(Error::OutputTooLarge(len));
    }
    let mut okm = Zeroizing::new(vec![0u8; len]);
    Hkdf::<Sha256>::new(Some(salt), ikm)
        .expand(info, &mut okm)
        .map_err(|_| Error::OutputTooLarge(len))?;
    Ok(okm)
}

fn split_32(bytes: &[u8]) -> [u8; KEY_SIZE_32] {
    let mut out = [0u8; KEY_SIZE_32];
    out.copy_from_slice(&bytes[..KEY_SIZE_32]);
    out
}

/// X3DH shared secret: `HKDF(0xFF^32, DH1 || DH2 || DH3 [|| DH4], "TRILL_X3DH", 32)`.
pub fn derive_x3dh_secret(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> Result<SymmetricKey> {
    const SALT: [u8; 32] = [0xFF; 32];

    let mut ikm = Zeroizing::new(Vec::with_capacity(KEY_SIZE_32 * 4));
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let okm = hkdf(&SALT, &ikm, X3DH_INFO, KEY_SIZE_32)?;
    Ok(SymmetricKey(split_32(&okm)))
}

/// Root KDF: `(RK', CK) = HKDF(salt = RK, ikm = DH_out, "TRILL", 64)`.
pub fn kdf_rk(root_key: &SymmetricKey, dh_output: &DhOutput) -> Result<(SymmetricKey, SymmetricKey)> {
    let okm = hkdf(root_key.as_bytes(), dh_output.as_bytes(), ROOT_INFO, 2 * KEY_SIZE_32)?;
    Ok((
        SymmetricKey(split_32(&okm[..KEY_SIZE_32])),
        SymmetricKey(split_32(&okm[KEY_SIZE_32..])),
    ))
}

/// Chain KDF: `(CK', MK) = HKDF(salt = CK, ikm = "CK", "TRILL_CK", 96)`.
///
/// Bytes 0..32 are the next chain key, bytes 32..96 the message key.
pub fn kdf_ck(chain_key: &SymmetricKey) -> Result<(SymmetricKey, MessageKey)> {
    let okm = hkdf(
        chain_key.as_bytes(),
        CHAIN_IKM,
        CHAIN_INFO,
        KEY_SIZE_32 + MESSAGE_KEY_SIZE,
    )?;
    let mut mk = [0u8; MESSAGE_KEY_SIZE];
    mk.copy_from_slice(&okm[KEY_SIZE_32..]);
    Ok((SymmetricKey(split_32(&okm)), MessageKey(mk)))
}

fn compute_tag(key: &MessageKey, ad: &[u8], iv: &[u8], ciphertext: &[u8]) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(key.mac_key()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts any key size"),
    };
    mac.update(ad);
    mac.update(iv);
    mac.update(ciphertext);
    mac
}

/// Encrypt-then-MAC: AES-256-CBC (PKCS#7) under `key[0..32]`, HMAC-SHA256
/// under `key[32..64]` over `ad || iv || ciphertext`.
///
/// Output framing is `iv (16) || ciphertext || tag (32)`.
pub fn aead_encrypt<R: CryptoRngCore>(
    rng: &mut R,
    key: &MessageKey,
    plaintext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_SIZE];
    rng.fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(key.cipher_key(), &iv).map_err(|_| {
        Error::InvalidKeySize {
            expected: KEY_SIZE_32,
            actual: key.cipher_key().len(),
        }
    })?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    let tag = compute_tag(key, ad, &iv, &ciphertext).finalize().into_bytes();

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len() + TAG_SIZE);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out.extend_from_slice(&tag);
    Ok(out)
}

/// Verify and decrypt a blob produced by [`aead_encrypt`].
///
/// # Errors
/// `Error::AuthenticationFailure` on a short blob, tag mismatch or bad padding.
pub fn aead_decrypt(key: &MessageKey, blob: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < IV_SIZE + TAG_SIZE {
        return Err(Error::AuthenticationFailure);
    }
    let (iv, rest) = blob.split_at(IV_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

    compute_tag(key, ad, iv, ciphertext)
        .verify_slice(tag)
        .map_err(|_| Error::AuthenticationFailure)?;

    let cipher = Aes256CbcDec::new_from_slices(key.cipher_key(), iv)
        .map_err(|_| Error::AuthenticationFailure)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::AuthenticationFailure)
}
