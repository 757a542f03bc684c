//! XEdDSA signatures made with X25519 identity keys.
//!
//! Signing follows "The XEdDSA and VXEdDSA Signature Schemes" (Perrin,
//! revision 1). The output is an ordinary Ed25519 signature under the Edwards
//! form of the Montgomery public key, so verification is delegated to
//! `ed25519-dalek`.

use crate::crypto::SIGNATURE_SIZE;
use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey};
use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE, edwards::CompressedEdwardsY, montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use ed25519_dalek::{Signature, VerifyingKey};
use sha2::{Digest, Sha512};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Ed25519 signing scalar derived from an X25519 secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct XEdSigningKey {
    a: Scalar,
    #[zeroize(skip)]
    public: CompressedEdwardsY,
}

impl XEdSigningKey {
    /// Convert an X25519 secret so that the Edwards public key has sign bit 0.
    pub(crate) fn from_secret(secret: &SecretKey) -> Self {
        let mut k = secret.to_bytes();
        k[0] &= 248;
        k[31] &= 127;
        k[31] |= 64;

        let k_scalar = Scalar::from_bytes_mod_order(k);
        k.zeroize();

        let e = (&k_scalar * ED25519_BASEPOINT_TABLE).compress();
        let a = if e.as_bytes()[31] & 0x80 == 0 {
            k_scalar
        } else {
            -k_scalar
        };
        let public = (&a * ED25519_BASEPOINT_TABLE).compress();

        Self { a, public }
    }

    /// Sign `message` with 64 bytes of fresh randomness `z`.
    pub(crate) fn sign(&self, message: &[u8], z: &[u8; 64]) -> [u8; SIGNATURE_SIZE] {
        // r = hash1(a || M || Z)
        let mut hasher = Sha512::new();
        hasher.update([0xFE]);
        hasher.update([0xFF; 31]);
        hasher.update(self.a.as_bytes());
        hasher.update(message);
        hasher.update(z);
        let r = Scalar::from_bytes_mod_order_wide(&hasher.finalize().into());

        let big_r = (&r * ED25519_BASEPOINT_TABLE).compress();

        // h = hash(R || A || M)
        let mut hasher = Sha512::new();
        hasher.update(big_r.as_bytes());
        hasher.update(self.public.as_bytes());
        hasher.update(message);
        let h = Scalar::from_bytes_mod_order_wide(&hasher.finalize().into());

        let s = r + h * self.a;

        let mut signature = [0u8; SIGNATURE_SIZE];
        signature[..32].copy_from_slice(big_r.as_bytes());
        signature[32..].copy_from_slice(s.as_bytes());
        signature
    }

    #[cfg(test)]
    fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

impl std::fmt::Debug for XEdSigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "XEdSigningKey([REDACTED])")
    }
}

/// Edwards form (sign bit 0) of an X25519 public key.
fn edwards_public_key(identity: &PublicKey) -> Result<[u8; 32]> {
    let mut u = *identity.as_bytes();
    u[31] &= 0x7F;
    let edwards = MontgomeryPoint(u)
        .to_edwards(0)
        .ok_or(Error::SignatureInvalid)?;
    Ok(edwards.compress().to_bytes())
}

/// Verify an XEdDSA signature made by the owner of `identity`.
pub(crate) fn verify(
    identity: &PublicKey,
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<()> {
    let key = VerifyingKey::from_bytes(&edwards_public_key(identity)?)?;
    key.verify_strict(message, &Signature::from_bytes(signature))?;
    Ok(())
}
