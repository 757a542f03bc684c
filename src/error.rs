//! Error types for the Trill protocol stack.

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during key agreement, ratcheting and session management
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Public key, signature or key-material input has the wrong length.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Required length in bytes
        expected: usize,
        /// Length that was supplied
        actual: usize,
    },

    /// Signed prekey signature does not verify under the claimed identity key.
    #[error("signed prekey signature is invalid")]
    SignatureInvalid,

    /// AEAD tag mismatch. The message is dropped and never retried.
    #[error("message authentication failed")]
    AuthenticationFailure,

    /// Gap between received message numbers exceeds the skip bound.
    ///
    /// Session-fatal: the peer must re-key with a fresh X3DH handshake.
    #[error("ratchet exhausted: {requested} is more than {max_skip} past {current}")]
    RatchetExhausted {
        /// Next expected message number in the receiving chain
        current: u32,
        /// Message number the peer asked us to reach
        requested: u32,
        /// Configured skip bound
        max_skip: u32,
    },

    /// Encrypt or decrypt was invoked before the relevant chain was initialized.
    #[error("missing {0} chain key")]
    MissingChainKey(ChainKind),

    /// HKDF output length exceeds 255 * 32 bytes.
    #[error("hkdf output too large: {0} bytes")]
    OutputTooLarge(usize),

    /// Message number already consumed and its key deleted.
    #[error("duplicate message: {message_number} already received")]
    DuplicateMessage {
        /// Message number that was replayed
        message_number: u32,
    },

    /// Ratchet header is truncated or malformed.
    #[error("invalid ratchet header")]
    InvalidHeader,

    /// Wire message is truncated or malformed.
    #[error("invalid message format")]
    InvalidMessageFormat,

    /// Persisted ratchet state could not be decoded.
    #[error("invalid ratchet state encoding")]
    InvalidStateEncoding,

    /// Persisted ratchet state has a version this build cannot read.
    #[error("unsupported ratchet state version {0}")]
    UnsupportedVersion(u8),

    /// Recipient's device set changed since we last contacted them.
    #[error("device mismatch persisted after {retries} retries")]
    DeviceMismatch {
        /// Number of retries that were attempted
        retries: u32,
    },

    /// Recipient is unknown to the directory.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// Local one-time prekey pool does not hold the requested key.
    #[error("no one-time prekey available")]
    NoOneTimePreKeyAvailable,

    /// Handshake referenced a signed prekey id we no longer hold.
    #[error("unknown signed prekey {0}")]
    UnknownSignedPreKey(u32),

    /// A bundle or handshake identity does not match the recorded device key.
    #[error("identity key mismatch for {user_id}:{device_id}")]
    IdentityKeyMismatch {
        /// User whose key was checked
        user_id: String,
        /// Device whose key was checked
        device_id: u32,
    },

    /// No session for the sender could decrypt the message and no handshake was attached.
    #[error("no session matches message from {user_id}:{device_id}")]
    NoMatchingSession {
        /// Sending user
        user_id: String,
        /// Sending device
        device_id: u32,
    },

    /// Network collaborator failure (retried with bounded attempts).
    #[error("network error: {0}")]
    Network(String),

    /// Storage collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Record snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Which ratchet chain was missing when an operation needed it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    /// Sending chain (`cks`)
    Sending,
    /// Receiving chain (`ckr`)
    Receiving,
}

impl std::fmt::Display for ChainKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sending => f.write_str("sending"),
            Self::Receiving => f.write_str("receiving"),
        }
    }
}

impl Error {
    /// Returns true if the session that produced this error must be abandoned.
    ///
    /// Session-fatal errors require a fresh X3DH handshake. Everything else
    /// affects only the message at hand or is handled by the caller.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::RatchetExhausted { .. } | Self::MissingChainKey(_)
        )
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(_: ed25519_dalek::SignatureError) -> Self {
        Error::SignatureInvalid
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let exhausted = Error::RatchetExhausted {
            current: 0,
            requested: 2000,
            max_skip: 1000,
        };
        assert!(exhausted.is_session_fatal());
        assert!(Error::MissingChainKey(ChainKind::Sending).is_session_fatal());
        assert!(!Error::AuthenticationFailure.is_session_fatal());
        assert!(!Error::UserNotFound("bob".into()).is_session_fatal());
    }

    #[test]
    fn test_only_network_is_transient() {
        assert!(Error::Network("timeout".into()).is_transient());
        assert!(!Error::Storage("disk".into()).is_transient());
        assert!(!Error::SignatureInvalid.is_transient());
    }
}
