//! End-to-end encrypted messaging sessions across many devices per user.
//!
//! This crate implements X3DH key agreement, the Double Ratchet and a
//! Sesame-style session manager that fans each message out to every device
//! of the recipient. It provides forward secrecy, post-compromise security
//! and deniable authentication for asynchronous messaging.
//!
//! # Security Properties
//!
//! ## Forward Secrecy
//! Past messages remain confidential even if long-term identity keys are later
//! compromised. Each message key is derived once and deleted after use.
//!
//! ## Post-Compromise Security
//! If an attacker compromises session state, security is restored after a
//! single honest round trip via DH ratcheting.
//!
//! ## Deniable Authentication
//! Messages are authenticated with symmetric keys both parties hold, so a
//! transcript proves nothing to a third party.
//!
//! ## Asynchronous Operation
//! Senders start sessions from prekey bundles published in advance. The
//! recipient does not need to be online.
//!
//! # Threat Model
//!
//! **Assumed adversary capabilities:**
//! - Active network attacker (inject, modify, delay, drop, replay messages)
//! - A directory that may lie about device lists, but not about signatures
//!
//! **Security assumptions:**
//! - X25519 ECDH provides computational security
//! - HKDF-SHA256 is a secure key derivation function
//! - AES-256-CBC with HMAC-SHA256 (encrypt-then-MAC) is a secure AEAD
//! - Random number generator is cryptographically secure
//!
//! # Protocol Flow
//!
//! ```rust
//! use trill_protocol::{x3dh, IdentityKeyPair, PreKey, RatchetState, SignedPreKey};
//! use trill_protocol::x3dh::PreKeyBundle;
//! use rand_core::OsRng;
//!
//! // Bob publishes a bundle
//! let bob_identity = IdentityKeyPair::generate(&mut OsRng);
//! let bob_spk = SignedPreKey::generate(&mut OsRng, &bob_identity, 1);
//! let bob_opk = PreKey::generate(&mut OsRng, 1);
//! let bundle = PreKeyBundle::new(&bob_identity, &bob_spk, Some(&bob_opk));
//!
//! // Alice runs X3DH against it and starts ratcheting
//! let alice_identity = IdentityKeyPair::generate(&mut OsRng);
//! let (alice_x3dh, preamble) =
//!     x3dh::initiate_with_bundle(&mut OsRng, &alice_identity, &bundle).unwrap();
//! let mut alice = RatchetState::init_initiator(
//!     &mut OsRng,
//!     alice_x3dh.shared_secret,
//!     alice_x3dh.associated_data,
//!     bundle.signed_prekey,
//! );
//! let message = alice.encrypt(&mut OsRng, b"Hello Bob!", b"").unwrap();
//!
//! // Bob answers the preamble that travels with Alice's first message
//! let bob_x3dh = x3dh::receive(
//!     &bob_identity,
//!     bob_spk.pre_key.secret_key(),
//!     Some(bob_opk.secret_key()),
//!     &preamble.identity_key,
//!     &preamble.ephemeral_key,
//! )
//! .unwrap();
//! let mut bob = RatchetState::init_responder(
//!     bob_x3dh.shared_secret,
//!     bob_x3dh.associated_data,
//!     bob_spk.pre_key.secret_key().clone(),
//! );
//!
//! assert_eq!(bob.decrypt(&mut OsRng, &message, b"").unwrap(), b"Hello Bob!");
//!
//! let reply = bob.encrypt(&mut OsRng, b"Hello Alice!", b"").unwrap();
//! assert_eq!(alice.decrypt(&mut OsRng, &reply, b"").unwrap(), b"Hello Alice!");
//! ```
//!
//! Applications normally drive all of this through [`SesameManager`], which
//! owns the session records and talks to a [`Network`] directory.
//!
//! # Modules
//!
//! - [`x3dh`]: Extended Triple Diffie-Hellman key agreement protocol
//! - [`double_ratchet`]: Double Ratchet for forward-secure messaging
//! - [`sesame`]: Multi-device session manager
//! - [`records`]: Session, device and user records
//! - [`crypto`]: Cryptographic primitives (KDF, AEAD, signatures)
//! - [`keys`]: Key types with automatic zeroization
//! - [`storage`]: Key and record storage abstractions
//! - [`network`]: Directory/transport interface and wire types
//! - [`config`], [`clock`]: Manager tunables and time source
//! - [`error`]: Error types

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unreachable_pub)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![warn(clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    missing_docs,
    clippy::missing_errors_doc,
    clippy::missing_fields_in_debug,
    clippy::module_name_repetitions
)]

pub mod clock;
pub mod config;
pub mod crypto;
pub mod double_ratchet;
pub mod error;
pub mod keys;
pub mod network;
pub mod records;
pub mod sesame;
pub mod storage;
pub mod x3dh;
mod xeddsa;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SesameConfig;
pub use double_ratchet::{Header, Message, RatchetState};
pub use error::{Error, Result};
pub use keys::{IdentityKeyPair, PreKey, PreKeyPool, PublicKey, SecretKey, SignedPreKey};
pub use network::{Network, PreKeyBundleWire, SendResponse, WireContent, WireMessage};
pub use records::{DeviceId, DeviceRecord, Session, UserId, UserRecord};
pub use sesame::{ReceivedMessage, SendReport, SesameManager};
pub use storage::{InMemoryKeyStore, InMemoryRecordStore, KeyStore, RecordStore};
pub use x3dh::{PreKeyBundle, PreKeyPreamble, X3dhResult};
