//! Directory and transport collaborator.
//!
//! The session manager never talks HTTP itself; it drives an implementation
//! of [`Network`] supplied by the application.

use crate::double_ratchet::{Header, Message};
use crate::error::Result;
use crate::records::{DeviceId, UserId};
use crate::x3dh::PreKeyPreamble;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prekey bundle as served by the directory, every key base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundleWire {
    pub identity_key: String,
    pub signed_prekey_id: u32,
    pub signed_prekey: String,
    pub signature: String,
    pub one_time_prekey_id: Option<u32>,
    pub one_time_prekey: Option<String>,
}

/// Encrypted payload of one wire message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireContent {
    /// Encoded ratchet header (40 bytes)
    pub header: Vec<u8>,
    /// `iv || ciphertext || tag`
    pub ciphertext: Vec<u8>,
    /// Present until the initiating session sees a reply
    pub preamble: Option<PreKeyPreamble>,
}

impl WireContent {
    #[must_use]
    pub fn new(message: Message, preamble: Option<PreKeyPreamble>) -> Self {
        Self {
            header: message.header.to_bytes().to_vec(),
            ciphertext: message.ciphertext,
            preamble,
        }
    }

    /// Decode the ratchet message carried by this content.
    ///
    /// # Errors
    /// `Error::InvalidHeader` if the header is not exactly 40 bytes.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message {
            header: Header::from_bytes(&self.header)?,
            ciphertext: self.ciphertext.clone(),
        })
    }
}

/// One ciphertext addressed to one recipient device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub sender_id: UserId,
    pub sender_device_id: DeviceId,
    pub recipient_id: UserId,
    pub recipient_device_id: DeviceId,
    pub content: WireContent,
    /// Milliseconds since the Unix epoch, set by the sender
    pub timestamp: u64,
}

/// Outcome of submitting a batch to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendResponse {
    Success,
    UserNotFound,
    /// The batch did not match the recipient's current device set
    DeviceMismatch {
        /// Devices we addressed that no longer exist
        old_devices: Vec<DeviceId>,
        /// Devices we missed, with their base64 identity keys
        new_devices: HashMap<DeviceId, String>,
    },
}

/// Device directory and message transport.
#[async_trait]
pub trait Network: Send + Sync {
    /// Fetch a prekey bundle for one device. The directory hands out each
    /// one-time prekey at most once.
    async fn fetch_prekey_bundle(&self, user_id: &str, device_id: DeviceId) -> Result<PreKeyBundleWire>;

    /// Current device set of a user with base64 identity keys.
    async fn fetch_user_devices(&self, user_id: &str) -> Result<HashMap<DeviceId, String>>;

    /// Submit a batch of messages for one recipient user.
    async fn send_messages(&self, messages: Vec<WireMessage>) -> Result<SendResponse>;

    /// Drain pending messages addressed to one device.
    async fn fetch_messages(&self, user_id: &str, device_id: DeviceId) -> Result<Vec<WireMessage>>;
}
