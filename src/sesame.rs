//! Sesame-style multi-device session manager.
//!
//! Maps a recipient user onto every live device, keeps one active ratchet
//! session per device (plus a bounded list of inactive ones), and recovers
//! from device-set churn reported by the transport.
//!
//! ## Locking
//!
//! Records live behind one async mutex per user inside a map guarded by its
//! own mutex. Locks are always taken map first, then user; never the other
//! way round. All ratchet mutation for a device happens under its user's
//! lock, so encrypt and decrypt on one session are serialized.

use crate::clock::{Clock, SystemClock};
use crate::config::SesameConfig;
use crate::double_ratchet::{Message, RatchetState};
use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, PreKey, PublicKey};
use crate::network::{Network, SendResponse, WireContent, WireMessage};
use crate::records::{DeviceId, DeviceRecord, Session, SessionSlot, UserId, UserRecord};
use crate::storage::{KeyStore, RecordStore};
use crate::x3dh::{self, PreKeyBundle};
use rand_core::{OsRng, RngCore};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Outcome of a successful [`SesameManager::send_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub recipient: UserId,
    /// Devices the accepted batch was addressed to
    pub device_ids: Vec<DeviceId>,
    /// Resends caused by device mismatches
    pub mismatch_retries: u32,
}

/// A decrypted incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub sender_id: UserId,
    pub sender_device_id: DeviceId,
    pub plaintext: Vec<u8>,
    pub session_id: u64,
    /// True if this message established a new session
    pub new_session: bool,
}

type UserHandle = Arc<Mutex<UserRecord>>;

pub struct SesameManager {
    config: SesameConfig,
    key_store: Arc<dyn KeyStore>,
    record_store: Arc<dyn RecordStore>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    users: Mutex<HashMap<UserId, UserHandle>>,
}

impl SesameManager {
    #[must_use]
    pub fn new(
        config: SesameConfig,
        key_store: Arc<dyn KeyStore>,
        record_store: Arc<dyn RecordStore>,
        network: Arc<dyn Network>,
    ) -> Self {
        Self {
            config,
            key_store,
            record_store,
            network,
            clock: Arc::new(SystemClock),
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the wall clock used for staleness
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SesameConfig {
        &self.config
    }

    /// Restore the record map saved by an earlier run. Returns the number of
    /// users loaded.
    pub async fn load(&self) -> Result<usize> {
        let Some(bytes) = self.record_store.load_records()? else {
            return Ok(0);
        };
        let (records, _): (BTreeMap<UserId, UserRecord>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;

        let mut users = self.users.lock().await;
        users.clear();
        for (user_id, record) in records {
            users.insert(user_id, Arc::new(Mutex::new(record)));
        }
        tracing::info!(target: "sesame", users = users.len(), "loaded session records");
        Ok(users.len())
    }

    /// Encrypt `plaintext` once per live device of `recipient` and submit
    /// the batch.
    ///
    /// # Errors
    /// `Error::UserNotFound` if the directory does not know the recipient,
    /// `Error::DeviceMismatch` if the device set still disagrees after
    /// `max_mismatch_retries` resends.
    pub async fn send_message(&self, recipient: &str, plaintext: &[u8]) -> Result<SendReport> {
        self.run_cleanup().await?;

        let (local_user, local_device) = self.key_store.local_address()?;
        let identity = self.key_store.identity()?;
        let mut mismatch_retries = 0;

        loop {
            let user = self.user_handle(recipient).await;
            let batch = {
                let mut record = user.lock().await;
                if record.is_stale()
                    || record.device_ids().is_empty()
                    || record.needs_directory_check()
                {
                    self.refresh_devices(&mut record).await?;
                }

                let now = self.clock.now_millis();
                let targets: Vec<DeviceId> = record
                    .live_device_ids()
                    .into_iter()
                    .filter(|device_id| !(recipient == local_user && *device_id == local_device))
                    .collect();

                let mut batch = Vec::with_capacity(targets.len());
                for device_id in targets {
                    let content = self
                        .encrypt_for_device(&mut record, device_id, &identity, plaintext)
                        .await?;
                    batch.push(WireMessage {
                        sender_id: local_user.clone(),
                        sender_device_id: local_device,
                        recipient_id: recipient.to_string(),
                        recipient_device_id: device_id,
                        content,
                        timestamp: now,
                    });
                }
                batch
            };

            // Ratchet state is saved before anything leaves the device
            self.persist().await?;

            let device_ids: Vec<DeviceId> = batch.iter().map(|m| m.recipient_device_id).collect();
            let response = self
                .with_retry("send_messages", || self.network.send_messages(batch.clone()))
                .await?;

            match response {
                SendResponse::Success => {
                    tracing::debug!(target: "sesame", user = %recipient, devices = device_ids.len(), "batch accepted");
                    return Ok(SendReport {
                        recipient: recipient.to_string(),
                        device_ids,
                        mismatch_retries,
                    });
                }
                SendResponse::UserNotFound => {
                    tracing::warn!(target: "sesame", user = %recipient, "recipient unknown, marking stale");
                    user.lock().await.mark_stale(self.clock.now_millis());
                    self.persist().await?;
                    return Err(Error::UserNotFound(recipient.to_string()));
                }
                SendResponse::DeviceMismatch {
                    old_devices,
                    new_devices,
                } => {
                    if mismatch_retries >= self.config.max_mismatch_retries {
                        tracing::warn!(target: "sesame", user = %recipient, retries = mismatch_retries, "device mismatch persists");
                        return Err(Error::DeviceMismatch {
                            retries: mismatch_retries,
                        });
                    }
                    mismatch_retries += 1;
                    tracing::warn!(
                        target: "sesame",
                        user = %recipient,
                        old = old_devices.len(),
                        new = new_devices.len(),
                        "device mismatch, updating device set and resending"
                    );

                    let now = self.clock.now_millis();
                    let mut record = user.lock().await;
                    for device_id in old_devices {
                        if let Some(device) = record.device_mut(device_id) {
                            device.mark_stale(now);
                        }
                    }
                    for (device_id, encoded) in new_devices {
                        record.upsert_device(device_id, PublicKey::from_base64(&encoded)?);
                    }
                }
            }
        }
    }

    /// Decrypt one incoming message, creating records and sessions as needed.
    ///
    /// # Errors
    /// `Error::NoMatchingSession` if no session decrypts the message and it
    /// carries no handshake preamble. `Error::IdentityKeyMismatch` if the
    /// preamble names an identity other than the one recorded for the sending
    /// device. Nothing is recorded for a sender that fails on first contact.
    pub async fn receive_message(&self, wire: WireMessage) -> Result<ReceivedMessage> {
        let message = wire.content.to_message()?;
        let user = self.user_handle(&wire.sender_id).await;

        let outcome = {
            let mut record = user.lock().await;
            self.receive_into(&mut record, &wire, &message)
        };

        match outcome {
            Ok(received) => {
                // The ratchet has already advanced, so the plaintext is returned regardless
                if let Err(err) = self.persist().await {
                    tracing::warn!(target: "sesame", user = %wire.sender_id, device = wire.sender_device_id, %err, "failed to persist records after receive");
                }
                Ok(received)
            }
            Err(err) => {
                if err.is_session_fatal() {
                    tracing::warn!(target: "sesame", user = %wire.sender_id, device = wire.sender_device_id, %err, "session needs a fresh handshake");
                } else {
                    tracing::debug!(target: "sesame", user = %wire.sender_id, device = wire.sender_device_id, %err, "receive failed");
                }
                self.discard_if_empty(&wire.sender_id).await;
                Err(err)
            }
        }
    }

    /// Fetch and decrypt everything queued for the local device. Messages
    /// that fail are logged and skipped.
    pub async fn sync_messages(&self) -> Result<Vec<ReceivedMessage>> {
        let (user_id, device_id) = self.key_store.local_address()?;
        let pending = self
            .with_retry("fetch_messages", || self.network.fetch_messages(&user_id, device_id))
            .await?;

        let mut received = Vec::with_capacity(pending.len());
        for wire in pending {
            let sender = wire.sender_id.clone();
            let sender_device = wire.sender_device_id;
            match self.receive_message(wire).await {
                Ok(message) => received.push(message),
                Err(err) => {
                    tracing::warn!(target: "sesame", user = %sender, device = sender_device, %err, "dropping undecryptable message");
                }
            }
        }
        Ok(received)
    }

    /// Evict devices and users that have been stale for longer than
    /// `max_latency_ms`.
    pub async fn run_cleanup(&self) -> Result<()> {
        let now = self.clock.now_millis();
        let max_latency = self.config.max_latency_ms;
        let mut changed = false;

        {
            let mut users = self.users.lock().await;
            let mut expired_users = Vec::new();
            for (user_id, user) in users.iter() {
                let mut record = user.lock().await;
                for device_id in record.evict_expired_devices(now, max_latency) {
                    tracing::info!(target: "sesame", user = %user_id, device = device_id, "evicted stale device");
                    changed = true;
                }
                if record.is_expired(now, max_latency) {
                    expired_users.push(user_id.clone());
                }
            }
            for user_id in expired_users {
                users.remove(&user_id);
                tracing::info!(target: "sesame", user = %user_id, "evicted stale user");
                changed = true;
            }
        }

        if changed {
            self.persist().await?;
        }
        Ok(())
    }

    /// Run [`SesameManager::run_cleanup`] every `cleanup_interval_ms`.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.cleanup_interval().max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = manager.run_cleanup().await {
                    tracing::warn!(target: "sesame", %err, "cleanup failed");
                }
            }
        })
    }

    /// Known device ids of a user, stale ones included
    pub async fn device_ids(&self, user_id: &str) -> Vec<DeviceId> {
        match self.existing_user(user_id).await {
            Some(user) => user.lock().await.device_ids(),
            None => Vec::new(),
        }
    }

    /// `None` if the user has no record
    pub async fn is_user_stale(&self, user_id: &str) -> Option<bool> {
        let user = self.existing_user(user_id).await?;
        let stale = user.lock().await.is_stale();
        Some(stale)
    }

    /// `None` if the device has no record
    pub async fn is_device_stale(&self, user_id: &str, device_id: DeviceId) -> Option<bool> {
        let user = self.existing_user(user_id).await?;
        let record = user.lock().await;
        record.device(device_id).map(DeviceRecord::is_stale)
    }

    /// Active plus inactive sessions held for one device
    pub async fn session_count(&self, user_id: &str, device_id: DeviceId) -> usize {
        match self.existing_user(user_id).await {
            Some(user) => user
                .lock()
                .await
                .device(device_id)
                .map_or(0, DeviceRecord::session_count),
            None => 0,
        }
    }

    pub async fn active_session_id(&self, user_id: &str, device_id: DeviceId) -> Option<u64> {
        let user = self.existing_user(user_id).await?;
        let record = user.lock().await;
        record
            .device(device_id)
            .and_then(DeviceRecord::active_session)
            .map(|session| session.id)
    }

    async fn existing_user(&self, user_id: &str) -> Option<UserHandle> {
        self.users.lock().await.get(user_id).cloned()
    }

    async fn user_handle(&self, user_id: &str) -> UserHandle {
        let mut users = self.users.lock().await;
        Arc::clone(
            users
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(UserRecord::new(user_id)))),
        )
    }

    async fn discard_if_empty(&self, user_id: &str) {
        let mut users = self.users.lock().await;
        let empty = match users.get(user_id) {
            Some(user) => user.lock().await.device_ids().is_empty(),
            None => false,
        };
        if empty {
            users.remove(user_id);
        }
    }

    async fn refresh_devices(&self, record: &mut UserRecord) -> Result<()> {
        let user_id = record.user_id.clone();
        let now = self.clock.now_millis();

        let listed = match self
            .with_retry("fetch_user_devices", || self.network.fetch_user_devices(&user_id))
            .await
        {
            Ok(listed) => listed,
            Err(err @ Error::UserNotFound(_)) => {
                tracing::warn!(target: "sesame", user = %user_id, "directory does not know user, marking stale");
                record.mark_stale(now);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        for device_id in record.device_ids() {
            if !listed.contains_key(&device_id) {
                if let Some(device) = record.device_mut(device_id) {
                    device.mark_stale(now);
                }
            }
        }
        for (device_id, encoded) in &listed {
            record.upsert_device(*device_id, PublicKey::from_base64(encoded)?);
        }
        record.clear_stale();
        tracing::debug!(target: "sesame", user = %user_id, devices = listed.len(), "refreshed device list");
        Ok(())
    }

    async fn encrypt_for_device(
        &self,
        record: &mut UserRecord,
        device_id: DeviceId,
        identity: &IdentityKeyPair,
        plaintext: &[u8],
    ) -> Result<WireContent> {
        let user_id = record.user_id.clone();
        let missing = || Error::NoMatchingSession {
            user_id: user_id.clone(),
            device_id,
        };

        let needs_session = record
            .device(device_id)
            .map_or(true, |device| device.active_session().is_none());

        if needs_session {
            let wire = self
                .with_retry("fetch_prekey_bundle", || {
                    self.network.fetch_prekey_bundle(&user_id, device_id)
                })
                .await?;
            let bundle = PreKeyBundle::from_wire(&wire)?;

            let device = record.device_mut(device_id).ok_or_else(missing)?;
            if bundle.identity_key != *device.identity_key() {
                tracing::warn!(target: "sesame", user = %user_id, device = device_id, "bundle identity differs from directory");
                return Err(Error::IdentityKeyMismatch {
                    user_id: user_id.clone(),
                    device_id,
                });
            }

            let (handshake, preamble) = x3dh::initiate_with_bundle(&mut OsRng, identity, &bundle)?;
            let ratchet = RatchetState::init_initiator(
                &mut OsRng,
                handshake.shared_secret,
                handshake.associated_data,
                bundle.signed_prekey,
            );
            let session = Session::initiating(OsRng.next_u64(), ratchet, preamble, self.clock.now_millis());
            tracing::info!(target: "sesame", user = %user_id, device = device_id, session = session.id, "created initiating session");
            device.install_session(session, self.config.max_inactive_sessions);
        }

        record
            .device_mut(device_id)
            .and_then(DeviceRecord::active_session_mut)
            .ok_or_else(missing)?
            .encrypt(&mut OsRng, plaintext)
    }

    fn receive_into(
        &self,
        record: &mut UserRecord,
        wire: &WireMessage,
        message: &Message,
    ) -> Result<ReceivedMessage> {
        let device_id = wire.sender_device_id;
        let preamble = wire.content.preamble;
        let max_inactive = self.config.max_inactive_sessions;
        let received = |plaintext, session_id, new_session| ReceivedMessage {
            sender_id: wire.sender_id.clone(),
            sender_device_id: device_id,
            plaintext,
            session_id,
            new_session,
        };

        if let Some(device) = record.device_mut(device_id) {
            // Continuation of a known receiving chain is authoritative
            if let Some(slot) = device.find_by_header(&message.header) {
                let (plaintext, session_id) = decrypt_in_slot(&wire.sender_id, device, slot, message, max_inactive)?;
                device.clear_stale();
                record.clear_stale();
                return Ok(received(plaintext, session_id, false));
            }

            // A repeated preamble belongs to the session it already created
            if let Some(preamble) = &preamble {
                if *device.identity_key() == preamble.identity_key {
                    if let Some(slot) = device.find_by_base_key(&preamble.ephemeral_key) {
                        let (plaintext, session_id) =
                            decrypt_in_slot(&wire.sender_id, device, slot, message, max_inactive)?;
                        device.clear_stale();
                        record.clear_stale();
                        return Ok(received(plaintext, session_id, false));
                    }
                }
            }

            // The peer may have ratcheted to a key we have not seen yet
            let slots: Vec<SessionSlot> = device.slots().map(|(slot, _)| slot).collect();
            for slot in slots {
                let attempt = match device.session_mut(slot) {
                    Some(session) => session
                        .decrypt(&mut OsRng, message)
                        .map(|plaintext| (plaintext, session.id)),
                    None => continue,
                };
                if let Ok((plaintext, session_id)) = attempt {
                    device.activate(slot, max_inactive);
                    device.clear_stale();
                    record.clear_stale();
                    return Ok(received(plaintext, session_id, false));
                }
            }
        }

        let Some(preamble) = preamble else {
            return Err(Error::NoMatchingSession {
                user_id: wire.sender_id.clone(),
                device_id,
            });
        };

        if let Some(device) = record.device_mut(device_id) {
            if *device.identity_key() != preamble.identity_key {
                tracing::warn!(target: "sesame", user = %wire.sender_id, device = device_id, "handshake identity differs from recorded device key");
                device.mark_unconfirmed();
                return Err(Error::IdentityKeyMismatch {
                    user_id: wire.sender_id.clone(),
                    device_id,
                });
            }
        }

        let identity = self.key_store.identity()?;
        let signed_prekey = self.key_store.signed_prekey(preamble.signed_prekey_id)?;
        let one_time_prekey = preamble
            .one_time_prekey_id
            .map(|id| self.key_store.one_time_prekey(id))
            .transpose()?;

        let handshake = x3dh::receive(
            &identity,
            signed_prekey.pre_key.secret_key(),
            one_time_prekey.as_ref().map(PreKey::secret_key),
            &preamble.identity_key,
            &preamble.ephemeral_key,
        )?;
        let ratchet = RatchetState::init_responder(
            handshake.shared_secret,
            handshake.associated_data,
            signed_prekey.pre_key.secret_key().clone(),
        );
        let mut session = Session::responding(
            OsRng.next_u64(),
            ratchet,
            preamble.ephemeral_key,
            self.clock.now_millis(),
        );
        let plaintext = session.decrypt(&mut OsRng, message)?;
        let session_id = session.id;

        if let Some(id) = preamble.one_time_prekey_id {
            self.key_store.consume_one_time_prekey(id)?;
        }

        let device = record.claim_device(device_id, preamble.identity_key);
        device.install_session(session, max_inactive);
        record.clear_stale();
        tracing::info!(target: "sesame", user = %wire.sender_id, device = device_id, session = session_id, "created responding session");

        Ok(received(plaintext, session_id, true))
    }

    async fn persist(&self) -> Result<()> {
        let users = self.users.lock().await;
        let mut guards = Vec::with_capacity(users.len());
        for (user_id, user) in users.iter() {
            guards.push((user_id, user.lock().await));
        }
        let snapshot: BTreeMap<&str, &UserRecord> = guards
            .iter()
            .map(|(user_id, record)| (user_id.as_str(), &**record))
            .collect();

        let bytes = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())?;
        self.record_store.save_records(&bytes)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.network_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    tracing::warn!(target: "sesame", operation, attempt, attempts, %err, "network call failed, retrying");
                    tokio::time::sleep(self.config.backoff(attempt)).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn decrypt_in_slot(
    user_id: &str,
    device: &mut DeviceRecord,
    slot: SessionSlot,
    message: &Message,
    max_inactive: usize,
) -> Result<(Vec<u8>, u64)> {
    let device_id = device.device_id;
    let session = device
        .session_mut(slot)
        .ok_or_else(|| Error::NoMatchingSession {
            user_id: user_id.to_string(),
            device_id,
        })?;
    let plaintext = session.decrypt(&mut OsRng, message)?;
    let session_id = session.id;
    device.activate(slot, max_inactive);
    Ok((plaintext, session_id))
}

impl std::fmt::Debug for SesameManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SesameManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
