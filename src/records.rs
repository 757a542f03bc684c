//! Session, device and user records tracked by the session manager.
//!
//! A [`UserRecord`] owns its [`DeviceRecord`]s, each of which owns an
//! optional active [`Session`] plus a most-recent-first list of inactive ones.

use crate::double_ratchet::{Header, Message, RatchetState};
use crate::error::Result;
use crate::keys::PublicKey;
use crate::network::WireContent;
use crate::x3dh::PreKeyPreamble;
use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub type UserId = String;
pub type DeviceId = u32;

/// One ratchet session with one remote device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    ratchet: RatchetState,
    is_initiating: bool,
    created_at: u64,
    pending_preamble: Option<PreKeyPreamble>,
    base_key: PublicKey,
}

impl Session {
    /// Session we started; its messages carry `preamble` until the peer replies.
    #[must_use]
    pub fn initiating(id: u64, ratchet: RatchetState, preamble: PreKeyPreamble, now: u64) -> Self {
        Self {
            id,
            ratchet,
            is_initiating: true,
            created_at: now,
            base_key: preamble.ephemeral_key,
            pending_preamble: Some(preamble),
        }
    }

    /// Session created from a received preamble with the given base key.
    #[must_use]
    pub fn responding(id: u64, ratchet: RatchetState, base_key: PublicKey, now: u64) -> Self {
        Self {
            id,
            ratchet,
            is_initiating: false,
            created_at: now,
            pending_preamble: None,
            base_key,
        }
    }

    pub fn encrypt<R: CryptoRngCore>(&mut self, rng: &mut R, plaintext: &[u8]) -> Result<WireContent> {
        let message = self.ratchet.encrypt(rng, plaintext, &[])?;
        Ok(WireContent::new(message, self.pending_preamble))
    }

    /// Decrypt; a successful decrypt on an initiating session proves the
    /// peer has the session, so the preamble is dropped.
    pub fn decrypt<R: CryptoRngCore>(&mut self, rng: &mut R, message: &Message) -> Result<Vec<u8>> {
        let plaintext = self.ratchet.decrypt(rng, message, &[])?;
        if self.pending_preamble.take().is_some() {
            debug!(session = self.id, "peer replied, dropping preamble");
        }
        Ok(plaintext)
    }

    /// True if the header continues this session's current receiving chain or
    /// names a cached skipped key.
    #[must_use]
    pub fn matches_header(&self, header: &Header) -> bool {
        self.ratchet.remote_ratchet_key() == Some(&header.dh) || self.ratchet.has_skipped_key(header)
    }

    #[must_use]
    pub fn base_key(&self) -> &PublicKey {
        &self.base_key
    }

    #[must_use]
    pub fn is_initiating(&self) -> bool {
        self.is_initiating
    }

    #[must_use]
    pub fn pending_preamble(&self) -> Option<&PreKeyPreamble> {
        self.pending_preamble.as_ref()
    }

    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[must_use]
    pub fn ratchet(&self) -> &RatchetState {
        &self.ratchet
    }
}

/// Where a session lives inside a [`DeviceRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSlot {
    Active,
    Inactive(usize),
}

/// One remote device and its sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    identity_key: PublicKey,
    active_session: Option<Session>,
    inactive_sessions: Vec<Session>,
    is_stale: bool,
    stale_since: Option<u64>,
    /// Identity key last matched the directory listing
    confirmed: bool,
}

impl DeviceRecord {
    /// A device as listed by the directory
    #[must_use]
    pub fn new(device_id: DeviceId, identity_key: PublicKey) -> Self {
        Self {
            device_id,
            identity_key,
            active_session: None,
            inactive_sessions: Vec::new(),
            is_stale: false,
            stale_since: None,
            confirmed: true,
        }
    }

    /// A device known only from the identity key its own handshake claimed
    #[must_use]
    pub fn unconfirmed(device_id: DeviceId, identity_key: PublicKey) -> Self {
        Self {
            confirmed: false,
            ..Self::new(device_id, identity_key)
        }
    }

    #[must_use]
    pub fn identity_key(&self) -> &PublicKey {
        &self.identity_key
    }

    /// Record the device's identity key. A changed key invalidates every
    /// session; returns true if that happened.
    pub fn set_identity_key(&mut self, identity_key: PublicKey) -> bool {
        if self.identity_key == identity_key {
            return false;
        }
        warn!(device = self.device_id, "device identity key changed, dropping sessions");
        self.identity_key = identity_key;
        self.active_session = None;
        self.inactive_sessions.clear();
        true
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    /// Require a directory lookup before this device is sent to again
    pub fn mark_unconfirmed(&mut self) {
        self.confirmed = false;
    }

    #[must_use]
    pub fn active_session(&self) -> Option<&Session> {
        self.active_session.as_ref()
    }

    pub fn active_session_mut(&mut self) -> Option<&mut Session> {
        self.active_session.as_mut()
    }

    #[must_use]
    pub fn inactive_sessions(&self) -> &[Session] {
        &self.inactive_sessions
    }

    /// Make `session` active, pushing the previous active session to the
    /// front of the inactive list and dropping the oldest beyond `max_inactive`.
    pub fn install_session(&mut self, session: Session, max_inactive: usize) {
        if let Some(previous) = self.active_session.replace(session) {
            self.inactive_sessions.insert(0, previous);
            self.inactive_sessions.truncate(max_inactive);
        }
    }

    /// Promote the session in `slot` to active. Returns the slot it now occupies.
    pub fn activate(&mut self, slot: SessionSlot, max_inactive: usize) -> SessionSlot {
        if let SessionSlot::Inactive(index) = slot {
            if index < self.inactive_sessions.len() {
                let session = self.inactive_sessions.remove(index);
                debug!(device = self.device_id, session = session.id, "activating session");
                self.install_session(session, max_inactive);
            }
        }
        SessionSlot::Active
    }

    pub fn session_mut(&mut self, slot: SessionSlot) -> Option<&mut Session> {
        match slot {
            SessionSlot::Active => self.active_session.as_mut(),
            SessionSlot::Inactive(index) => self.inactive_sessions.get_mut(index),
        }
    }

    /// Active first, then inactive most-recent-first
    pub fn slots(&self) -> impl Iterator<Item = (SessionSlot, &Session)> + '_ {
        self.active_session
            .iter()
            .map(|session| (SessionSlot::Active, session))
            .chain(
                self.inactive_sessions
                    .iter()
                    .enumerate()
                    .map(|(index, session)| (SessionSlot::Inactive(index), session)),
            )
    }

    #[must_use]
    pub fn find_by_header(&self, header: &Header) -> Option<SessionSlot> {
        self.slots()
            .find(|(_, session)| session.matches_header(header))
            .map(|(slot, _)| slot)
    }

    #[must_use]
    pub fn find_by_base_key(&self, base_key: &PublicKey) -> Option<SessionSlot> {
        self.slots()
            .find(|(_, session)| session.base_key() == base_key)
            .map(|(slot, _)| slot)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        usize::from(self.active_session.is_some()) + self.inactive_sessions.len()
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    /// Mark stale, keeping the earliest timestamp if already stale
    pub fn mark_stale(&mut self, now: u64) {
        if !self.is_stale {
            self.is_stale = true;
            self.stale_since = Some(now);
        }
    }

    pub fn clear_stale(&mut self) {
        self.is_stale = false;
        self.stale_since = None;
    }

    #[must_use]
    pub fn is_expired(&self, now: u64, max_latency_ms: u64) -> bool {
        expired(self.is_stale, self.stale_since, now, max_latency_ms)
    }
}

/// One remote user and their devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: UserId,
    devices: BTreeMap<DeviceId, DeviceRecord>,
    is_stale: bool,
    stale_since: Option<u64>,
}

impl UserRecord {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            devices: BTreeMap::new(),
            is_stale: false,
            stale_since: None,
        }
    }

    #[must_use]
    pub fn device(&self, device_id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }

    pub fn device_mut(&mut self, device_id: DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(&device_id)
    }

    /// Insert or update a device from the directory, dropping its sessions
    /// if the identity key changed. Clears the device's stale flag.
    pub fn upsert_device(&mut self, device_id: DeviceId, identity_key: PublicKey) -> &mut DeviceRecord {
        let device = self
            .devices
            .entry(device_id)
            .or_insert_with(|| DeviceRecord::new(device_id, identity_key));
        device.set_identity_key(identity_key);
        device.confirmed = true;
        device.clear_stale();
        device
    }

    /// Record a device first seen through an incoming handshake. An existing
    /// record is returned as is.
    pub fn claim_device(&mut self, device_id: DeviceId, identity_key: PublicKey) -> &mut DeviceRecord {
        let device = self
            .devices
            .entry(device_id)
            .or_insert_with(|| DeviceRecord::unconfirmed(device_id, identity_key));
        device.clear_stale();
        device
    }

    /// True if a live device has not been checked against the directory
    #[must_use]
    pub fn needs_directory_check(&self) -> bool {
        self.devices
            .values()
            .any(|device| !device.is_stale() && !device.is_confirmed())
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Ids of devices that are not stale
    #[must_use]
    pub fn live_device_ids(&self) -> Vec<DeviceId> {
        self.devices
            .values()
            .filter(|device| !device.is_stale())
            .map(|device| device.device_id)
            .collect()
    }

    #[must_use]
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    /// Remove devices stale for longer than `max_latency_ms`
    pub fn evict_expired_devices(&mut self, now: u64, max_latency_ms: u64) -> Vec<DeviceId> {
        let expired: Vec<DeviceId> = self
            .devices
            .values()
            .filter(|device| device.is_expired(now, max_latency_ms))
            .map(|device| device.device_id)
            .collect();
        for device_id in &expired {
            self.devices.remove(device_id);
        }
        expired
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.is_stale
    }

    pub fn mark_stale(&mut self, now: u64) {
        if !self.is_stale {
            self.is_stale = true;
            self.stale_since = Some(now);
        }
    }

    pub fn clear_stale(&mut self) {
        self.is_stale = false;
        self.stale_since = None;
    }

    #[must_use]
    pub fn is_expired(&self, now: u64, max_latency_ms: u64) -> bool {
        expired(self.is_stale, self.stale_since, now, max_latency_ms)
    }
}

fn expired(is_stale: bool, stale_since: Option<u64>, now: u64, max_latency_ms: u64) -> bool {
    match (is_stale, stale_since) {
        (true, Some(since)) => now.saturating_sub(since) > max_latency_ms,
        _ => false,
    }
}
