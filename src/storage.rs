//! Storage abstractions for local key material and the session record map.
//!
//! Provides trait-based storage backends supporting both in-memory and
//! persistent implementations. Thread-safe with interior mutability.

use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, PreKey, PreKeyPool, SignedPreKey};
use crate::records::{DeviceId, UserId};
use crate::x3dh::PreKeyBundle;
use rand_core::CryptoRngCore;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Signed prekeys kept after rotation so late handshakes still complete
pub const SIGNED_PREKEY_HISTORY: usize = 3;

/// Local device key material.
///
/// One-time prekeys are consumed atomically so a handshake can never reuse one.
pub trait KeyStore: Send + Sync {
    /// The local user and device this store belongs to
    fn local_address(&self) -> Result<(UserId, DeviceId)>;

    /// Long-term identity keypair
    fn identity(&self) -> Result<IdentityKeyPair>;

    /// Current or recently rotated signed prekey by id.
    ///
    /// # Errors
    /// `Error::UnknownSignedPreKey` if the id is neither current nor retained.
    fn signed_prekey(&self, id: u32) -> Result<SignedPreKey>;

    /// Look up a one-time prekey without using it up.
    ///
    /// # Errors
    /// `Error::NoOneTimePreKeyAvailable` if the key was never issued or is already used.
    fn one_time_prekey(&self, id: u32) -> Result<PreKey>;

    /// Remove and return a one-time prekey.
    ///
    /// # Errors
    /// `Error::NoOneTimePreKeyAvailable` if the key was never issued or is already used.
    fn consume_one_time_prekey(&self, id: u32) -> Result<PreKey>;
}

/// Whole-map persistence for session records.
///
/// `save_records` must replace the previous snapshot atomically.
pub trait RecordStore: Send + Sync {
    fn load_records(&self) -> Result<Option<Vec<u8>>>;

    fn save_records(&self, snapshot: &[u8]) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Storage("lock poisoned".into()))
}

#[derive(Debug)]
struct KeyState {
    signed_prekey: SignedPreKey,
    previous_signed_prekeys: VecDeque<SignedPreKey>,
    next_signed_prekey_id: u32,
    pool: PreKeyPool,
    unpublished: VecDeque<u32>,
}

/// Thread-safe in-memory key store.
///
/// Also plays the directory's role of handing out each one-time prekey once,
/// through [`InMemoryKeyStore::next_bundle`].
#[derive(Clone, Debug)]
pub struct InMemoryKeyStore {
    user_id: UserId,
    device_id: DeviceId,
    identity: IdentityKeyPair,
    state: Arc<Mutex<KeyState>>,
}

impl InMemoryKeyStore {
    /// Create a device with a fresh identity, signed prekey and
    /// `one_time_prekeys` one-time prekeys.
    pub fn generate<R: CryptoRngCore>(
        rng: &mut R,
        user_id: impl Into<UserId>,
        device_id: DeviceId,
        one_time_prekeys: u32,
    ) -> Self {
        let identity = IdentityKeyPair::generate(rng);
        let signed_prekey = SignedPreKey::generate(rng, &identity, 1);
        let mut pool = PreKeyPool::new();
        let unpublished = pool
            .replenish(rng, one_time_prekeys)
            .iter()
            .map(|key| key.id)
            .collect();

        Self {
            user_id: user_id.into(),
            device_id,
            identity,
            state: Arc::new(Mutex::new(KeyState {
                signed_prekey,
                previous_signed_prekeys: VecDeque::new(),
                next_signed_prekey_id: 2,
                pool,
                unpublished,
            })),
        }
    }

    /// Build the next bundle to publish, handing out an unused one-time
    /// prekey if one remains.
    pub fn next_bundle(&self) -> Result<PreKeyBundle> {
        let mut state = lock(&self.state)?;
        let opk_id = state.unpublished.pop_front();
        let opk = opk_id.and_then(|id| state.pool.get(id));
        Ok(PreKeyBundle::new(&self.identity, &state.signed_prekey, opk))
    }

    /// Replace the signed prekey, retaining the last few for late handshakes.
    pub fn rotate_signed_prekey<R: CryptoRngCore>(&self, rng: &mut R) -> Result<SignedPreKey> {
        let mut state = lock(&self.state)?;
        let id = state.next_signed_prekey_id;
        state.next_signed_prekey_id = id.wrapping_add(1);

        let fresh = SignedPreKey::generate(rng, &self.identity, id);
        let retired = std::mem::replace(&mut state.signed_prekey, fresh.clone());
        state.previous_signed_prekeys.push_front(retired);
        state.previous_signed_prekeys.truncate(SIGNED_PREKEY_HISTORY);
        Ok(fresh)
    }

    /// Generate more one-time prekeys and queue them for publication
    pub fn replenish_one_time_prekeys<R: CryptoRngCore>(&self, rng: &mut R, count: u32) -> Result<()> {
        let mut state = lock(&self.state)?;
        let fresh = state.pool.replenish(rng, count);
        state.unpublished.extend(fresh.iter().map(|key| key.id));
        Ok(())
    }

    /// Unused one-time prekeys, published or not
    pub fn one_time_prekey_count(&self) -> Result<usize> {
        Ok(lock(&self.state)?.pool.len())
    }
}

impl KeyStore for InMemoryKeyStore {
    fn local_address(&self) -> Result<(UserId, DeviceId)> {
        Ok((self.user_id.clone(), self.device_id))
    }

    fn identity(&self) -> Result<IdentityKeyPair> {
        Ok(self.identity.clone())
    }

    fn signed_prekey(&self, id: u32) -> Result<SignedPreKey> {
        let state = lock(&self.state)?;
        std::iter::once(&state.signed_prekey)
            .chain(state.previous_signed_prekeys.iter())
            .find(|spk| spk.id() == id)
            .cloned()
            .ok_or(Error::UnknownSignedPreKey(id))
    }

    fn one_time_prekey(&self, id: u32) -> Result<PreKey> {
        lock(&self.state)?
            .pool
            .get(id)
            .cloned()
            .ok_or(Error::NoOneTimePreKeyAvailable)
    }

    fn consume_one_time_prekey(&self, id: u32) -> Result<PreKey> {
        let mut state = lock(&self.state)?;
        let key = state.pool.consume(id)?;
        state.unpublished.retain(|queued| *queued != id);
        Ok(key)
    }
}

/// Thread-safe in-memory record snapshot.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRecordStore {
    snapshot: Arc<Mutex<Option<Vec<u8>>>>,
    saves: Arc<Mutex<usize>>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> Result<usize> {
        Ok(*lock(&self.saves)?)
    }
}

impl RecordStore for InMemoryRecordStore {
    fn load_records(&self) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.snapshot)?.clone())
    }

    fn save_records(&self, snapshot: &[u8]) -> Result<()> {
        *lock(&self.snapshot)? = Some(snapshot.to_vec());
        *lock(&self.saves)? += 1;
        Ok(())
    }
}
