//! Shared fixtures: an in-memory directory plus transport, and helpers to
//! stand up devices.

#![allow(dead_code)]

use async_trait::async_trait;
use rand_core::OsRng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use trill_protocol::keys::PublicKey;
use trill_protocol::{
    x3dh, DeviceId, Error, IdentityKeyPair, InMemoryKeyStore, InMemoryRecordStore, KeyStore,
    ManualClock, Network, PreKey, PreKeyBundle, PreKeyBundleWire, RatchetState, RecordStore,
    Result, SendResponse, SesameConfig, SesameManager, SignedPreKey, WireMessage,
};

#[derive(Default)]
struct Directory {
    devices: BTreeMap<String, BTreeMap<DeviceId, InMemoryKeyStore>>,
    identity_overrides: HashMap<(String, DeviceId), PublicKey>,
    mailboxes: HashMap<(String, DeviceId), VecDeque<WireMessage>>,
    scripted: VecDeque<SendResponse>,
    transient_failures: u32,
    batches: Vec<Vec<WireMessage>>,
    bundle_fetches: usize,
    send_calls: usize,
}

/// Directory and mailbox server shared by every device in a test.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Directory>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, store: &InMemoryKeyStore) {
        let (user_id, device_id) = store.local_address().unwrap();
        self.inner
            .lock()
            .unwrap()
            .devices
            .entry(user_id)
            .or_default()
            .insert(device_id, store.clone());
    }

    pub fn unregister(&self, user_id: &str, device_id: DeviceId) {
        if let Some(devices) = self.inner.lock().unwrap().devices.get_mut(user_id) {
            devices.remove(&device_id);
        }
    }

    /// Make the directory list `identity` for a device instead of its real key
    pub fn override_identity(&self, user_id: &str, device_id: DeviceId, identity: PublicKey) {
        self.inner
            .lock()
            .unwrap()
            .identity_overrides
            .insert((user_id.to_string(), device_id), identity);
    }

    /// Answer the next `send_messages` call with `response` without delivering
    pub fn script(&self, response: SendResponse) {
        self.inner.lock().unwrap().scripted.push_back(response);
    }

    /// Fail the next `count` device-list fetches with a network error
    pub fn fail_device_fetches(&self, count: u32) {
        self.inner.lock().unwrap().transient_failures = count;
    }

    pub fn batches(&self) -> Vec<Vec<WireMessage>> {
        self.inner.lock().unwrap().batches.clone()
    }

    pub fn bundle_fetches(&self) -> usize {
        self.inner.lock().unwrap().bundle_fetches
    }

    pub fn send_calls(&self) -> usize {
        self.inner.lock().unwrap().send_calls
    }

    pub fn pending(&self, user_id: &str, device_id: DeviceId) -> usize {
        self.inner
            .lock()
            .unwrap()
            .mailboxes
            .get(&(user_id.to_string(), device_id))
            .map_or(0, VecDeque::len)
    }

    /// Remove and return everything queued for a device
    pub fn take(&self, user_id: &str, device_id: DeviceId) -> Vec<WireMessage> {
        self.inner
            .lock()
            .unwrap()
            .mailboxes
            .remove(&(user_id.to_string(), device_id))
            .map(Vec::from)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    async fn fetch_prekey_bundle(&self, user_id: &str, device_id: DeviceId) -> Result<PreKeyBundleWire> {
        let mut inner = self.inner.lock().unwrap();
        inner.bundle_fetches += 1;
        let store = inner
            .devices
            .get(user_id)
            .and_then(|devices| devices.get(&device_id))
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        Ok(store.next_bundle()?.to_wire())
    }

    async fn fetch_user_devices(&self, user_id: &str) -> Result<HashMap<DeviceId, String>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(Error::Network("connection reset".into()));
        }
        let devices = inner
            .devices
            .get(user_id)
            .filter(|devices| !devices.is_empty())
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;

        Ok(devices
            .iter()
            .map(|(device_id, store)| {
                let identity = inner
                    .identity_overrides
                    .get(&(user_id.to_string(), *device_id))
                    .copied()
                    .unwrap_or_else(|| *store.identity().unwrap().public_key());
                (*device_id, identity.to_base64())
            })
            .collect())
    }

    async fn send_messages(&self, messages: Vec<WireMessage>) -> Result<SendResponse> {
        let mut inner = self.inner.lock().unwrap();
        inner.send_calls += 1;
        inner.batches.push(messages.clone());
        if let Some(response) = inner.scripted.pop_front() {
            return Ok(response);
        }
        let Some(first) = messages.first() else {
            return Ok(SendResponse::Success);
        };

        let recipient = first.recipient_id.clone();
        let Some(devices) = inner.devices.get(&recipient) else {
            return Ok(SendResponse::UserNotFound);
        };

        let sender_device = (first.sender_id == recipient).then_some(first.sender_device_id);
        let addressed: Vec<DeviceId> = messages.iter().map(|m| m.recipient_device_id).collect();
        let old_devices: Vec<DeviceId> = addressed
            .iter()
            .copied()
            .filter(|id| !devices.contains_key(id))
            .collect();
        let new_devices: HashMap<DeviceId, String> = devices
            .iter()
            .filter(|(id, _)| !addressed.contains(id) && Some(**id) != sender_device)
            .map(|(id, store)| (*id, store.identity().unwrap().public_key().to_base64()))
            .collect();

        if !old_devices.is_empty() || !new_devices.is_empty() {
            return Ok(SendResponse::DeviceMismatch {
                old_devices,
                new_devices,
            });
        }

        for message in messages {
            inner
                .mailboxes
                .entry((message.recipient_id.clone(), message.recipient_device_id))
                .or_default()
                .push_back(message);
        }
        Ok(SendResponse::Success)
    }

    async fn fetch_messages(&self, user_id: &str, device_id: DeviceId) -> Result<Vec<WireMessage>> {
        Ok(self.take(user_id, device_id))
    }
}

/// One device with its manager and stores.
pub struct Device {
    pub keys: InMemoryKeyStore,
    pub records: InMemoryRecordStore,
    pub manager: Arc<SesameManager>,
}

impl Device {
    pub fn new(network: &MemoryNetwork, user_id: &str, device_id: DeviceId) -> Self {
        Self::with_config(network, user_id, device_id, test_config(), None)
    }

    pub fn with_config(
        network: &MemoryNetwork,
        user_id: &str,
        device_id: DeviceId,
        config: SesameConfig,
        clock: Option<Arc<ManualClock>>,
    ) -> Self {
        let keys = InMemoryKeyStore::generate(&mut OsRng, user_id, device_id, 5);
        network.register(&keys);
        let records = InMemoryRecordStore::new();
        let manager = build_manager(network, &keys, &records, config, clock);
        Self {
            keys,
            records,
            manager: Arc::new(manager),
        }
    }

    /// A fresh manager over the same stores, as after a restart
    pub fn restart(&self, network: &MemoryNetwork) -> SesameManager {
        build_manager(network, &self.keys, &self.records, test_config(), None)
    }
}

/// Register a fresh device and run its manager over `records`
pub fn manager_with_records(
    network: &MemoryNetwork,
    user_id: &str,
    device_id: DeviceId,
    records: Arc<dyn RecordStore>,
) -> SesameManager {
    let keys = InMemoryKeyStore::generate(&mut OsRng, user_id, device_id, 5);
    network.register(&keys);
    SesameManager::new(test_config(), Arc::new(keys), records, Arc::new(network.clone()))
}

/// Record store that can never save.
pub struct FullDisk;

impl RecordStore for FullDisk {
    fn load_records(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn save_records(&self, _snapshot: &[u8]) -> Result<()> {
        Err(Error::Storage("disk full".into()))
    }
}

fn build_manager(
    network: &MemoryNetwork,
    keys: &InMemoryKeyStore,
    records: &InMemoryRecordStore,
    config: SesameConfig,
    clock: Option<Arc<ManualClock>>,
) -> SesameManager {
    let manager = SesameManager::new(
        config,
        Arc::new(keys.clone()),
        Arc::new(records.clone()),
        Arc::new(network.clone()),
    );
    match clock {
        Some(clock) => manager.with_clock(clock),
        None => manager,
    }
}

pub fn test_config() -> SesameConfig {
    SesameConfig {
        retry_backoff_ms: 0,
        ..SesameConfig::default()
    }
}

/// Bob's long-term keys for two-party ratchet tests.
pub struct Responder {
    pub identity: IdentityKeyPair,
    pub signed_prekey: SignedPreKey,
    pub one_time_prekey: PreKey,
}

impl Responder {
    pub fn generate() -> Self {
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let signed_prekey = SignedPreKey::generate(&mut OsRng, &identity, 1);
        let one_time_prekey = PreKey::generate(&mut OsRng, 1);
        Self {
            identity,
            signed_prekey,
            one_time_prekey,
        }
    }

    pub fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle::new(&self.identity, &self.signed_prekey, Some(&self.one_time_prekey))
    }
}

/// Run X3DH between two fresh identities and return (alice, bob) ratchets.
pub fn ratchet_pair() -> (RatchetState, RatchetState) {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();
    let bundle = bob.bundle();

    let (alice_x3dh, preamble) =
        x3dh::initiate_with_bundle(&mut OsRng, &alice_identity, &bundle).unwrap();
    let bob_x3dh = x3dh::receive(
        &bob.identity,
        bob.signed_prekey.pre_key.secret_key(),
        Some(bob.one_time_prekey.secret_key()),
        &preamble.identity_key,
        &preamble.ephemeral_key,
    )
    .unwrap();

    let alice = RatchetState::init_initiator(
        &mut OsRng,
        alice_x3dh.shared_secret,
        alice_x3dh.associated_data,
        bundle.signed_prekey,
    );
    let bob = RatchetState::init_responder(
        bob_x3dh.shared_secret,
        bob_x3dh.associated_data,
        bob.signed_prekey.pre_key.secret_key().clone(),
    );
    (alice, bob)
}
