//! Complete example of multi-device messaging
//!
//! Alice has one device, Bob has a phone and a laptop. Alice's message is
//! fanned out to both of Bob's devices, Bob replies from the laptop, and
//! the reply reaches Alice. Run with `RUST_LOG=debug` to watch the sessions
//! being created.

use async_trait::async_trait;
use rand_core::OsRng;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use trill_protocol::{
    DeviceId, Error, InMemoryKeyStore, InMemoryRecordStore, KeyStore, Network, PreKeyBundleWire,
    Result, SendResponse, SesameConfig, SesameManager, WireMessage,
};

/// Toy relay: a device directory plus one mailbox per device.
#[derive(Default)]
struct Relay {
    devices: Mutex<BTreeMap<String, BTreeMap<DeviceId, InMemoryKeyStore>>>,
    mailboxes: Mutex<HashMap<(String, DeviceId), VecDeque<WireMessage>>>,
}

impl Relay {
    fn register(&self, store: &InMemoryKeyStore) -> Result<()> {
        let (user_id, device_id) = store.local_address()?;
        self.devices
            .lock()
            .map_err(|_| Error::Network("relay poisoned".into()))?
            .entry(user_id)
            .or_default()
            .insert(device_id, store.clone());
        Ok(())
    }
}

#[async_trait]
impl Network for Relay {
    async fn fetch_prekey_bundle(&self, user_id: &str, device_id: DeviceId) -> Result<PreKeyBundleWire> {
        let devices = self.devices.lock().map_err(|_| Error::Network("relay poisoned".into()))?;
        let store = devices
            .get(user_id)
            .and_then(|devices| devices.get(&device_id))
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        Ok(store.next_bundle()?.to_wire())
    }

    async fn fetch_user_devices(&self, user_id: &str) -> Result<HashMap<DeviceId, String>> {
        let devices = self.devices.lock().map_err(|_| Error::Network("relay poisoned".into()))?;
        let devices = devices
            .get(user_id)
            .ok_or_else(|| Error::UserNotFound(user_id.to_string()))?;
        devices
            .iter()
            .map(|(id, store)| Ok((*id, store.identity()?.public_key().to_base64())))
            .collect()
    }

    async fn send_messages(&self, messages: Vec<WireMessage>) -> Result<SendResponse> {
        let mut mailboxes = self.mailboxes.lock().map_err(|_| Error::Network("relay poisoned".into()))?;
        for message in messages {
            mailboxes
                .entry((message.recipient_id.clone(), message.recipient_device_id))
                .or_default()
                .push_back(message);
        }
        Ok(SendResponse::Success)
    }

    async fn fetch_messages(&self, user_id: &str, device_id: DeviceId) -> Result<Vec<WireMessage>> {
        let mut mailboxes = self.mailboxes.lock().map_err(|_| Error::Network("relay poisoned".into()))?;
        Ok(mailboxes
            .remove(&(user_id.to_string(), device_id))
            .map(Vec::from)
            .unwrap_or_default())
    }
}

fn device(relay: &Arc<Relay>, user_id: &str, device_id: DeviceId) -> Result<SesameManager> {
    let keys = InMemoryKeyStore::generate(&mut OsRng, user_id, device_id, 10);
    relay.register(&keys)?;
    Ok(SesameManager::new(
        SesameConfig::default(),
        Arc::new(keys),
        Arc::new(InMemoryRecordStore::new()),
        Arc::clone(relay) as Arc<dyn Network>,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("=== Trill Protocol Complete Example ===\n");

    println!("1. Registering devices with the relay...");
    let relay = Arc::new(Relay::default());
    let alice = device(&relay, "alice", 1)?;
    let bob_phone = device(&relay, "bob", 1)?;
    let bob_laptop = device(&relay, "bob", 2)?;
    println!("   ✓ alice:1, bob:1, bob:2\n");

    println!("2. Alice sends to Bob...");
    let report = alice.send_message("bob", b"Hello Bob!").await?;
    println!("   ✓ Encrypted for devices {:?}\n", report.device_ids);

    println!("3. Bob's devices sync...");
    for (name, manager) in [("phone", &bob_phone), ("laptop", &bob_laptop)] {
        for message in manager.sync_messages().await? {
            println!(
                "   ✓ {name} got {:?} from {}:{} (new session: {})",
                String::from_utf8_lossy(&message.plaintext),
                message.sender_id,
                message.sender_device_id,
                message.new_session
            );
        }
    }
    println!();

    println!("4. Bob replies from the laptop...");
    bob_laptop.send_message("alice", b"Hi Alice, laptop here").await?;
    for message in alice.sync_messages().await? {
        println!(
            "   ✓ Alice got {:?} from {}:{}",
            String::from_utf8_lossy(&message.plaintext),
            message.sender_id,
            message.sender_device_id
        );
    }
    println!();

    println!("5. Conversation continues on the established sessions...");
    for i in 1..=3 {
        alice.send_message("bob", format!("Message {i}").as_bytes()).await?;
    }
    let received = bob_phone.sync_messages().await?;
    println!("   ✓ Bob's phone decrypted {} messages", received.len());
    println!(
        "   ✓ Alice holds {} session(s) with bob:1\n",
        alice.session_count("bob", 1).await
    );

    println!("=== Done ===");
    Ok(())
}
