//! Integration tests for X3DH and Double Ratchet
//!
//! Tests complete protocol flows including:
//! - Full X3DH handshake with and without a one-time prekey
//! - Double Ratchet initialization and message exchange
//! - Out-of-order message delivery
//! - Error conditions

mod common;

use common::{ratchet_pair, Responder};
use rand_core::OsRng;
use trill_protocol::double_ratchet::{Header, Message, RatchetState, MAX_SKIP};
use trill_protocol::error::ChainKind;
use trill_protocol::keys::{IdentityKeyPair, SecretKey};
use trill_protocol::x3dh::{initiate_with_bundle, receive, PreKeyBundle};
use trill_protocol::Error;

#[test]
fn test_full_protocol_flow() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();
    let bundle = bob.bundle();

    // Alice initiates X3DH
    let (alice_x3dh, preamble) = initiate_with_bundle(&mut OsRng, &alice_identity, &bundle)
        .expect("X3DH initiation should succeed");
    assert_eq!(preamble.one_time_prekey_id, Some(bob.one_time_prekey.id));

    // Bob responds from the preamble
    let bob_x3dh = receive(
        &bob.identity,
        bob.signed_prekey.pre_key.secret_key(),
        Some(bob.one_time_prekey.secret_key()),
        &preamble.identity_key,
        &preamble.ephemeral_key,
    )
    .expect("X3DH response should succeed");

    assert_eq!(
        alice_x3dh.shared_secret.as_bytes(),
        bob_x3dh.shared_secret.as_bytes(),
        "X3DH shared secrets must match"
    );
    assert_eq!(alice_x3dh.associated_data, bob_x3dh.associated_data);

    let mut alice_ratchet = RatchetState::init_initiator(
        &mut OsRng,
        alice_x3dh.shared_secret,
        alice_x3dh.associated_data,
        bundle.signed_prekey,
    );
    let mut bob_ratchet = RatchetState::init_responder(
        bob_x3dh.shared_secret,
        bob_x3dh.associated_data,
        bob.signed_prekey.pre_key.secret_key().clone(),
    );

    let messages = vec![
        b"Hello Bob!".as_slice(),
        b"How are you?".as_slice(),
        b"This is a secure message".as_slice(),
    ];

    for msg in &messages {
        let encrypted = alice_ratchet
            .encrypt(&mut OsRng, msg, b"")
            .expect("Encryption should succeed");
        let decrypted = bob_ratchet
            .decrypt(&mut OsRng, &encrypted, b"")
            .expect("Decryption should succeed");
        assert_eq!(&decrypted, msg, "Decrypted message must match original");
    }

    let response = b"Hello Alice! I'm good!";
    let encrypted = bob_ratchet.encrypt(&mut OsRng, response, b"").unwrap();
    let decrypted = alice_ratchet.decrypt(&mut OsRng, &encrypted, b"").unwrap();
    assert_eq!(&decrypted, response);
}

#[test]
fn test_handshake_without_one_time_prekey() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();
    let bundle = PreKeyBundle::new(&bob.identity, &bob.signed_prekey, None);

    let (alice_x3dh, preamble) = initiate_with_bundle(&mut OsRng, &alice_identity, &bundle).unwrap();
    assert_eq!(preamble.one_time_prekey_id, None);

    let bob_x3dh = receive(
        &bob.identity,
        bob.signed_prekey.pre_key.secret_key(),
        None,
        &preamble.identity_key,
        &preamble.ephemeral_key,
    )
    .unwrap();
    assert_eq!(alice_x3dh.shared_secret, bob_x3dh.shared_secret);

    // Using the one-time prekey on only one side breaks agreement
    let mismatched = receive(
        &bob.identity,
        bob.signed_prekey.pre_key.secret_key(),
        Some(bob.one_time_prekey.secret_key()),
        &preamble.identity_key,
        &preamble.ephemeral_key,
    )
    .unwrap();
    assert_ne!(alice_x3dh.shared_secret, mismatched.shared_secret);
}

#[test]
fn test_responder_cannot_send_first() {
    let (_alice, mut bob) = ratchet_pair();
    assert_eq!(
        bob.encrypt(&mut OsRng, b"too early", b"").unwrap_err(),
        Error::MissingChainKey(ChainKind::Sending)
    );
}

#[test]
fn test_out_of_order_messages() {
    let (mut alice, mut bob) = ratchet_pair();

    let m0 = alice.encrypt(&mut OsRng, b"Message 0", b"").unwrap();
    let m1 = alice.encrypt(&mut OsRng, b"Message 1", b"").unwrap();
    let m2 = alice.encrypt(&mut OsRng, b"Message 2", b"").unwrap();
    let m3 = alice.encrypt(&mut OsRng, b"Message 3", b"").unwrap();

    // Bob receives 3, 0, 1, 2
    assert_eq!(bob.decrypt(&mut OsRng, &m3, b"").unwrap(), b"Message 3");
    assert_eq!(bob.skipped_len(), 3);
    assert_eq!(bob.decrypt(&mut OsRng, &m0, b"").unwrap(), b"Message 0");
    assert_eq!(bob.decrypt(&mut OsRng, &m1, b"").unwrap(), b"Message 1");
    assert_eq!(bob.decrypt(&mut OsRng, &m2, b"").unwrap(), b"Message 2");
    assert_eq!(bob.skipped_len(), 0);
}

#[test]
fn test_skip_bound_is_enforced() {
    let (mut alice, mut bob) = ratchet_pair();

    let mut last = None;
    for _ in 0..=MAX_SKIP + 1 {
        last = Some(alice.encrypt(&mut OsRng, b"x", b"").unwrap());
    }
    let too_far = last.unwrap();
    assert_eq!(too_far.header.n, MAX_SKIP + 1);

    assert_eq!(
        bob.decrypt(&mut OsRng, &too_far, b"").unwrap_err(),
        Error::RatchetExhausted {
            current: 0,
            requested: MAX_SKIP + 1,
            max_skip: MAX_SKIP,
        }
    );
    assert!(bob.remote_ratchet_key().is_none(), "failed decrypt must not advance state");
}

#[test]
fn test_skip_exactly_max_is_allowed() {
    let (mut alice, mut bob) = ratchet_pair();

    let mut last = None;
    for _ in 0..=MAX_SKIP {
        last = Some(alice.encrypt(&mut OsRng, b"edge", b"").unwrap());
    }
    let message = last.unwrap();
    assert_eq!(message.header.n, MAX_SKIP);
    assert_eq!(bob.decrypt(&mut OsRng, &message, b"").unwrap(), b"edge");
    assert_eq!(bob.skipped_len(), MAX_SKIP as usize);
}

#[test]
fn test_bidirectional_messaging() {
    let (mut alice, mut bob) = ratchet_pair();

    let a1 = alice.encrypt(&mut OsRng, b"Alice 1", b"").unwrap();
    assert_eq!(bob.decrypt(&mut OsRng, &a1, b"").unwrap(), b"Alice 1");

    let b1 = bob.encrypt(&mut OsRng, b"Bob 1", b"").unwrap();
    assert_eq!(alice.decrypt(&mut OsRng, &b1, b"").unwrap(), b"Bob 1");

    let a2 = alice.encrypt(&mut OsRng, b"Alice 2", b"").unwrap();
    assert_ne!(a2.header.dh, a1.header.dh, "Alice must ratchet after Bob replies");
    assert_eq!(a2.header.pn, 1);
    assert_eq!(bob.decrypt(&mut OsRng, &a2, b"").unwrap(), b"Alice 2");
}

#[test]
fn test_invalid_signature_rejected() {
    let bob = Responder::generate();
    let mut bundle = bob.bundle();
    bundle.signed_prekey_signature[0] ^= 1;

    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let result = initiate_with_bundle(&mut OsRng, &alice_identity, &bundle);
    assert_eq!(result.unwrap_err(), Error::SignatureInvalid);
}

#[test]
fn test_message_serialization() {
    let header = Header {
        dh: SecretKey::generate(&mut OsRng).public_key(),
        pn: 10,
        n: 5,
    };
    let message = Message {
        header,
        ciphertext: vec![1, 2, 3, 4, 5],
    };

    let bytes = message.to_bytes();
    assert_eq!(&bytes[32..36], &10u32.to_be_bytes());
    assert_eq!(&bytes[36..40], &5u32.to_be_bytes());

    let deserialized = Message::from_bytes(&bytes).expect("Deserialization should succeed");
    assert_eq!(deserialized, message);
    assert_eq!(Message::from_bytes(&bytes[..39]).unwrap_err(), Error::InvalidMessageFormat);
}

#[test]
fn test_associated_data_integrity() {
    let (mut alice, mut bob) = ratchet_pair();

    let ad = b"important context";
    let encrypted = alice.encrypt(&mut OsRng, b"secret", ad).unwrap();
    assert_eq!(bob.decrypt(&mut OsRng, &encrypted, ad).unwrap(), b"secret");

    let encrypted2 = alice.encrypt(&mut OsRng, b"secret2", ad).unwrap();
    assert_eq!(
        bob.decrypt(&mut OsRng, &encrypted2, b"wrong AD").unwrap_err(),
        Error::AuthenticationFailure
    );
    // The failed attempt left the key in place
    assert_eq!(bob.decrypt(&mut OsRng, &encrypted2, ad).unwrap(), b"secret2");
}

#[test]
fn test_tampered_header_rejected() {
    let (mut alice, mut bob) = ratchet_pair();
    let mut message = alice.encrypt(&mut OsRng, b"payload", b"").unwrap();
    message.header.pn = 7;
    assert_eq!(
        bob.decrypt(&mut OsRng, &message, b"").unwrap_err(),
        Error::AuthenticationFailure
    );
}

#[test]
fn test_lost_messages_across_ratchet_steps() {
    let (mut alice, mut bob) = ratchet_pair();

    let a0 = alice.encrypt(&mut OsRng, b"a0", b"").unwrap();
    let lost = alice.encrypt(&mut OsRng, b"a1", b"").unwrap();
    bob.decrypt(&mut OsRng, &a0, b"").unwrap();

    let b0 = bob.encrypt(&mut OsRng, b"b0", b"").unwrap();
    alice.decrypt(&mut OsRng, &b0, b"").unwrap();

    // New chain announces pn = 2, so Bob caches a1's key before ratcheting
    let a2 = alice.encrypt(&mut OsRng, b"a2", b"").unwrap();
    assert_eq!(bob.decrypt(&mut OsRng, &a2, b"").unwrap(), b"a2");
    assert_eq!(bob.skipped_len(), 1);
    assert_eq!(bob.decrypt(&mut OsRng, &lost, b"").unwrap(), b"a1");
}

#[test]
fn test_forward_secrecy() {
    let (mut alice, mut bob) = ratchet_pair();

    let mut sent = Vec::new();
    for i in 0..10 {
        let msg = format!("Message {i}");
        let encrypted = alice.encrypt(&mut OsRng, msg.as_bytes(), b"").unwrap();
        bob.decrypt(&mut OsRng, &encrypted, b"").unwrap();
        sent.push(encrypted);
    }

    // Keys are deleted after use, so a captured state cannot reopen old traffic
    let mut captured = RatchetState::from_bytes(&bob.to_bytes()).unwrap();
    for message in &sent {
        assert!(captured.decrypt(&mut OsRng, message, b"").is_err());
    }
}

#[test]
fn test_large_messages() {
    let (mut alice, mut bob) = ratchet_pair();

    // 1 MB message
    let large_message = vec![42u8; 1_000_000];
    let encrypted = alice.encrypt(&mut OsRng, &large_message, b"").unwrap();
    let decrypted = bob.decrypt(&mut OsRng, &encrypted, b"").unwrap();
    assert_eq!(decrypted, large_message);
}

#[test]
fn test_empty_message() {
    let (mut alice, mut bob) = ratchet_pair();
    let encrypted = alice.encrypt(&mut OsRng, b"", b"").unwrap();
    // One full padding block
    assert_eq!(encrypted.ciphertext.len(), 16 + 16 + 32);
    assert!(bob.decrypt(&mut OsRng, &encrypted, b"").unwrap().is_empty());
}
