mod common;

use common::{ratchet_pair, Responder};
use rand_core::OsRng;
use trill_protocol::keys::{IdentityKeyPair, SecretKey, SignedPreKey};
use trill_protocol::network::PreKeyBundleWire;
use trill_protocol::x3dh::{initiate_with_bundle, receive, PreKeyBundle};
use trill_protocol::{Error, RatchetState};

#[test]
fn test_x3dh_formal_symmetry_multiple_runs() {
    for _ in 0..100 {
        let alice_identity = IdentityKeyPair::generate(&mut OsRng);
        let bob = Responder::generate();

        let (alice_x3dh, preamble) =
            initiate_with_bundle(&mut OsRng, &alice_identity, &bob.bundle()).unwrap();
        let bob_x3dh = receive(
            &bob.identity,
            bob.signed_prekey.pre_key.secret_key(),
            Some(bob.one_time_prekey.secret_key()),
            &preamble.identity_key,
            &preamble.ephemeral_key,
        )
        .unwrap();

        let sk_a = alice_x3dh.shared_secret.as_bytes();
        let sk_b = bob_x3dh.shared_secret.as_bytes();

        assert_eq!(sk_a, sk_b, "X3DH symmetry violated");
    }
}

#[test]
fn test_identity_substitution_breaks_agreement() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let attempter_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();

    let mut modified_bundle = bob.bundle();
    modified_bundle.identity_key = *attempter_identity.public_key();

    let result = initiate_with_bundle(&mut OsRng, &alice_identity, &modified_bundle);
    assert!(result.is_err(), "MITM identity substitution must fail");
}

#[test]
fn test_dh_input_sensitivity() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();

    let (alice_x3dh_1, _) = initiate_with_bundle(&mut OsRng, &alice_identity, &bob.bundle()).unwrap();

    // Rotate Bob's signed prekey
    let rotated = SignedPreKey::generate(&mut OsRng, &bob.identity, 2);
    let bundle2 = PreKeyBundle::new(&bob.identity, &rotated, None);
    let (alice_x3dh_2, _) = initiate_with_bundle(&mut OsRng, &alice_identity, &bundle2).unwrap();

    assert_ne!(
        alice_x3dh_1.shared_secret.as_bytes(),
        alice_x3dh_2.shared_secret.as_bytes(),
        "Changing DH inputs must change shared secret"
    );
}

#[test]
fn test_root_chain_key_separation() {
    let (mut alice, _bob) = ratchet_pair();
    let root_before = alice.to_bytes();

    let first = alice.encrypt(&mut OsRng, b"test", b"").unwrap();
    let second = alice.encrypt(&mut OsRng, b"test", b"").unwrap();

    assert_ne!(root_before, alice.to_bytes(), "sending step must advance the state");
    assert_eq!(first.header.dh, second.header.dh);
    assert_eq!((first.header.n, second.header.n), (0, 1));
    assert_ne!(first.ciphertext, second.ciphertext);
}

#[test]
fn test_identity_substitution_attempts() {
    let bob = Responder::generate();
    let attempter_identity = IdentityKeyPair::generate(&mut OsRng);
    let original_bundle = bob.bundle();

    assert!(original_bundle.verify_signature().is_ok());

    // Attempt to replace identity key
    let mut attempt1 = original_bundle.clone();
    attempt1.identity_key = *attempter_identity.public_key();
    assert!(
        attempt1.verify_signature().is_err(),
        "Identity key substitution should fail - signature won't verify with different key"
    );

    // Attempt to replace signed prekey
    let attempter_spk = SecretKey::generate(&mut OsRng);
    let mut attempt2 = original_bundle.clone();
    attempt2.signed_prekey = attempter_spk.public_key();
    assert!(
        attempt2.verify_signature().is_err(),
        "Signed prekey substitution should fail - breaks signature"
    );

    // Attempt 3: Replace both identity and signed prekey
    let mut attempt3 = original_bundle.clone();
    attempt3.identity_key = *attempter_identity.public_key();
    attempt3.signed_prekey = attempter_spk.public_key();
    assert!(
        attempt3.verify_signature().is_err(),
        "Full substitution should fail - attempter's signature not present"
    );

    // Attempt 4: Tamper with signature bytes
    let mut attempt4 = original_bundle;
    attempt4.signed_prekey_signature[0] ^= 0xFF;
    assert!(
        attempt4.verify_signature().is_err(),
        "Corrupted signature should fail"
    );
}

#[test]
fn test_mitm_full_attempt_scenario() {
    let alice_identity = IdentityKeyPair::generate(&mut OsRng);
    let attempter_identity = IdentityKeyPair::generate(&mut OsRng);
    let bob = Responder::generate();

    let mut bundle = bob.bundle();
    bundle.identity_key = *attempter_identity.public_key();

    let result = initiate_with_bundle(&mut OsRng, &alice_identity, &bundle);
    assert_eq!(result.unwrap_err(), Error::SignatureInvalid);
}

#[test]
fn test_xeddsa_signature_uniqueness() {
    let bob_identity = IdentityKeyPair::generate(&mut OsRng);

    let spk1 = SignedPreKey::generate(&mut OsRng, &bob_identity, 1);
    let spk2 = SignedPreKey::generate(&mut OsRng, &bob_identity, 2);
    let bundle1 = PreKeyBundle::new(&bob_identity, &spk1, None);
    let bundle2 = PreKeyBundle::new(&bob_identity, &spk2, None);

    assert_eq!(bundle1.identity_key, bundle2.identity_key);
    assert_ne!(bundle1.signed_prekey, bundle2.signed_prekey);
    assert_ne!(
        bundle1.signed_prekey_signature, bundle2.signed_prekey_signature,
        "XEdDSA signatures should be randomized"
    );

    assert!(bundle1.verify_signature().is_ok());
    assert!(bundle2.verify_signature().is_ok());
}

#[test]
fn test_xeddsa_cross_bundle_signature_reuse_fails() {
    let bob = Responder::generate();
    let eve = Responder::generate();

    let bob_bundle = bob.bundle();
    let mut eve_bundle = eve.bundle();
    eve_bundle.signed_prekey_signature = bob_bundle.signed_prekey_signature;

    assert!(
        eve_bundle.verify_signature().is_err(),
        "Signature from different identity should not verify"
    );
}

#[test]
fn test_bundle_survives_wire_encoding() {
    let bob = Responder::generate();
    let bundle = bob.bundle();

    let wire = bundle.to_wire();
    assert_eq!(PreKeyBundle::from_wire(&wire).unwrap(), bundle);

    let half_opk = PreKeyBundleWire {
        one_time_prekey: None,
        ..wire.clone()
    };
    assert_eq!(
        PreKeyBundle::from_wire(&half_opk).unwrap_err(),
        Error::InvalidMessageFormat
    );

    let short_key = PreKeyBundleWire {
        signed_prekey: bob.identity.public_key().to_base64()[..20].to_string(),
        ..wire
    };
    assert!(PreKeyBundle::from_wire(&short_key).is_err());
}

#[test]
fn test_ratchet_state_persistence() {
    let (mut alice, mut bob) = ratchet_pair();

    // Establish session
    let msg1 = alice.encrypt(&mut OsRng, b"hello", b"").unwrap();
    bob.decrypt(&mut OsRng, &msg1, b"").unwrap();

    let config = bincode::config::standard();
    let serialized = bincode::serde::encode_to_vec(&bob, config).unwrap();
    let (mut restored, _): (RatchetState, usize) =
        bincode::serde::decode_from_slice(&serialized, config).unwrap();

    // Continue ratchet
    let msg2 = alice.encrypt(&mut OsRng, b"after restore", b"").unwrap();
    assert_eq!(restored.decrypt(&mut OsRng, &msg2, b"").unwrap(), b"after restore");

    let reply = restored.encrypt(&mut OsRng, b"reply", b"").unwrap();
    assert_eq!(alice.decrypt(&mut OsRng, &reply, b"").unwrap(), b"reply");
}

#[test]
fn test_ratchet_serialization_determinism() {
    let (_alice, bob) = ratchet_pair();

    let s1 = bob.to_bytes();
    let s2 = bob.to_bytes();
    assert_eq!(s1, s2, "Serialization must be deterministic");
    assert_eq!(RatchetState::from_bytes(&s1).unwrap().to_bytes(), s1);
}
