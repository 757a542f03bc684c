//! Fuzz target for the message AEAD with corrupted inputs
//!
//! Ensures decryption failures don't cause panics

#![no_main]

use libfuzzer_sys::fuzz_target;
use rand_core::OsRng;
use trill_protocol::crypto::{aead_decrypt, aead_encrypt, MessageKey, MESSAGE_KEY_SIZE};

fuzz_target!(|data: &[u8]| {
    if data.len() < MESSAGE_KEY_SIZE + 1 {
        return;
    }

    let key = MessageKey::from_bytes(data[..MESSAGE_KEY_SIZE].try_into().unwrap());
    let plaintext = &data[MESSAGE_KEY_SIZE..];

    // Arbitrary bytes as a ciphertext blob
    let _ = aead_decrypt(&key, plaintext, b"");

    let blob = aead_encrypt(&mut OsRng, &key, plaintext, b"ad").expect("encryption should succeed");
    let decrypted = aead_decrypt(&key, &blob, b"ad").expect("decryption should succeed");
    assert_eq!(decrypted, plaintext);

    let mut corrupted = blob.clone();
    let index = usize::from(plaintext[0]) % corrupted.len();
    corrupted[index] ^= 1;
    assert!(aead_decrypt(&key, &corrupted, b"ad").is_err());

    assert!(aead_decrypt(&key, &blob, b"wrong").is_err());
});
