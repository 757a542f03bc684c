#![no_main]

use libfuzzer_sys::fuzz_target;
use trill_protocol::crypto::{verify, SIGNATURE_SIZE};
use trill_protocol::keys::PublicKey;

fuzz_target!(|data: &[u8]| {
    // Verify arbitrary signatures under arbitrary public keys
    if data.len() >= 32 + SIGNATURE_SIZE {
        let public = PublicKey::from_slice(&data[..32]).unwrap();
        let signature: [u8; SIGNATURE_SIZE] = data[32..32 + SIGNATURE_SIZE].try_into().unwrap();
        let message = &data[32 + SIGNATURE_SIZE..];

        // Should not panic, will almost always fail
        let _ = verify(&public, message, &signature);
    }
});
