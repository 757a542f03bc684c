#![no_main]

use libfuzzer_sys::fuzz_target;
use trill_protocol::crypto::SIGNATURE_SIZE;
use trill_protocol::keys::PublicKey;
use trill_protocol::network::PreKeyBundleWire;
use trill_protocol::x3dh::PreKeyBundle;

fuzz_target!(|data: &[u8]| {
    // Arbitrary text in every base64 field must be rejected cleanly
    let text = String::from_utf8_lossy(data);
    let mut fields = text.split('|');
    let wire = PreKeyBundleWire {
        identity_key: fields.next().unwrap_or_default().to_string(),
        signed_prekey_id: 1,
        signed_prekey: fields.next().unwrap_or_default().to_string(),
        signature: fields.next().unwrap_or_default().to_string(),
        one_time_prekey_id: fields.next().map(|_| 2),
        one_time_prekey: fields.next().map(str::to_string),
    };
    if let Ok(bundle) = PreKeyBundle::from_wire(&wire) {
        let _ = bundle.verify_signature();
    }

    // Bundle structure: identity_key (32) || signed_prekey (32) || signature (64)
    // Optional: opk_id (4) || one_time_prekey (32)
    if data.len() >= 32 + 32 + SIGNATURE_SIZE {
        let identity_key = PublicKey::from_slice(&data[0..32]).unwrap();
        let signed_prekey = PublicKey::from_slice(&data[32..64]).unwrap();
        let signature = data[64..64 + SIGNATURE_SIZE].try_into().unwrap();

        let rest = &data[64 + SIGNATURE_SIZE..];
        let one_time_prekey = if rest.len() >= 4 + 32 {
            let opk_id = u32::from_be_bytes(rest[..4].try_into().unwrap());
            Some((opk_id, PublicKey::from_slice(&rest[4..36]).unwrap()))
        } else {
            None
        };

        let bundle = PreKeyBundle {
            identity_key,
            signed_prekey_id: 1,
            signed_prekey,
            signed_prekey_signature: signature,
            one_time_prekey,
        };

        // Verification should not panic, may fail
        let _ = bundle.verify_signature();

        let roundtrip = PreKeyBundle::from_wire(&bundle.to_wire()).expect("wire roundtrip");
        assert_eq!(roundtrip, bundle);
    }
});
