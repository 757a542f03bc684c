//! Fuzz target for persisted ratchet state decoding

#![no_main]

use libfuzzer_sys::fuzz_target;
use trill_protocol::double_ratchet::RatchetState;

fuzz_target!(|data: &[u8]| {
    if let Ok(state) = RatchetState::from_bytes(data) {
        let encoded = state.to_bytes();
        let again = RatchetState::from_bytes(&encoded).expect("re-encoded state must decode");
        assert_eq!(again.to_bytes(), encoded);
    }
});
