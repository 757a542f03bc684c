//! Fuzz target for Double Ratchet message parsing
//!
//! Tests that arbitrary message data doesn't cause panics

#![no_main]

use libfuzzer_sys::fuzz_target;
use trill_protocol::double_ratchet::Message;
use trill_protocol::network::WireContent;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::from_bytes(data) {
        assert_eq!(message.to_bytes(), data);

        let content = WireContent::new(message.clone(), None);
        assert_eq!(content.to_message().expect("header roundtrip"), message);
    }
});
