//! Fuzz target for message header parsing

#![no_main]

use libfuzzer_sys::fuzz_target;
use trill_protocol::double_ratchet::{Header, HEADER_SIZE};

fuzz_target!(|data: &[u8]| {
    match Header::from_bytes(data) {
        Ok(header) => {
            assert_eq!(data.len(), HEADER_SIZE);
            assert_eq!(&header.to_bytes()[..], data);
        }
        Err(_) => assert_ne!(data.len(), HEADER_SIZE),
    }
});
