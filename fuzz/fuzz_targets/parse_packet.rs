#![no_main]

use libfuzzer_sys::fuzz_target;
use tds_wire::{PACKET_HEADER_SIZE, PacketHeader, Validation};

fuzz_target!(|data: &[u8]| {
    for validation in [Validation::Lenient, Validation::Strict] {
        match PacketHeader::try_parse(data, validation) {
            Ok(Some(header)) => {
                assert!(data.len() >= PACKET_HEADER_SIZE);
                assert_eq!(
                    header.payload_length() + PACKET_HEADER_SIZE,
                    usize::from(header.length)
                );
            }
            Ok(None) => assert!(data.len() < PACKET_HEADER_SIZE),
            Err(_) => {}
        }
    }
});
