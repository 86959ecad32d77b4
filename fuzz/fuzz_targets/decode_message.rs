#![no_main]

use libfuzzer_sys::fuzz_target;

use loam_core::sync::protocol::{decode_client_message, decode_server_message, encode};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(message) = decode_client_message(raw) {
        let encoded = encode(&message).expect("decoded messages encode");
        decode_client_message(&encoded).expect("encoded messages decode");
    }
    if let Ok(message) = decode_server_message(raw) {
        let encoded = encode(&message).expect("decoded messages encode");
        decode_server_message(&encoded).expect("encoded messages decode");
    }
});
