#![no_main]

use libfuzzer_sys::fuzz_target;

use loam_core::clock::Timestamp;

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(ts) = Timestamp::parse(raw) {
        let again = Timestamp::parse(&ts.to_string()).expect("printed timestamps parse");
        assert_eq!(ts, again);
    }
});
