#![no_main]

use libfuzzer_sys::fuzz_target;

use loam_core::oid::{Oid, oid_range};

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(oid) = Oid::parse(raw) {
        assert_eq!(oid.as_str(), raw);
        assert!(oid_range(&oid).contains(&oid));
        assert!(oid_range(&oid.root()).contains(&oid));
    }
});
