#![no_main]

use enet_bridge::core::address::Address;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Raw host buffers of any length must be accepted or rejected, never panic
    if let Ok(addr) = Address::from_raw_host(data, 7777, 0) {
        let parsed: Address = addr.to_string().parse().expect("rendered address must parse");
        assert_eq!(parsed.host(), addr.host());
    }

    // Arbitrary text through the parser
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(addr) = text.parse::<Address>() {
            let _ = addr.to_string();
        }
    }
});
