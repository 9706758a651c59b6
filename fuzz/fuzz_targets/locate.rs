#![no_main]
use libfuzzer_sys::fuzz_target;

use reflate::scanning::locator::{locate_packets, split_into_packets};

fuzz_target!(|data: &[u8]| {
    if data.len() > 1 << 14 {
        return;
    }
    let _ = locate_packets(data, 0, data.len() * 8, false);
    let _ = split_into_packets(data, 0, data.len() * 8, false);
});
