#![no_main]
use libfuzzer_sys::fuzz_target;

use reflate::recovery::{recover, RecoveryConfig};

fuzz_target!(|data: &[u8]| {
    if data.len() > 1 << 16 {
        return;
    }
    let config = RecoveryConfig {
        perform_reconstruction: false,
        ..RecoveryConfig::default()
    };
    let _ = recover(data, 0, data.len() * 8, false, true, None, None, &config);
});
