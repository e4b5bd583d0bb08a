#![no_main]

use libfuzzer_sys::fuzz_target;
use optoreg_fuzz::verify_bytes;

fuzz_target!(|data: &[u8]| {
    if data.len() < 8 { return } // too short to shape anything interesting

    verify_bytes(data);
});
