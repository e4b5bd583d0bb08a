#![no_main]

use libfuzzer_sys::fuzz_target;
use optoreg::compiler::config::OptoConfig;
use optoreg_fuzz::verify_repro;

fuzz_target!(|text: &str| {
    // anything that parses must either compile or bail out cleanly
    if let Ok(m) = optoreg::parser::parse_method(text) {
        verify_repro(m, &OptoConfig { verify: 3, ..OptoConfig::default() });
    }
});
