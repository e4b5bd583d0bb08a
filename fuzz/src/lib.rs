use std::sync::atomic::AtomicBool;

use arbitrary::{Arbitrary, Unstructured};
use optoreg::compiler::{
    cfg::Method,
    compile::compile_method,
    config::OptoConfig,
    gcm::global_code_motion,
    test_utils::{assert_register_map_covers, is_expected_bailout, random_method},
};

/// Allocator knobs worth varying. Register counts stay above the point where every
/// method bails out.
#[derive(Arbitrary, Debug, Clone, Copy)]
pub struct FuzzConfig {
    pub int_regs: u8,
    pub float_regs: u8,
    pub allow_cisc_spill: bool,
    pub pressure_aware_scheduling: bool,
    pub coalesce: bool,
}

impl FuzzConfig {
    pub fn to_config(self) -> OptoConfig {
        OptoConfig {
            int_regs: 3 + self.int_regs % 14,
            float_regs: 2 + self.float_regs % 15,
            allow_cisc_spill: self.allow_cisc_spill,
            pressure_aware_scheduling: self.pressure_aware_scheduling,
            coalesce: self.coalesce,
            verify: 3,
            ..OptoConfig::default()
        }
    }
}

/// Builds a method whose every shape decision is drawn from `u`. Running out of data
/// just picks the first alternative from then on.
pub fn method_from(u: &mut Unstructured, size: usize) -> Method {
    random_method("fuzz", &mut |n| if n <= 1 { 0 } else { u.int_in_range(0..=n - 1).unwrap_or(0) }, size)
}

/// Compiles `m` with full verification. The allocator may give up on a method, but never
/// produce a wrong allocation or fail in any other way.
pub fn verify_repro(m: Method, conf: &OptoConfig) {
    let mut scheduled = m.clone();
    match global_code_motion(&mut scheduled, conf) {
        Ok((tracker, _)) => tracker.verify(&scheduled.graph, &scheduled.cfg).unwrap_or_else(|e| panic!("{e}\n{scheduled}")),
        Err(e) => panic!("code motion failed: {e}\n{m}"),
    }

    match compile_method(m, conf, &AtomicBool::new(false)) {
        Ok(code) => {
            assert_register_map_covers(&code.method);
            for n in code.method.scheduled_nodes() {
                code.reg(n).unwrap_or_else(|e| panic!("{e}\n{code}"));
            }
        }
        Err(e) => assert!(is_expected_bailout(&e), "{e}"),
    }
}

/// Replays raw fuzzer input: a config followed by the method's shape decisions.
pub fn verify_bytes(data: &[u8]) {
    let mut u = Unstructured::new(data);
    let Ok(fc) = FuzzConfig::arbitrary(&mut u) else { return };
    let size = u.int_in_range(1..=80usize).unwrap_or(1);
    let m = method_from(&mut u, size);
    verify_repro(m, &fc.to_config());
}
