use std::sync::atomic::AtomicBool;

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::compiler::{
    analyzer::compute_liveness,
    cfg::{Method, MethodBuilder},
    compile::{compile_method, CompileBroker, CompileOutcome, Tier},
    config::OptoConfig,
    error::CompileError,
    gcm::{global_code_motion, reschedule},
    ops::{Opcode, RegClass},
    test_utils::{assert_register_map_covers, counted_loop, diamond, is_expected_bailout, random_method, unrolled_accumulation},
    verify::verify_registers,
};

fn seeded(seed: u64, size: usize) -> Method {
    let mut seed_bytes = [0u8; 32];
    seed_bytes[..8].copy_from_slice(&seed.to_le_bytes());
    let mut rng = StdRng::from_seed(seed_bytes);
    random_method(&format!("random_{seed}"), &mut |n| rng.random_range(0..n), size)
}

fn no_abort() -> AtomicBool {
    AtomicBool::new(false)
}

#[test]
fn unrolled_512_accumulations_with_two_float_registers() {
    let conf = OptoConfig { float_regs: 2, ..OptoConfig::default() };
    let m = unrolled_accumulation(512, 4);
    let nodes_before = m.graph.len();
    let code = compile_method(m, &conf, &no_abort()).unwrap();
    println!("{}", code.regalloc);

    assert!(code.regalloc.cisc_conversions >= 128, "{}", code.regalloc);
    assert!(code.method.graph.len() > nodes_before);
    assert_register_map_covers(&code.method);
    for n in code.method.scheduled_nodes() {
        code.reg(n).unwrap();
    }
}

#[test]
fn any_density_of_cisc_candidates_keeps_the_map_indexable() {
    for steps in [0, 1, 7, 64, 300] {
        for live in 1..=4 {
            for allow_cisc_spill in [true, false] {
                let conf = OptoConfig { float_regs: 2, allow_cisc_spill, ..OptoConfig::default() };
                let code = compile_method(unrolled_accumulation(steps, live), &conf, &no_abort())
                    .unwrap_or_else(|e| panic!("{steps}x{live} cisc={allow_cisc_spill}: {e}"));
                assert_register_map_covers(&code.method);
                if !allow_cisc_spill {
                    assert_eq!(code.regalloc.cisc_conversions, 0);
                    assert!(code.method.graph.live_nodes().all(|n| n.mem_operand.is_none()));
                }
            }
        }
    }
}

#[test]
fn pressure_stays_exact_through_every_move() {
    let conf = OptoConfig { verify: 3, int_regs: 4, float_regs: 3, ..OptoConfig::default() };
    for seed in 0..40 {
        let mut m = seeded(seed, 60);
        let (tracker, _) = global_code_motion(&mut m, &conf).unwrap_or_else(|e| panic!("seed {seed}: {e}\n{m}"));
        tracker.verify(&m.graph, &m.cfg).unwrap();
        assert_eq!(tracker.liveness(), &compute_liveness(&m.graph, &m.cfg).unwrap(), "seed {seed}");
    }
}

#[test]
fn pressure_stays_exact_without_pressure_awareness() {
    let conf = OptoConfig { verify: 3, pressure_aware_scheduling: false, ..OptoConfig::default() };
    for seed in 100..120 {
        let mut m = seeded(seed, 60);
        let (tracker, _) = global_code_motion(&mut m, &conf).unwrap();
        tracker.verify(&m.graph, &m.cfg).unwrap();
    }
}

#[test]
fn random_methods_color_without_conflicts() {
    let conf = OptoConfig { verify: 2, ..OptoConfig::default() };
    for seed in 0..200 {
        let code = compile_method(seeded(seed, 50), &conf, &no_abort())
            .unwrap_or_else(|e| panic!("seed {seed}: {e}"));
        assert_register_map_covers(&code.method);
    }
}

#[test]
fn release_defaults_install_only_valid_code() {
    let broker = CompileBroker::new(OptoConfig { verify: 0, ..OptoConfig::default() });
    for seed in 0..60 {
        let outcome = broker.compile(seeded(seed, 50), &no_abort()).unwrap();
        let CompileOutcome::Installed(code) = &outcome else { panic!("seed {seed}: {outcome:?}") };
        verify_registers(&code.method).unwrap_or_else(|e| panic!("seed {seed}: {e}\n{code}"));
    }
}

/// counted loop whose float phi comes back around the loop through `copy(copy(phi))`
fn copied_back_edge() -> Method {
    let mut b = MethodBuilder::new("copied_back_edge");
    let base = b.param(RegClass::Int);
    let n = b.param(RegClass::Int);
    let x = b.load(RegClass::Float, base);
    let one = b.con_i(1);
    let head = b.new_block("head", 10.0);
    let body = b.new_block("body", 9.0);
    let exit = b.new_block("exit", 1.0);
    b.goto(head);

    b.switch_to_block(head);
    let i = b.phi(RegClass::Int, &[n, n]);
    let f = b.phi(RegClass::Float, &[x, x]);
    let more = b.push(Opcode::CmpI, &[i, one]);
    b.branch(more, body, exit);

    b.switch_to_block(body);
    let c1 = b.copy(RegClass::Float, f);
    let c2 = b.copy(RegClass::Float, c1);
    let next = b.push(Opcode::SubI, &[i, one]);
    b.goto(head);
    b.set_inputs(i, &[n, next]);
    b.set_inputs(f, &[x, c2]);

    b.switch_to_block(exit);
    b.store(RegClass::Float, base, f);
    b.ret(Some(i));
    b.finish().unwrap()
}

#[test]
fn phi_fed_by_its_own_copies_keeps_a_live_back_edge_input() {
    for verify in [1, 0] {
        let conf = OptoConfig { verify, ..OptoConfig::default() };
        let code = compile_method(copied_back_edge(), &conf, &no_abort()).unwrap();
        println!("{code}");
        assert!(code.peephole.removed_copies >= 3, "{:?}", code.peephole);
        verify_registers(&code.method).unwrap();
        let g = &code.method.graph;
        for node in g.live_nodes() {
            assert!(node.inputs.iter().all(|&i| !g.node(i).dead), "{node} reads a removed node");
        }
        let phi = g.live_nodes().find(|n| n.is_phi() && n.class == Some(RegClass::Float)).unwrap();
        assert_eq!(code.reg(phi.inputs[1]).unwrap(), code.reg(phi.id).unwrap());
    }
}

#[test]
fn random_methods_under_heavy_pressure() {
    for (int_regs, float_regs) in [(4, 3), (3, 2)] {
        let conf = OptoConfig { verify: 2, int_regs, float_regs, ..OptoConfig::default() };
        for seed in 200..240 {
            match compile_method(seeded(seed, 40), &conf, &no_abort()) {
                Ok(code) => {
                    assert_register_map_covers(&code.method);
                    assert!(code.method.graph.live_nodes()
                        .filter_map(|n| match (n.class, code.reg(n.id)) {
                            (Some(_), Ok(crate::compiler::arena::OptoReg::Reg(class, r))) => Some((class, r)),
                            _ => None,
                        })
                        .all(|(class, r)| (r as u32) < conf.reg_limit(class)));
                }
                Err(e) => assert!(is_expected_bailout(&e), "seed {seed} {int_regs}/{float_regs}: {e}"),
            }
        }
    }
}

#[test]
fn rescheduling_a_legal_schedule_is_idempotent() {
    let conf = OptoConfig::default();
    let mut checked = 0;
    for seed in 0..40 {
        let mut m = seeded(seed, 60);
        let (mut tracker, _) = global_code_motion(&mut m, &conf).unwrap();
        if tracker.violations().next().is_some() {
            continue;
        }
        let before = m.schedule_snapshot();
        assert_eq!(reschedule(&mut m, &mut tracker, &conf).unwrap(), 0, "seed {seed}");
        assert_eq!(m.schedule_snapshot(), before, "seed {seed}");
        checked += 1;
    }
    assert!(checked > 0);
}

#[test]
fn loop_invariant_is_hoisted_out_of_the_compiled_loop() {
    let code = compile_method(counted_loop(), &OptoConfig::default(), &no_abort()).unwrap();
    let mul = code.method.graph.live_nodes().find(|n| n.op == Opcode::MulF).unwrap();
    assert_eq!(code.method.cfg.block(mul.block).loop_depth, 0);
    assert!(code.gcm.hoisted >= 1);
    assert_eq!(code.regalloc.spilled_lrgs, 0);
}

#[test]
fn listing_shows_registers_and_slots() {
    let conf = OptoConfig { float_regs: 2, ..OptoConfig::default() };
    let code = compile_method(unrolled_accumulation(16, 4), &conf, &no_abort()).unwrap();
    let listing = code.to_string();
    println!("{listing}");
    assert!(listing.contains("xmm0"));
    assert!(listing.contains("ss0"));
    assert!(code.frame_bytes % 16 == 0 && code.frame_bytes >= 8 * code.regalloc.frame_slots);
}

#[test]
fn broker_installs_successful_compiles() {
    let broker = CompileBroker::new(OptoConfig::default());
    let outcome = broker.compile(diamond(), &no_abort()).unwrap();
    let CompileOutcome::Installed(code) = &outcome else { panic!("{outcome:?}") };
    assert_eq!(outcome.tier(), Tier::Optimized);
    let cached = broker.cache().lookup("diamond").unwrap();
    assert!(std::sync::Arc::ptr_eq(code, &cached));
}

#[test]
fn failed_compile_falls_back_to_the_interpreter() {
    let broker = CompileBroker::new(OptoConfig { float_regs: 0, ..OptoConfig::default() });
    let outcome = broker.compile(diamond(), &no_abort()).unwrap();
    match outcome {
        CompileOutcome::Bailout { method, reason, tier } => {
            assert_eq!(method, "diamond");
            assert_eq!(tier, Tier::Interpreter);
            assert!(matches!(reason, CompileError::Uncolorable { class: RegClass::Float, .. }), "{reason}");
        }
        other => panic!("{other:?}"),
    }
    assert!(broker.cache().is_empty());
}

#[test]
fn errors_reach_the_caller_without_deopt() {
    let broker = CompileBroker::new(OptoConfig { float_regs: 0, error_as_deopt: false, ..OptoConfig::default() });
    let err = broker.compile(diamond(), &no_abort()).unwrap_err();
    assert!(matches!(err, CompileError::Uncolorable { .. }));
    assert!(broker.cache().lookup("diamond").is_none());
}

#[test]
fn aborted_compile_publishes_nothing() {
    let broker = CompileBroker::new(OptoConfig::default());
    let abort = AtomicBool::new(true);
    let outcome = broker.compile(counted_loop(), &abort).unwrap();
    assert!(matches!(outcome, CompileOutcome::Bailout { reason: CompileError::Aborted, .. }));
    assert!(broker.cache().is_empty());
}

#[test]
fn unrelated_methods_compile_in_parallel() {
    let broker = CompileBroker::new(OptoConfig { float_regs: 3, ..OptoConfig::default() });
    std::thread::scope(|s| {
        for seed in 0..8u64 {
            let broker = &broker;
            s.spawn(move || {
                let m = if seed % 2 == 0 { seeded(seed, 40) } else { unrolled_accumulation(32 * seed as usize, 3) };
                broker.compile(m, &no_abort()).unwrap()
            });
        }
    });
    let cache = broker.cache();
    assert!(cache.len() <= 8);
    for seed in [1u64, 3, 5, 7] {
        let name = format!("unrolled_{}x3", 32 * seed);
        assert!(cache.lookup(&name).is_some(), "{name}");
    }
}
