use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::sync::atomic::AtomicBool;

use optoreg::compiler::{
    cfg::Method,
    compile::compile_method,
    config::OptoConfig,
    gcm::global_code_motion,
    test_utils::{random_method, unrolled_accumulation},
};

fn random(seed: u8, size: usize) -> Method {
    let mut rng = rand::rngs::StdRng::from_seed([seed; 32]);
    random_method(&format!("random_{seed}"), &mut |n| rng.random_range(0..n), size)
}

fn compile(m: &Method, conf: &OptoConfig) {
    let abort = AtomicBool::new(false);
    // bailouts are timed too
    let _ = black_box(compile_method(m.clone(), conf, &abort));
}

fn criterion_benchmark(c: &mut Criterion) {
    let release = OptoConfig { verify: 0, ..OptoConfig::default() };

    let mut group = c.benchmark_group("unrolled");
    for &(steps, live) in &[(16, 4), (128, 4), (512, 4), (512, 16)] {
        let m = unrolled_accumulation(steps, live);
        for float_regs in [2, 16] {
            let conf = OptoConfig { float_regs, ..release.clone() };
            group.bench_with_input(BenchmarkId::from_parameter(format!("{steps}x{live}-f{float_regs}")), &m, |bencher, m| {
                bencher.iter(|| compile(black_box(m), &conf));
            });
        }
    }
    group.finish();

    let methods: Vec<Method> = (1..=16).map(|seed| random(seed, 120)).collect();
    let mut group = c.benchmark_group("random");
    for (name, conf) in [
        ("default", release.clone()),
        ("tight", OptoConfig { int_regs: 4, float_regs: 3, ..release.clone() }),
        ("no-pressure", OptoConfig { pressure_aware_scheduling: false, ..release.clone() }),
        ("verified", OptoConfig { verify: 3, ..release.clone() }),
    ] {
        group.bench_function(name, |bencher| {
            bencher.iter(|| for m in &methods { compile(black_box(m), &conf) });
        });
    }
    group.bench_function("gcm-only", |bencher| {
        bencher.iter(|| for m in &methods {
            let mut m = m.clone();
            black_box(global_code_motion(&mut m, &release).unwrap());
        });
    });
    group.finish();
}

criterion_group!(name = benches; config = Criterion::default(); targets = criterion_benchmark);
criterion_main!(benches);
