use clap::Parser;
use optoreg::compiler::cfg::Method;
use optoreg::compiler::compile::{CompileBroker, CompileOutcome};
use optoreg::compiler::config::{get_config, OptoConfig};
use optoreg::compiler::test_utils::{random_method, unrolled_accumulation};
use optoreg::gc::{CpuTimeGroup, GcCpuTime};
use optoreg::parser;
use rand::{Rng, SeedableRng};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Compile methods and print the register-allocated listing.
///
/// Options not given on the command line come from the OPTOREG_* environment variables.
#[derive(Parser, Debug)]
#[command()]
struct Args {
    /// Files containing methods in the text format. Use `-` for stdin.
    #[arg()]
    files: Vec<String>,
    /// Also compile `N` unrolled float accumulations over four loaded values.
    #[arg(long)]
    synthetic: Option<usize>,
    /// Also compile a generated method: `unrolled:<steps>x<live>` or `random:<seed>:<size>`.
    #[arg(long, short = 'g')]
    generate: Vec<String>,
    /// Number of integer registers.
    #[arg(long)]
    int_regs: Option<u8>,
    /// Number of float registers.
    #[arg(long)]
    float_regs: Option<u8>,
    /// Disable folding spilled operands into memory forms.
    #[arg(long)]
    no_cisc_spill: bool,
    /// Schedule by frequency only.
    #[arg(long)]
    no_pressure_aware: bool,
    /// Disable copy coalescing.
    #[arg(long)]
    no_coalesce: bool,
    /// Verification level (0-3).
    #[arg(long, short = 'v')]
    verify: Option<u8>,
    /// Report failed compilations as errors instead of falling back.
    #[arg(long)]
    no_deopt: bool,
    /// Do not print the listing.
    #[arg(long, short = 'q')]
    quiet: bool,
    /// Print statistics after compiling.
    #[arg(long, short = 's')]
    stats: bool,
}

impl Args {
    fn config(&self) -> OptoConfig {
        let mut c = get_config().clone();
        if let Some(n) = self.int_regs { c.int_regs = n; }
        if let Some(n) = self.float_regs { c.float_regs = n; }
        if let Some(v) = self.verify { c.verify = v; }
        c.allow_cisc_spill &= !self.no_cisc_spill;
        c.pressure_aware_scheduling &= !self.no_pressure_aware;
        c.coalesce &= !self.no_coalesce;
        c.error_as_deopt &= !self.no_deopt;
        c
    }
}

fn read_method(file: &str) -> Result<Method, anyhow::Error> {
    let text = if file == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(file)?
    };
    parser::parse_method(&text).map_err(|e| anyhow::anyhow!("{file}: {e}"))
}

fn generated_method(generator: &str) -> Result<Method, anyhow::Error> {
    let parts: Vec<&str> = generator.split(':').collect();
    match parts[..] {
        ["unrolled", shape] => {
            let (steps, live) = shape.split_once('x').ok_or_else(|| anyhow::anyhow!("expected <steps>x<live>, got `{shape}`"))?;
            let live: usize = live.parse()?;
            anyhow::ensure!(live > 0, "live must be positive");
            Ok(unrolled_accumulation(steps.parse()?, live))
        }
        ["random", seed, size] => {
            let seed: u64 = seed.parse()?;
            let mut seed_bytes = [0u8; 32];
            seed_bytes[..8].copy_from_slice(&seed.to_le_bytes());
            let mut rng = rand::rngs::StdRng::from_seed(seed_bytes);
            Ok(random_method(&format!("random_{seed}"), &mut |n| rng.random_range(0..n), size.parse()?))
        }
        _ => anyhow::bail!("unknown generator `{generator}`"),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let conf = args.config();
    log::debug!("{conf:?}");

    let mut methods = Vec::new();
    for f in &args.files {
        methods.push(read_method(f)?);
    }
    if let Some(n) = args.synthetic {
        methods.push(unrolled_accumulation(n, 4));
    }
    for g in &args.generate {
        methods.push(generated_method(g)?);
    }
    anyhow::ensure!(!methods.is_empty(), "nothing to compile, pass a file, --synthetic or --generate");

    let cpu_time = GcCpuTime::new(&conf);
    let broker = CompileBroker::new(conf);
    let abort = AtomicBool::new(false);
    let mut bailouts = 0;
    let start_time = std::time::Instant::now();
    for m in methods {
        let outcome = cpu_time.measure(CpuTimeGroup::Service, || broker.compile(m, &abort))?;
        match outcome {
            CompileOutcome::Installed(code) => {
                if !args.quiet {
                    println!("{code}");
                }
                if args.stats {
                    eprintln!("{}: {} instructions, {} byte frame", code.name(), code.instruction_count(), code.frame_bytes);
                    eprintln!("  code motion: {}", code.gcm);
                    eprintln!("  allocation: {}", code.regalloc);
                    eprintln!("  peephole: {} copies removed, {} reloads forwarded, {} reloads folded",
                        code.peephole.removed_copies, code.peephole.forwarded_reloads, code.peephole.folded_reloads);
                }
            }
            CompileOutcome::Bailout { method, reason, tier } => {
                bailouts += 1;
                eprintln!("{method}: {reason}, running in {tier:?}");
            }
        }
    }
    let elapsed = start_time.elapsed();

    if args.stats {
        print_stats(broker.cache().len(), bailouts, elapsed, cpu_time.publish_total());
    }
    Ok(())
}

fn print_stats(installed: usize, bailouts: usize, elapsed: Duration, cpu_nanos: i64) {
    eprintln!("Compile time: {:?}", elapsed);
    eprintln!("Installed: {}, bailed out: {}", installed, bailouts);
    eprintln!(
        "CPU time: {}",
        match cpu_nanos {
            n if n < 0 => "unavailable".to_string(),
            n if n >= 1_000_000 => format!("{:.1}ms", n as f64 / 1_000_000.0),
            n if n >= 1_000 => format!("{:.1}us", n as f64 / 1_000.0),
            n => format!("{}ns", n),
        }
    );
}
