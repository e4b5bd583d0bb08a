use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use num_integer::Integer;
use rustc_hash::FxHashMap as HashMap;

use crate::compiler::{
    arena::OptoReg,
    cfg::Method,
    chaitin::{PhaseChaitin, RegAllocStats},
    config::OptoConfig,
    error::CompileError,
    gcm::{global_code_motion, GcmStats},
    ops::NodeId,
    peephole::{self, PeepholeStats},
    verify::verify_registers,
};

const SLOT_BYTES: u32 = 8;
const FRAME_ALIGN: u32 = 16;

/// Where a method keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Interpreter,
    Optimized,
}

/// Scheduled, allocated code ready for emission.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    pub method: Method,
    pub gcm: GcmStats,
    pub regalloc: RegAllocStats,
    pub peephole: PeepholeStats,
    pub frame_bytes: u32,
}

impl CompiledMethod {
    pub fn name(&self) -> &str {
        &self.method.name
    }

    pub fn reg(&self, n: NodeId) -> Result<OptoReg, CompileError> {
        self.method.graph.reg(n)
    }

    pub fn instruction_count(&self) -> usize {
        self.method.scheduled_nodes().count()
    }
}

impl fmt::Display for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.method;
        writeln!(f, "{} (frame {} bytes)", m.name, self.frame_bytes)?;
        for b in &m.cfg.blocks {
            writeln!(f, "{b}")?;
            for &n in &b.nodes {
                let node = m.graph.node(n);
                let reg = m.graph.reg(n).unwrap_or_default();
                if reg == OptoReg::Bad {
                    writeln!(f, "    {:<8} {node}", "")?;
                } else {
                    writeln!(f, "    {:<8} {node}", reg.to_string())?;
                }
            }
        }
        Ok(())
    }
}

fn check_abort(abort: &AtomicBool) -> Result<(), CompileError> {
    if abort.load(Ordering::Relaxed) {
        Err(CompileError::Aborted)
    } else {
        Ok(())
    }
}

/// Runs code motion, allocation, peephole and verification on `method`. Nothing outside
/// `method` is touched, so an error simply drops the whole compilation.
pub fn compile_method(mut method: Method, conf: &OptoConfig, abort: &AtomicBool) -> Result<CompiledMethod, CompileError> {
    check_abort(abort)?;
    let (tracker, gcm) = global_code_motion(&mut method, conf)?;
    if conf.verify >= 2 {
        tracker.verify(&method.graph, &method.cfg)?;
    }
    drop(tracker);

    check_abort(abort)?;
    let report = PhaseChaitin::new(conf, abort).allocate(&mut method)?;
    if conf.verify >= 1 {
        if let Some(&(a, b)) = report.coloring_conflicts().first() {
            let node = report.lrgs.get(a).members.first().copied().unwrap_or(NodeId(0));
            return Err(CompileError::VerificationFailed { node, reason: format!("{a} and {b} interfere but share a register") });
        }
    }

    check_abort(abort)?;
    let peephole = peephole::optimize(&mut method, conf)?;
    if conf.verify >= 1 {
        verify_registers(&method)?;
    }
    // emission reads a location for every scheduled node and for each of its inputs
    for n in method.scheduled_nodes() {
        method.graph.reg(n)?;
        if let Some(&input) = method.graph.node(n).inputs.iter().find(|&&i| method.graph.node(i).dead) {
            return Err(CompileError::VerificationFailed { node: n, reason: format!("reads removed node {input}") });
        }
    }

    let frame_bytes = Integer::div_ceil(&(report.stats.frame_slots * SLOT_BYTES), &FRAME_ALIGN) * FRAME_ALIGN;
    if conf.should_log(2) {
        log::debug!("{}: {} | {}", method.name, report.stats, gcm);
    }
    Ok(CompiledMethod { method, gcm, regalloc: report.stats, peephole, frame_bytes })
}

/// Installed code, looked up by method name. Entries are only ever replaced as a whole.
#[derive(Debug, Default)]
pub struct CodeCache {
    methods: RwLock<HashMap<String, Arc<CompiledMethod>>>,
}

impl CodeCache {
    pub fn lookup(&self, name: &str) -> Option<Arc<CompiledMethod>> {
        self.methods.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    fn install(&self, code: Arc<CompiledMethod>) {
        let mut methods = self.methods.write().unwrap_or_else(PoisonError::into_inner);
        methods.insert(code.name().to_string(), code);
    }

    pub fn len(&self) -> usize {
        self.methods.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub enum CompileOutcome {
    Installed(Arc<CompiledMethod>),
    Bailout { method: String, reason: CompileError, tier: Tier },
}

impl CompileOutcome {
    pub fn tier(&self) -> Tier {
        match self {
            CompileOutcome::Installed(_) => Tier::Optimized,
            CompileOutcome::Bailout { tier, .. } => *tier,
        }
    }
}

/// Compiles methods and publishes the ones that made it through every phase.
/// Unrelated methods may be compiled from several threads at once.
#[derive(Debug)]
pub struct CompileBroker {
    conf: OptoConfig,
    cache: Arc<CodeCache>,
}

impl CompileBroker {
    pub fn new(conf: OptoConfig) -> Self {
        CompileBroker { conf, cache: Arc::new(CodeCache::default()) }
    }

    pub fn config(&self) -> &OptoConfig {
        &self.conf
    }

    pub fn cache(&self) -> &Arc<CodeCache> {
        &self.cache
    }

    pub fn compile(&self, method: Method, abort: &AtomicBool) -> Result<CompileOutcome, CompileError> {
        let name = method.name.clone();
        match compile_method(method, &self.conf, abort) {
            Ok(code) => {
                let code = Arc::new(code);
                self.cache.install(code.clone());
                log::debug!("{name}: installed, {} instructions", code.instruction_count());
                Ok(CompileOutcome::Installed(code))
            }
            Err(reason) if self.conf.error_as_deopt => {
                if reason.is_internal() {
                    log::warn!("{name}: compilation failed, staying in the interpreter: {reason}");
                } else {
                    log::info!("{name}: compilation abandoned: {reason}");
                }
                Ok(CompileOutcome::Bailout { method: name, reason, tier: Tier::Interpreter })
            }
            Err(reason) => Err(reason),
        }
    }
}
