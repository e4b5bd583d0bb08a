use std::{
    collections::BTreeSet,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use smallvec::SmallVec;

use crate::compiler::{
    analyzer::compute_liveness,
    arena::OptoReg,
    cfg::Method,
    config::OptoConfig,
    error::CompileError,
    ifg::{InterferenceGraph, LiveRanges, LrgId},
    ops::{BlockId, NodeId, Opcode, RegClass},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegAllocStats {
    pub rounds: u32,
    pub spilled_lrgs: usize,
    pub spill_stores: usize,
    pub reloads: usize,
    pub cisc_conversions: usize,
    pub coalesced: usize,
    pub copies_inserted: usize,
    pub frame_slots: u32,
}

impl fmt::Display for RegAllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rounds, {} spilled live ranges ({} stores, {} reloads, {} CISC), {} coalesced, {} phi copies, {} frame slots",
            self.rounds, self.spilled_lrgs, self.spill_stores, self.reloads, self.cisc_conversions,
            self.coalesced, self.copies_inserted, self.frame_slots)
    }
}

/// Result of a successful allocation: the final round's live ranges and their colors.
#[derive(Debug, Clone)]
pub struct AllocationReport {
    pub lrgs: LiveRanges,
    pub ifg: InterferenceGraph,
    pub colors: Vec<Option<u8>>,
    pub stats: RegAllocStats,
}

impl AllocationReport {
    /// Pairs of interfering live ranges that share a color. Empty for every valid allocation.
    pub fn coloring_conflicts(&self) -> Vec<(LrgId, LrgId)> {
        let mut conflicts = Vec::new();
        for lr in self.lrgs.active() {
            let Some(c) = self.colors[lr.id.ix()] else { continue };
            for nb in self.ifg.neighbors(lr.id) {
                if lr.id < nb && self.colors[nb.ix()] == Some(c) {
                    conflicts.push((lr.id, nb));
                }
            }
        }
        conflicts.sort_unstable();
        conflicts
    }
}

/// Chaitin/Briggs allocator with spilling. Runs rounds of
/// liveness → live ranges → interference → coalesce → simplify/select
/// until everything is colored, inserting spill code after each failed round.
pub struct PhaseChaitin<'a> {
    pub(crate) conf: &'a OptoConfig,
    abort: &'a AtomicBool,
    /// defs already spilled once; their new, short ranges are never spilled again
    pub(crate) spilled_defs: HashSet<NodeId>,
    /// nodes replaced by their memory-operand version
    pub(crate) replaced: HashMap<NodeId, NodeId>,
    pub(crate) next_slot: u32,
    pub(crate) stats: RegAllocStats,
}

impl<'a> PhaseChaitin<'a> {
    pub fn new(conf: &'a OptoConfig, abort: &'a AtomicBool) -> Self {
        PhaseChaitin {
            conf,
            abort,
            spilled_defs: HashSet::default(),
            replaced: HashMap::default(),
            next_slot: 0,
            stats: RegAllocStats::default(),
        }
    }

    pub fn allocate(mut self, m: &mut Method) -> Result<AllocationReport, CompileError> {
        self.insert_phi_copies(m);

        loop {
            if self.abort.load(Ordering::Relaxed) {
                return Err(CompileError::Aborted);
            }
            if self.stats.rounds >= self.conf.max_spill_rounds {
                return Err(CompileError::SpillNonConvergence { rounds: self.stats.rounds });
            }
            self.stats.rounds += 1;

            let live = compute_liveness(&m.graph, &m.cfg)?;
            let mut lrgs = LiveRanges::build(&m.graph, &m.cfg, &self.spilled_defs);
            let mut ifg = InterferenceGraph::build(&m.graph, &m.cfg, &live, &lrgs);
            if self.conf.coalesce {
                self.coalesce(m, &mut lrgs, &mut ifg);
            }
            if self.conf.should_log(8) {
                log::debug!("{}: round {}: {} live ranges, {} interference edges", m.name, self.stats.rounds, lrgs.len(), ifg.edge_count());
                for lr in lrgs.active() {
                    log::trace!("  {lr} degree {}", ifg.degree(lr.id));
                }
            }

            let (colors, failed) = self.simplify_select(&lrgs, &ifg);
            if failed.is_empty() {
                self.assign_registers(m, &lrgs, &colors)?;
                self.stats.frame_slots = self.next_slot;
                return Ok(AllocationReport { lrgs, ifg, colors, stats: self.stats });
            }

            let to_spill: Vec<LrgId> = failed.iter().copied().filter(|&l| lrgs.get(l).spillable).collect();
            if to_spill.is_empty() {
                let lr = lrgs.get(failed[0]);
                return Err(CompileError::Uncolorable { node: lr.members[0], class: lr.class });
            }
            log::debug!("{}: round {}: spilling {} of {} live ranges", m.name, self.stats.rounds, to_spill.len(), lrgs.len());
            for l in to_spill {
                self.spill_live_range(m, lrgs.get(l))?;
            }
        }
    }

    /// Replaces every phi input by a copy at the end of the matching predecessor. Inputs that
    /// are phis of the same block are first copied into temporaries, so that all of them are
    /// read before any phi copy is written.
    fn insert_phi_copies(&mut self, m: &mut Method) {
        for b in m.cfg.block_ids().collect::<Vec<_>>() {
            let phis: Vec<NodeId> = m.cfg.block(b).phis(&m.graph).collect();
            if phis.is_empty() {
                continue;
            }
            let preds: SmallVec<[BlockId; 2]> = m.cfg.block(b).preds.clone();
            for (i, &pred) in preds.iter().enumerate() {
                let mut temps = Vec::new();
                let mut copies = Vec::new();
                for &phi in &phis {
                    let class = m.graph.class_of(phi);
                    let input = m.graph.node(phi).inputs[i];
                    let input_node = m.graph.node(input);
                    let src = if input_node.is_phi() && input_node.block == b {
                        let tmp = m.graph.add_node(Opcode::Copy, &[input], class, Some(pred));
                        temps.push(tmp);
                        tmp
                    } else {
                        input
                    };
                    let copy = m.graph.add_node(Opcode::Copy, &[src], class, Some(pred));
                    copies.push(copy);
                    m.graph.node_mut(phi).inputs[i] = copy;
                }
                self.stats.copies_inserted += temps.len() + copies.len();
                for n in temps.into_iter().chain(copies) {
                    m.cfg.block_mut(pred).insert_before_terminator(&m.graph, n);
                }
            }
        }
    }

    /// Conservative (Briggs) coalescing of copy-related live ranges.
    fn coalesce(&mut self, m: &Method, lrgs: &mut LiveRanges, ifg: &mut InterferenceGraph) {
        for b in &m.cfg.blocks {
            for &n in &b.nodes {
                let node = m.graph.node(n);
                if !node.is_copy() {
                    continue;
                }
                let (Some(a), Some(s)) = (lrgs.lrg(n), lrgs.lrg(node.inputs[0])) else { continue };
                if a == s || ifg.interferes(a, s) {
                    continue;
                }
                let (ra, rs) = (lrgs.get(a), lrgs.get(s));
                if ra.class != rs.class || !ra.spillable || !rs.spillable {
                    continue;
                }
                let k = self.conf.reg_limit(ra.class) as usize;
                let neighbors: HashSet<LrgId> = ifg.neighbors(a).chain(ifg.neighbors(s)).collect();
                let significant = neighbors.iter()
                    .filter(|&&x| {
                        let shared = ifg.interferes(x, a) && ifg.interferes(x, s);
                        ifg.degree(x) - usize::from(shared) >= k
                    })
                    .count();
                if significant >= k {
                    continue;
                }
                let (keep, gone) = (a.min(s), a.max(s));
                ifg.merge(keep, gone);
                lrgs.merge(keep, gone);
                self.stats.coalesced += 1;
            }
        }
    }

    /// Simplify with optimistic select, per register class. Returns the colors and the
    /// ranges that found no free register.
    fn simplify_select(&self, lrgs: &LiveRanges, ifg: &InterferenceGraph) -> (Vec<Option<u8>>, Vec<LrgId>) {
        let mut colors = vec![None; lrgs.len()];
        let mut failed = Vec::new();

        for class in RegClass::ALL {
            let k = self.conf.reg_limit(class) as usize;
            let mut degree: HashMap<LrgId, usize> = lrgs.active()
                .filter(|r| r.class == class)
                .map(|r| (r.id, ifg.degree(r.id)))
                .collect();
            let mut low: BTreeSet<LrgId> = degree.iter().filter(|&(_, &d)| d < k).map(|(&l, _)| l).collect();
            let mut high: BTreeSet<LrgId> = degree.iter().filter(|&(_, &d)| d >= k).map(|(&l, _)| l).collect();
            let mut stack = Vec::with_capacity(degree.len());

            loop {
                let next = if let Some(l) = low.pop_first() {
                    l
                } else if let Some(l) = Self::spill_candidate(lrgs, &high, &degree) {
                    high.remove(&l);
                    l
                } else {
                    break;
                };
                stack.push(next);
                degree.remove(&next);
                for nb in ifg.neighbors(next) {
                    if let Some(d) = degree.get_mut(&nb) {
                        *d -= 1;
                        if *d < k && high.remove(&nb) {
                            low.insert(nb);
                        }
                    }
                }
            }

            let mut used = vec![false; k];
            while let Some(l) = stack.pop() {
                used.fill(false);
                for nb in ifg.neighbors(l) {
                    if let Some(c) = colors[nb.ix()] {
                        used[c as usize] = true;
                    }
                }
                match used.iter().position(|&u| !u) {
                    Some(c) => colors[l.ix()] = Some(c as u8),
                    None => failed.push(l),
                }
            }
        }
        failed.sort_unstable();
        (colors, failed)
    }

    /// Lowest cost/degree ratio, ties to the lowest id.
    fn spill_candidate(lrgs: &LiveRanges, high: &BTreeSet<LrgId>, degree: &HashMap<LrgId, usize>) -> Option<LrgId> {
        let mut best: Option<(f64, LrgId)> = None;
        for &l in high {
            let ratio = lrgs.get(l).spill_ratio(degree.get(&l).copied().unwrap_or(0));
            if best.map_or(true, |(r, _)| ratio < r) {
                best = Some((ratio, l));
            }
        }
        best.map(|(_, l)| l)
    }

    fn assign_registers(&self, m: &mut Method, lrgs: &LiveRanges, colors: &[Option<u8>]) -> Result<(), CompileError> {
        m.graph.clear_regs();
        for lr in lrgs.active() {
            let Some(c) = colors[lr.id.ix()] else { continue };
            for &n in &lr.members {
                m.graph.set_reg(n, OptoReg::Reg(lr.class, c))?;
            }
        }
        let stores: Vec<(NodeId, OptoReg)> = m.scheduled_nodes()
            .filter_map(|n| match m.graph.node(n).op {
                Opcode::SpillStore(slot) => Some((n, OptoReg::Stack(slot))),
                _ => None,
            })
            .collect();
        for (n, reg) in stores {
            m.graph.set_reg(n, reg)?;
        }
        Ok(())
    }
}
