use std::collections::BTreeSet;

use rustc_hash::FxHashSet as HashSet;
use smallvec::SmallVec;

use crate::compiler::{
    analyzer::{compute_liveness, Liveness},
    arena::MachGraph,
    cfg::Cfg,
    error::CompileError,
    lcm,
    ops::{BlockId, NodeId, RegClass},
};

/// Maximum number of simultaneously live values per register class in one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PressureRecord {
    pub max: [u32; RegClass::COUNT],
}

impl PressureRecord {
    pub fn get(&self, class: RegClass) -> u32 {
        self.max[class.ix()]
    }

    pub fn exceeds(&self, class: RegClass, limits: [u32; RegClass::COUNT]) -> bool {
        self.max[class.ix()] > limits[class.ix()]
    }
}

/// Pressure of an ordered block, walking backwards from `live_out`.
pub fn block_pressure(g: &MachGraph, nodes: &[NodeId], live_out: &HashSet<NodeId>) -> PressureRecord {
    let mut live: HashSet<NodeId> = live_out.clone();
    let mut cur = [0u32; RegClass::COUNT];
    for &v in &live {
        if let Some(c) = g.class_of(v) {
            cur[c.ix()] += 1;
        }
    }
    let mut max = cur;

    for &n in nodes.iter().rev() {
        let node = g.node(n);
        if node.is_phi() {
            continue;
        }
        if let Some(c) = node.class {
            if live.remove(&n) {
                cur[c.ix()] -= 1;
            } else {
                // an unused def still needs a register at its own program point
                max[c.ix()] = max[c.ix()].max(cur[c.ix()] + 1);
            }
        }
        for (_, input) in node.register_inputs() {
            if let Some(c) = g.class_of(input) {
                if live.insert(input) {
                    cur[c.ix()] += 1;
                }
            }
        }
        for c in 0..RegClass::COUNT {
            max[c] = max[c].max(cur[c]);
        }
    }

    for &n in nodes {
        let node = g.node(n);
        if node.is_phi() && !live.contains(&n) {
            if let Some(c) = node.class {
                cur[c.ix()] += 1;
            }
        }
    }
    for c in 0..RegClass::COUNT {
        max[c] = max[c].max(cur[c]);
    }
    PressureRecord { max }
}

/// Per-block pressure kept in step with block membership. Every membership change must be
/// reported, a single moved node through [`PressureTracker::node_moved`] and anything else
/// through [`PressureTracker::membership_changed`]. Both re-order the affected blocks.
#[derive(Debug, Clone)]
pub struct PressureTracker {
    records: Vec<PressureRecord>,
    liveness: Liveness,
    limits: [u32; RegClass::COUNT],
    pressure_aware: bool,
}

impl PressureTracker {
    pub fn build(g: &MachGraph, cfg: &mut Cfg, limits: [u32; RegClass::COUNT], pressure_aware: bool) -> Result<Self, CompileError> {
        let liveness = compute_liveness(g, cfg)?;
        let mut t = PressureTracker {
            records: vec![PressureRecord::default(); cfg.len()],
            liveness,
            limits,
            pressure_aware,
        };
        for b in cfg.block_ids() {
            t.refresh(g, cfg, b)?;
        }
        Ok(t)
    }

    fn refresh(&mut self, g: &MachGraph, cfg: &mut Cfg, b: BlockId) -> Result<(), CompileError> {
        let live_out = self.liveness.live_out(b);
        let order = lcm::schedule_block(g, cfg.block(b), live_out, self.limits, self.pressure_aware)?;
        self.records[b.ix()] = block_pressure(g, &order, live_out);
        cfg.block_mut(b).nodes = order;
        Ok(())
    }

    pub fn record(&self, b: BlockId) -> PressureRecord {
        self.records[b.ix()]
    }

    pub fn pressure(&self, b: BlockId, class: RegClass) -> u32 {
        self.records[b.ix()].get(class)
    }

    pub fn limits(&self) -> [u32; RegClass::COUNT] {
        self.limits
    }

    pub fn at_limit(&self, b: BlockId, class: RegClass) -> bool {
        self.pressure(b, class) >= self.limits[class.ix()]
    }

    pub fn exceeds(&self, b: BlockId, class: RegClass) -> bool {
        self.records[b.ix()].exceeds(class, self.limits)
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Blocks whose pressure is above the limit of some class.
    pub fn violations(&self) -> impl Iterator<Item = (BlockId, RegClass)> + '_ {
        self.records.iter().enumerate().flat_map(move |(i, r)| {
            RegClass::ALL.into_iter()
                .filter(move |&c| r.exceeds(c, self.limits))
                .map(move |c| (BlockId(i as u32), c))
        })
    }

    /// Recomputes liveness, then re-orders and re-measures `touched` plus every block whose
    /// live sets changed. Returns the number of refreshed blocks.
    pub fn membership_changed(&mut self, g: &MachGraph, cfg: &mut Cfg, touched: &[BlockId]) -> Result<usize, CompileError> {
        let live = compute_liveness(g, cfg)?;
        let mut dirty: BTreeSet<BlockId> = touched.iter().copied().collect();
        for b in cfg.block_ids() {
            if live.live_out(b) != self.liveness.live_out(b) || live.live_in(b) != self.liveness.live_in(b) {
                dirty.insert(b);
            }
        }
        self.liveness = live;
        for &b in &dirty {
            self.refresh(g, cfg, b)?;
        }
        Ok(dirty.len())
    }

    /// Follows `n` changing block. Only `n` and its inputs change where they are live, so only
    /// their live sets are updated; `touched` plus every block whose live sets changed is
    /// re-ordered and re-measured. Returns the number of refreshed blocks.
    pub fn node_moved(&mut self, g: &MachGraph, cfg: &mut Cfg, n: NodeId, touched: &[BlockId]) -> Result<usize, CompileError> {
        let mut values: SmallVec<[NodeId; 4]> = SmallVec::new();
        values.push(n);
        for (_, input) in g.node(n).register_inputs() {
            if !values.contains(&input) {
                values.push(input);
            }
        }
        let mut dirty: BTreeSet<BlockId> = touched.iter().copied().collect();
        for v in values {
            dirty.extend(self.liveness.update_value(g, cfg, v));
        }
        for &b in &dirty {
            self.refresh(g, cfg, b)?;
        }
        Ok(dirty.len())
    }

    /// Recomputes everything from scratch and compares against the maintained records.
    pub fn verify(&self, g: &MachGraph, cfg: &Cfg) -> Result<(), CompileError> {
        let live = compute_liveness(g, cfg)?;
        for b in cfg.block_ids() {
            let order = lcm::schedule_block(g, cfg.block(b), live.live_out(b), self.limits, self.pressure_aware)?;
            let recomputed = block_pressure(g, &order, live.live_out(b));
            let recorded = self.records[b.ix()];
            if recomputed != recorded {
                return Err(CompileError::PressureMismatch { block: b, recorded: recorded.max, recomputed: recomputed.max });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{cfg::MethodBuilder, ops::Opcode};

    #[test]
    fn straight_line_pressure() {
        let mut b = MethodBuilder::new("straight");
        let base = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        let y = b.load(RegClass::Float, base);
        let z = b.load(RegClass::Float, base);
        let w = b.load(RegClass::Float, base);
        b.store(RegClass::Float, base, x);
        b.store(RegClass::Float, base, y);
        b.store(RegClass::Float, base, z);
        b.ret(None);
        let m = b.finish().unwrap();
        let nodes = &m.cfg.block(BlockId::ENTRY).nodes;
        let p = block_pressure(&m.graph, nodes, &HashSet::default());
        // x, y, z live together, plus the dead w at its def
        assert_eq!(p.get(RegClass::Float), 4);
        assert_eq!(p.get(RegClass::Int), 1);
        let _ = w;
    }

    #[test]
    fn dead_phi_counts_at_block_start() {
        let mut b = MethodBuilder::new("phi");
        let p = b.param(RegClass::Float);
        let c = b.param(RegClass::Int);
        let left = b.new_block("left", 0.5);
        let right = b.new_block("right", 0.5);
        let merge = b.new_block("merge", 1.0);
        b.branch(c, left, right);
        b.switch_to_block(left);
        b.goto(merge);
        b.switch_to_block(right);
        b.goto(merge);
        b.switch_to_block(merge);
        b.phi(RegClass::Float, &[p, p]);
        b.ret(None);
        let m = b.finish().unwrap();
        let nodes = &m.cfg.block(merge).nodes;
        assert_eq!(block_pressure(&m.graph, nodes, &HashSet::default()).get(RegClass::Float), 1);
    }

    #[test]
    fn tracker_follows_moves() {
        let mut b = MethodBuilder::new("move");
        let base = b.param(RegClass::Int);
        let c = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        let then = b.new_block("then", 0.5);
        let exit = b.new_block("exit", 1.0);
        b.branch(c, then, exit);
        b.switch_to_block(then);
        let sq = b.push(Opcode::MulF, &[x, x]);
        b.store(RegClass::Float, base, sq);
        b.goto(exit);
        b.switch_to_block(exit);
        b.ret(None);
        let mut m = b.finish().unwrap();

        m.graph.node_mut(sq).block = BlockId::ENTRY;
        m.cfg.block_mut(BlockId::ENTRY).nodes.push(sq);
        let mut t = PressureTracker::build(&m.graph, &mut m.cfg, [14, 16], true).unwrap();
        t.verify(&m.graph, &m.cfg).unwrap();
        let then_live_in = t.liveness().live_in(then).clone();
        assert!(then_live_in.contains(&sq));

        let entry = &mut m.cfg.block_mut(BlockId::ENTRY).nodes;
        entry.retain(|&n| n != sq);
        m.cfg.block_mut(then).nodes.push(sq);
        m.graph.node_mut(sq).block = then;
        let refreshed = t.membership_changed(&m.graph, &mut m.cfg, &[BlockId::ENTRY, then]).unwrap();
        assert!(refreshed >= 2);
        t.verify(&m.graph, &m.cfg).unwrap();
        assert!(t.liveness().live_in(then).contains(&x));
        assert!(!t.liveness().live_in(then).contains(&sq));
        assert_eq!(m.cfg.block(then).nodes.first(), Some(&sq));
    }

    #[test]
    fn single_move_matches_full_recompute() {
        let mut b = MethodBuilder::new("move_one");
        let base = b.param(RegClass::Int);
        let c = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        let y = b.load(RegClass::Float, base);
        let then = b.new_block("then", 0.5);
        let exit = b.new_block("exit", 1.0);
        b.branch(c, then, exit);
        b.switch_to_block(then);
        let sum = b.push(Opcode::AddF, &[x, y]);
        b.store(RegClass::Float, base, sum);
        b.goto(exit);
        b.switch_to_block(exit);
        b.store(RegClass::Float, base, x);
        b.ret(None);
        let mut m = b.finish().unwrap();

        m.graph.node_mut(sum).block = BlockId::ENTRY;
        m.cfg.block_mut(BlockId::ENTRY).nodes.push(sum);
        let mut t = PressureTracker::build(&m.graph, &mut m.cfg, [14, 16], true).unwrap();
        assert!(t.liveness().live_in(then).contains(&sum));
        assert!(!t.liveness().live_in(then).contains(&y));

        m.cfg.block_mut(BlockId::ENTRY).nodes.retain(|&n| n != sum);
        m.cfg.block_mut(then).nodes.push(sum);
        m.graph.node_mut(sum).block = then;
        let refreshed = t.node_moved(&m.graph, &mut m.cfg, sum, &[BlockId::ENTRY, then]).unwrap();
        assert_eq!(refreshed, 2);
        assert_eq!(t.liveness(), &compute_liveness(&m.graph, &m.cfg).unwrap());
        assert!(t.liveness().live_in(then).contains(&y));
        assert!(!t.liveness().live_in(then).contains(&sum));
        t.verify(&m.graph, &m.cfg).unwrap();
    }

    #[test]
    fn stale_record_is_detected() {
        let mut b = MethodBuilder::new("stale");
        let base = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        b.store(RegClass::Float, base, x);
        b.ret(None);
        let mut m = b.finish().unwrap();
        let t = PressureTracker::build(&m.graph, &mut m.cfg, [14, 16], true).unwrap();
        let y = m.graph.add_node(Opcode::LoadF, &[base], Some(RegClass::Float), Some(BlockId::ENTRY));
        let sum = m.graph.add_node(Opcode::AddF, &[x, y], Some(RegClass::Float), None);
        m.graph.node_mut(sum).block = BlockId::ENTRY;
        let extra = m.graph.add_node(Opcode::StoreF, &[base, sum], None, Some(BlockId::ENTRY));
        m.cfg.block_mut(BlockId::ENTRY).nodes.extend([y, sum, extra]);
        assert!(matches!(t.verify(&m.graph, &m.cfg), Err(CompileError::PressureMismatch { .. })));
    }
}
