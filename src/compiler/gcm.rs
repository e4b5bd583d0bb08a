use std::{collections::BTreeSet, fmt};

use rustc_hash::FxHashMap as HashMap;
use smallvec::SmallVec;

use crate::compiler::{
    arena::MachGraph,
    cfg::{Cfg, Method},
    config::OptoConfig,
    error::CompileError,
    ops::{BlockId, NodeId, RegClass},
    pressure::PressureTracker,
};

/// Frequencies within this factor of each other are considered equal.
const FREQ_DELTA: f64 = 1.0 + 1e-4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcmStats {
    /// floating nodes placed
    pub placed: usize,
    /// nodes moved away from their earliest block
    pub moves: usize,
    /// nodes placed above the LCA of their uses
    pub hoisted: usize,
    /// floating nodes without uses, removed
    pub dead: usize,
}

impl fmt::Display for GcmStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} placed, {} moved, {} hoisted, {} dead", self.placed, self.moves, self.hoisted, self.dead)
    }
}

/// Floating nodes in an order where inputs come before their users.
fn floating_order(g: &MachGraph) -> Result<Vec<NodeId>, CompileError> {
    let floating: Vec<NodeId> = g.live_nodes().filter(|n| !n.is_pinned()).map(|n| n.id).collect();
    let mut preds_left: HashMap<NodeId, u32> = floating.iter().map(|&n| (n, 0)).collect();
    let mut users: HashMap<NodeId, SmallVec<[NodeId; 4]>> = HashMap::default();
    for &n in &floating {
        for &input in &g.node(n).inputs {
            if !g.node(input).is_pinned() {
                users.entry(input).or_default().push(n);
                *preds_left.entry(n).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<NodeId> = preds_left.iter().filter(|&(_, &c)| c == 0).map(|(&n, _)| n).collect();
    let mut order = Vec::with_capacity(floating.len());
    while let Some(n) = ready.pop_first() {
        order.push(n);
        for &u in users.get(&n).map(|u| u.as_slice()).unwrap_or(&[]) {
            if let Some(left) = preds_left.get_mut(&u) {
                *left -= 1;
                if *left == 0 {
                    ready.insert(u);
                }
            }
        }
    }

    if order.len() != floating.len() {
        let done: BTreeSet<NodeId> = order.into_iter().collect();
        let node = floating.iter().copied().find(|n| !done.contains(n)).unwrap_or(NodeId(0));
        return Err(CompileError::CyclicDependence { node });
    }
    Ok(order)
}

/// Deepest block among the input blocks, which must form a dominator chain.
fn early_block(g: &MachGraph, cfg: &Cfg, n: NodeId) -> Result<BlockId, CompileError> {
    let inputs = &g.node(n).inputs;
    let mut early = BlockId::ENTRY;
    for &input in inputs {
        let b = g.node(input).block;
        if cfg.block(b).dom_depth > cfg.block(early).dom_depth {
            early = b;
        }
    }
    for &input in inputs {
        let b = g.node(input).block;
        if !cfg.dominates(b, early) {
            return Err(CompileError::NoLegalBlock { node: n, early, late: b });
        }
    }
    Ok(early)
}

/// LCA of all use blocks, `None` for a node nothing uses.
fn late_block(g: &MachGraph, cfg: &Cfg, users: &[(NodeId, u32)]) -> Option<BlockId> {
    let mut late = BlockId::UNDEFINED;
    for &(u, idx) in users {
        let user = g.node(u);
        if user.dead {
            continue;
        }
        let use_block = if user.is_phi() {
            cfg.block(user.block).preds[idx as usize]
        } else {
            user.block
        };
        late = cfg.lca(late, use_block);
    }
    late.is_defined().then_some(late)
}

/// Walks the dominator tree from `late` up to `early` and returns the cheapest block.
/// Strictly lower frequency wins; at equal frequency, strictly lower pressure of `class`;
/// otherwise the deeper block stays. Blocks already at the register limit are skipped when
/// scheduling is pressure aware.
pub fn choose_block(
    cfg: &Cfg,
    tracker: &PressureTracker,
    class: Option<RegClass>,
    early: BlockId,
    late: BlockId,
    pressure_aware: bool,
) -> BlockId {
    let mut best = late;
    let mut cand = late;
    while cand != early && cand.is_defined() {
        cand = cfg.block(cand).idom;
        if pressure_aware && class.is_some_and(|c| tracker.at_limit(cand, c)) {
            continue;
        }
        let cand_freq = cfg.block(cand).freq;
        let best_freq = cfg.block(best).freq;
        if cand_freq * FREQ_DELTA < best_freq {
            best = cand;
        } else if pressure_aware && cand_freq < best_freq * FREQ_DELTA {
            if let Some(c) = class {
                if tracker.pressure(cand, c) < tracker.pressure(best, c) {
                    best = cand;
                }
            }
        }
    }
    best
}

/// The only place where a scheduled node changes block.
pub fn move_node(g: &mut MachGraph, cfg: &mut Cfg, tracker: &mut PressureTracker, n: NodeId, to: BlockId) -> Result<(), CompileError> {
    let from = g.node(n).block;
    if from == to {
        return Ok(());
    }
    if from.is_defined() {
        cfg.block_mut(from).nodes.retain(|&x| x != n);
    }
    let touched: SmallVec<[BlockId; 2]> = [from, to].into_iter().filter(|b| b.is_defined()).collect();
    if to.is_defined() {
        cfg.block_mut(to).nodes.push(n);
    } else {
        g.node_mut(n).dead = true;
    }
    g.node_mut(n).block = to;
    tracker.node_moved(g, cfg, n, &touched)?;
    Ok(())
}

/// Places every floating node: first as early as its inputs allow, then as late as its
/// uses allow, settling on the cheapest block in between. Returns the pressure tracker that
/// followed every move, for later verification.
pub fn global_code_motion(m: &mut Method, conf: &OptoConfig) -> Result<(PressureTracker, GcmStats), CompileError> {
    let pressure_aware = conf.pressure_aware_scheduling;
    let mut stats = GcmStats::default();

    let order = floating_order(&m.graph)?;
    for &n in &order {
        let early = early_block(&m.graph, &m.cfg, n)?;
        m.graph.node_mut(n).block = early;
        m.cfg.block_mut(early).nodes.push(n);
        stats.placed += 1;
    }

    let mut tracker = PressureTracker::build(&m.graph, &mut m.cfg, conf.reg_limits(), pressure_aware)?;
    let users = m.graph.users();

    for &n in order.iter().rev() {
        let Some(late) = late_block(&m.graph, &m.cfg, &users[n.ix()]) else {
            move_node(&mut m.graph, &mut m.cfg, &mut tracker, n, BlockId::UNDEFINED)?;
            stats.dead += 1;
            continue;
        };
        let early = m.graph.node(n).block;
        if !m.cfg.dominates(early, late) {
            return Err(CompileError::NoLegalBlock { node: n, early, late });
        }
        let best = choose_block(&m.cfg, &tracker, m.graph.class_of(n), early, late, pressure_aware);
        if best != late {
            stats.hoisted += 1;
        }
        if best != early {
            move_node(&mut m.graph, &mut m.cfg, &mut tracker, n, best)?;
            stats.moves += 1;
            if conf.verify >= 3 {
                tracker.verify(&m.graph, &m.cfg)?;
            }
        }
    }

    log::debug!("{}: placed {} floating nodes, {} moved, {} hoisted, {} dead",
        m.name, stats.placed, stats.moves, stats.hoisted, stats.dead);
    if conf.should_log(5) {
        log::debug!("{}: after global code motion\n{m}", m.name);
    }
    Ok((tracker, stats))
}

/// Re-runs placement on an existing schedule. Only nodes outside their legal range move,
/// and nodes in a block above the register limit when a block within the limit is available.
/// Returns the number of moves.
pub fn reschedule(m: &mut Method, tracker: &mut PressureTracker, conf: &OptoConfig) -> Result<usize, CompileError> {
    let pressure_aware = conf.pressure_aware_scheduling;
    let order = floating_order(&m.graph)?;
    let users = m.graph.users();
    let mut moves = 0;

    for &n in order.iter().rev() {
        let Some(late) = late_block(&m.graph, &m.cfg, &users[n.ix()]) else {
            continue;
        };
        let early = early_block(&m.graph, &m.cfg, n)?;
        if !m.cfg.dominates(early, late) {
            return Err(CompileError::NoLegalBlock { node: n, early, late });
        }
        let class = m.graph.class_of(n);
        let cur = m.graph.node(n).block;
        let legal = cur.is_defined() && m.cfg.dominates(early, cur) && m.cfg.dominates(cur, late);

        let target = if !legal {
            Some(choose_block(&m.cfg, tracker, class, early, late, pressure_aware))
        } else {
            match class {
                Some(c) if pressure_aware && tracker.exceeds(cur, c) => {
                    let best = choose_block(&m.cfg, tracker, class, early, late, pressure_aware);
                    (best != cur && !tracker.exceeds(best, c)).then_some(best)
                }
                _ => None,
            }
        };

        if let Some(to) = target.filter(|&to| to != cur) {
            move_node(&mut m.graph, &mut m.cfg, tracker, n, to)?;
            moves += 1;
        }
    }
    if moves > 0 {
        log::debug!("{}: rescheduling moved {moves} nodes", m.name);
    }
    Ok(moves)
}
