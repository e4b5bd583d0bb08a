use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};

use smallvec::SmallVec;

use crate::compiler::{
    arena::MachGraph,
    cfg::{Block, Cfg},
    error::CompileError,
    ops::{BlockId, NodeId},
};

pub fn postorder(g: &Cfg) -> Vec<BlockId> {
    let mut visited = vec![false; g.blocks.len()];
    let mut result = vec![];

    fn core(g: &Cfg, id: BlockId, visited: &mut Vec<bool>, result: &mut Vec<BlockId>) {
        let b = &g.blocks[id.ix()];
        visited[id.ix()] = true;
        for next in &b.succs {
            if !visited[next.ix()] {
                core(g, *next, visited, result);
            }
        }
        result.push(id);
    }

    if !g.blocks.is_empty() {
        core(g, BlockId::ENTRY, &mut visited, &mut result);
    }

    result
}

pub fn reverse_postorder(g: &Cfg) -> Vec<BlockId> {
    let mut o = postorder(g);
    o.reverse();
    o
}

/// Jacobi-style fixpoint over all reachable blocks.
/// `step(block, state, pred_states, succ_states)` computes the next state of a block.
/// A step function that is not monotone may never settle; that is reported as
/// [`CompileError::DataflowDiverged`].
pub fn dataflow<T: PartialEq>(
    g: &Cfg,
    reverse: bool,
    init: impl Fn(&Block) -> T,
    step: impl Fn(&Block, &T, &[&T], &[&T]) -> T
) -> Result<HashMap<BlockId, T>, CompileError> {
    let mut order = postorder(g);
    if reverse {
        order.reverse();
    }
    let mut lookup = vec![usize::MAX; g.blocks.len()];
    for (i, id) in order.iter().enumerate() {
        lookup[id.ix()] = i;
    }
    let mut state: Vec<T> = order.iter().map(|id| init(&g.blocks[id.ix()])).collect();

    let mut iters = 0;

    loop {
        let next_state: Vec<T> = state.iter().zip(order.iter()).map(|(s, bid)| {
            let b = g.block(*bid);
            let ins: SmallVec<[&T; 4]> =
                b.preds.iter().map(|p| &state[lookup[p.ix()]]).collect();
            let outs: SmallVec<[&T; 4]> =
                b.succs.iter().map(|s| &state[lookup[s.ix()]]).collect();
            step(b, s, &ins, &outs)
        }).collect();

        if next_state == state {
            return Ok(order.into_iter().zip(next_state).collect());
        }

        state = next_state;

        iters += 1;
        if iters > g.blocks.len() + 10 {
            return Err(CompileError::DataflowDiverged { iterations: iters });
        }
    }
}

/// Values live on entry to and exit from each block, indexed by block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Liveness {
    pub live_in: Vec<HashSet<NodeId>>,
    pub live_out: Vec<HashSet<NodeId>>,
}

impl Liveness {
    pub fn live_in(&self, b: BlockId) -> &HashSet<NodeId> {
        &self.live_in[b.ix()]
    }

    pub fn live_out(&self, b: BlockId) -> &HashSet<NodeId> {
        &self.live_out[b.ix()]
    }

    /// Recomputes where `v` is live from its current def and uses, walking backwards from
    /// each use until the def block. Other values keep their sets. Returns the blocks whose
    /// sets changed.
    pub fn update_value(&mut self, g: &MachGraph, cfg: &Cfg, v: NodeId) -> SmallVec<[BlockId; 8]> {
        let value = g.node(v).is_value();
        let mut def = None;
        let mut use_blocks: SmallVec<[BlockId; 8]> = SmallVec::new();
        let mut phi_preds: SmallVec<[BlockId; 4]> = SmallVec::new();
        for b in &cfg.blocks {
            for &id in &b.nodes {
                let node = g.node(id);
                if id == v && value {
                    def = Some(b.id);
                }
                if node.is_phi() {
                    for (&input, &pred) in node.inputs.iter().zip(b.preds.iter()) {
                        if input == v {
                            phi_preds.push(pred);
                        }
                    }
                } else if value && node.register_inputs().any(|(_, input)| input == v) {
                    use_blocks.push(b.id);
                }
            }
        }

        let n = cfg.blocks.len();
        let mut live_in = vec![false; n];
        let mut live_out = vec![false; n];
        let mut work: Vec<BlockId> = Vec::new();
        let reach = |b: BlockId, live_in: &mut Vec<bool>, work: &mut Vec<BlockId>| {
            if Some(b) != def && !live_in[b.ix()] {
                live_in[b.ix()] = true;
                work.push(b);
            }
        };
        for b in use_blocks {
            reach(b, &mut live_in, &mut work);
        }
        for p in phi_preds {
            live_out[p.ix()] = true;
            reach(p, &mut live_in, &mut work);
        }
        while let Some(b) = work.pop() {
            for &p in &cfg.block(b).preds {
                live_out[p.ix()] = true;
                reach(p, &mut live_in, &mut work);
            }
        }

        let mut changed = SmallVec::new();
        for i in 0..n {
            let in_changed = sync(&mut self.live_in[i], v, live_in[i]);
            let out_changed = sync(&mut self.live_out[i], v, live_out[i]);
            if in_changed || out_changed {
                changed.push(BlockId(i as u32));
            }
        }
        changed
    }
}

fn sync(set: &mut HashSet<NodeId>, v: NodeId, live: bool) -> bool {
    if live {
        set.insert(v)
    } else {
        set.remove(&v)
    }
}

/// Liveness from current block membership. A phi defines its value at the top of its block
/// and reads input `i` at the bottom of predecessor `i`.
pub fn compute_liveness(g: &MachGraph, cfg: &Cfg) -> Result<Liveness, CompileError> {
    let n = cfg.blocks.len();
    let mut defs = vec![HashSet::default(); n];
    let mut uses = vec![HashSet::default(); n];
    let mut phi_out = vec![HashSet::default(); n];

    for b in &cfg.blocks {
        let bi = b.id.ix();
        for &id in &b.nodes {
            if g.node(id).is_value() {
                defs[bi].insert(id);
            }
        }
        for &id in &b.nodes {
            let node = g.node(id);
            if node.is_phi() {
                for (&input, &pred) in node.inputs.iter().zip(b.preds.iter()) {
                    phi_out[pred.ix()].insert(input);
                }
                continue;
            }
            for (_, input) in node.register_inputs() {
                if g.node(input).is_value() && !defs[bi].contains(&input) {
                    uses[bi].insert(input);
                }
            }
        }
    }

    let mut state = dataflow(cfg, false,
        |_| (HashSet::default(), HashSet::default()),
        |b, _, _, outs: &[&(HashSet<NodeId>, HashSet<NodeId>)]| {
            let bi = b.id.ix();
            let mut live_out = phi_out[bi].clone();
            for (succ_in, _) in outs {
                live_out.extend(succ_in.iter().copied());
            }
            let mut live_in = uses[bi].clone();
            live_in.extend(live_out.iter().copied().filter(|v| !defs[bi].contains(v)));
            (live_in, live_out)
        })?;

    let mut live = Liveness::default();
    for b in cfg.block_ids() {
        let (live_in, live_out) = state.remove(&b).unwrap_or_default();
        live.live_in.push(live_in);
        live.live_out.push(live_out);
    }
    Ok(live)
}
