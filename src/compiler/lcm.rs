use std::collections::BTreeSet;

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use smallvec::SmallVec;

use crate::compiler::{
    arena::MachGraph,
    cfg::Block,
    error::CompileError,
    ops::{NodeId, Opcode, RegClass},
};

/// Orders the members of `block`. The result depends only on membership and `live_out`,
/// never on the previous order: phis, then params, then a list schedule of the
/// remaining nodes, then the terminator.
pub fn schedule_block(
    g: &MachGraph,
    block: &Block,
    live_out: &HashSet<NodeId>,
    limits: [u32; RegClass::COUNT],
    pressure_aware: bool,
) -> Result<Vec<NodeId>, CompileError> {
    let mut members = block.nodes.clone();
    members.sort_unstable();

    let mut order = Vec::with_capacity(members.len());
    order.extend(members.iter().copied().filter(|&n| g.node(n).is_phi()));
    order.extend(members.iter().copied().filter(|&n| matches!(g.node(n).op, Opcode::Param(_))));
    let terminator: SmallVec<[NodeId; 1]> = members.iter().copied().filter(|&n| g.node(n).op.is_terminator()).collect();
    let middle: Vec<NodeId> = members.iter().copied()
        .filter(|&n| {
            let op = g.node(n).op;
            !matches!(op, Opcode::Phi | Opcode::Param(_)) && !op.is_terminator()
        })
        .collect();

    let in_middle: HashSet<NodeId> = middle.iter().copied().collect();
    let mut preds_left: HashMap<NodeId, u32> = HashMap::default();
    let mut succs: HashMap<NodeId, SmallVec<[NodeId; 4]>> = HashMap::default();
    let mut add_dep = |from: NodeId, to: NodeId, preds_left: &mut HashMap<NodeId, u32>| {
        succs.entry(from).or_default().push(to);
        *preds_left.entry(to).or_default() += 1;
    };
    let mut last_memory = None;
    for &n in &middle {
        preds_left.entry(n).or_default();
        let node = g.node(n);
        for &input in &node.inputs {
            if in_middle.contains(&input) {
                add_dep(input, n, &mut preds_left);
            }
        }
        if node.op.is_memory() || node.op.is_spill_code() {
            if let Some(prev) = last_memory {
                add_dep(prev, n, &mut preds_left);
            }
            last_memory = Some(n);
        }
    }

    // uses of each value still to be scheduled in this block
    let mut remaining_uses: HashMap<NodeId, u32> = HashMap::default();
    for &n in middle.iter().chain(terminator.iter()) {
        for (_, input) in g.node(n).register_inputs() {
            *remaining_uses.entry(input).or_default() += 1;
        }
    }
    let mut live = [0u32; RegClass::COUNT];
    let mut counted: HashSet<NodeId> = HashSet::default();
    for &v in remaining_uses.keys().chain(live_out.iter()).chain(order.iter()) {
        if in_middle.contains(&v) {
            continue;
        }
        if let Some(c) = g.class_of(v) {
            if counted.insert(v) {
                live[c.ix()] += 1;
            }
        }
    }

    let mut ready: BTreeSet<NodeId> = preds_left.iter().filter(|&(_, &c)| c == 0).map(|(&n, _)| n).collect();
    let mut scheduled = 0;
    while let Some(n) = pick(g, &ready, &remaining_uses, live_out, &live, limits, pressure_aware) {
        ready.remove(&n);
        scheduled += 1;
        order.push(n);

        let node = g.node(n);
        let mut freed: SmallVec<[NodeId; 3]> = SmallVec::new();
        for (_, input) in node.register_inputs() {
            if let Some(uses) = remaining_uses.get_mut(&input) {
                *uses -= 1;
                if *uses == 0 && !live_out.contains(&input) && !freed.contains(&input) {
                    freed.push(input);
                }
            }
        }
        for f in freed {
            if let Some(c) = g.class_of(f) {
                live[c.ix()] = live[c.ix()].saturating_sub(1);
            }
        }
        if let Some(c) = node.class {
            if remaining_uses.get(&n).is_some_and(|&u| u > 0) || live_out.contains(&n) {
                live[c.ix()] += 1;
            }
        }

        if let Some(next) = succs.get(&n) {
            for &s in next {
                if let Some(left) = preds_left.get_mut(&s) {
                    *left -= 1;
                    if *left == 0 {
                        ready.insert(s);
                    }
                }
            }
        }
    }

    if scheduled != middle.len() {
        let stuck = middle.iter().copied().find(|n| !order.contains(n)).unwrap_or(block.nodes[0]);
        return Err(CompileError::CyclicDependence { node: stuck });
    }
    order.extend(terminator);
    Ok(order)
}

/// Lowest index first; at the register limit, the node that ends the most live ranges.
fn pick(
    g: &MachGraph,
    ready: &BTreeSet<NodeId>,
    remaining_uses: &HashMap<NodeId, u32>,
    live_out: &HashSet<NodeId>,
    live: &[u32; RegClass::COUNT],
    limits: [u32; RegClass::COUNT],
    pressure_aware: bool,
) -> Option<NodeId> {
    let first = ready.first().copied()?;
    if !pressure_aware {
        return Some(first);
    }
    let high: SmallVec<[RegClass; 2]> = RegClass::ALL.into_iter().filter(|c| live[c.ix()] >= limits[c.ix()]).collect();
    if high.is_empty() {
        return Some(first);
    }

    let score = |n: NodeId| -> i32 {
        let node = g.node(n);
        let mut score = 0;
        let mut seen: SmallVec<[NodeId; 3]> = SmallVec::new();
        for (_, input) in node.register_inputs() {
            if seen.contains(&input) {
                continue;
            }
            seen.push(input);
            let uses_here = node.register_inputs().filter(|&(_, i)| i == input).count() as u32;
            let last_use = remaining_uses.get(&input).is_some_and(|&u| u == uses_here) && !live_out.contains(&input);
            if last_use && g.class_of(input).is_some_and(|c| high.contains(&c)) {
                score += 1;
            }
        }
        if node.class.is_some_and(|c| high.contains(&c)) {
            score -= 1;
        }
        score
    };

    let mut best = first;
    let mut best_score = score(first);
    for &n in ready.iter().skip(1) {
        let s = score(n);
        if s > best_score {
            best = n;
            best_score = s;
        }
    }
    Some(best)
}
