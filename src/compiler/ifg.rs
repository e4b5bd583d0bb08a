use std::fmt;

use rustc_hash::FxHashSet as HashSet;

use crate::compiler::{
    analyzer::Liveness,
    arena::MachGraph,
    cfg::Cfg,
    ops::{NodeId, RegClass},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LrgId(pub u32);
impl LrgId {
    #[inline]
    pub const fn ix(self) -> usize {
        self.0 as usize
    }
}
impl fmt::Display for LrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}
impl fmt::Debug for LrgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(self, f) }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveRange {
    pub id: LrgId,
    pub class: RegClass,
    pub members: Vec<NodeId>,
    /// frequency-weighted count of defs and uses
    pub cost: f64,
    pub spillable: bool,
    /// merged into another range by coalescing
    pub coalesced: bool,
}

impl LiveRange {
    /// Spill heuristic: lower is a better spill candidate.
    pub fn spill_ratio(&self, degree: usize) -> f64 {
        if !self.spillable {
            f64::INFINITY
        } else {
            self.cost / degree.max(1) as f64
        }
    }
}

impl fmt::Display for LiveRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} cost {:.2}", self.id, self.class, self.cost)?;
        if !self.spillable {
            write!(f, " (unspillable)")?;
        }
        write!(f, " {:?}", self.members)
    }
}

fn find(parent: &mut [u32], mut x: u32) -> u32 {
    while parent[x as usize] != x {
        parent[x as usize] = parent[parent[x as usize] as usize];
        x = parent[x as usize];
    }
    x
}

/// Live ranges of one allocation round. Phis are unioned with their inputs into one range.
#[derive(Debug, Clone, Default)]
pub struct LiveRanges {
    node_lrg: Vec<Option<LrgId>>,
    pub ranges: Vec<LiveRange>,
}

impl LiveRanges {
    /// One range per phi web and per other scheduled value. `unspillable` lists defs that
    /// were already spilled once.
    pub fn build(g: &MachGraph, cfg: &Cfg, unspillable: &HashSet<NodeId>) -> LiveRanges {
        let mut parent: Vec<u32> = (0..g.len() as u32).collect();
        let scheduled: Vec<NodeId> = {
            let mut v: Vec<NodeId> = cfg.blocks.iter()
                .flat_map(|b| b.nodes.iter().copied())
                .filter(|&n| g.node(n).is_value())
                .collect();
            v.sort_unstable();
            v
        };
        for &n in &scheduled {
            let node = g.node(n);
            if node.is_phi() {
                for &input in &node.inputs {
                    let (a, b) = (find(&mut parent, n.0), find(&mut parent, input.0));
                    if a != b {
                        parent[a.max(b) as usize] = a.min(b);
                    }
                }
            }
        }

        let mut lrgs = LiveRanges { node_lrg: vec![None; g.len()], ranges: Vec::new() };
        let mut root_lrg: Vec<Option<LrgId>> = vec![None; g.len()];
        for &n in &scheduled {
            let root = find(&mut parent, n.0) as usize;
            let id = match root_lrg[root] {
                Some(id) => id,
                None => {
                    let id = LrgId(lrgs.ranges.len() as u32);
                    root_lrg[root] = Some(id);
                    lrgs.ranges.push(LiveRange {
                        id,
                        class: g.node(n).class.unwrap_or(RegClass::Int),
                        members: Vec::new(),
                        cost: 0.0,
                        spillable: true,
                        coalesced: false,
                    });
                    id
                }
            };
            lrgs.node_lrg[n.ix()] = Some(id);
            let node = g.node(n);
            let range = &mut lrgs.ranges[id.ix()];
            range.members.push(n);
            range.cost += cfg.block(node.block).freq;
            if node.op.is_spill_code() || unspillable.contains(&n) {
                range.spillable = false;
            }
        }

        for b in &cfg.blocks {
            for &u in &b.nodes {
                let user = g.node(u);
                for (i, input) in user.register_inputs() {
                    if let Some(id) = lrgs.lrg(input) {
                        let use_block = if user.is_phi() { b.preds[i] } else { b.id };
                        lrgs.ranges[id.ix()].cost += cfg.block(use_block).freq;
                    }
                }
            }
        }
        lrgs
    }

    pub fn lrg(&self, n: NodeId) -> Option<LrgId> {
        self.node_lrg.get(n.ix()).copied().flatten()
    }

    pub fn get(&self, id: LrgId) -> &LiveRange {
        &self.ranges[id.ix()]
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Ranges still standing after coalescing.
    pub fn active(&self) -> impl Iterator<Item = &LiveRange> {
        self.ranges.iter().filter(|r| !r.coalesced)
    }

    /// Moves every member of `gone` into `keep`.
    pub fn merge(&mut self, keep: LrgId, gone: LrgId) {
        let members = std::mem::take(&mut self.ranges[gone.ix()].members);
        for &m in &members {
            self.node_lrg[m.ix()] = Some(keep);
        }
        let (cost, spillable) = (self.ranges[gone.ix()].cost, self.ranges[gone.ix()].spillable);
        self.ranges[gone.ix()].coalesced = true;
        let k = &mut self.ranges[keep.ix()];
        k.members.extend(members);
        k.members.sort_unstable();
        k.cost += cost;
        k.spillable &= spillable;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterferenceGraph {
    adj: Vec<HashSet<LrgId>>,
}

impl InterferenceGraph {
    pub fn new(count: usize) -> Self {
        InterferenceGraph { adj: vec![HashSet::default(); count] }
    }

    pub fn add_edge(&mut self, a: LrgId, b: LrgId) {
        if a != b {
            self.adj[a.ix()].insert(b);
            self.adj[b.ix()].insert(a);
        }
    }

    pub fn interferes(&self, a: LrgId, b: LrgId) -> bool {
        self.adj[a.ix()].contains(&b)
    }

    pub fn degree(&self, a: LrgId) -> usize {
        self.adj[a.ix()].len()
    }

    pub fn neighbors(&self, a: LrgId) -> impl Iterator<Item = LrgId> + '_ {
        self.adj[a.ix()].iter().copied()
    }

    pub fn edge_count(&self) -> usize {
        self.adj.iter().map(|a| a.len()).sum::<usize>() / 2
    }

    /// `keep` takes over all edges of `gone`, which disappears from the graph.
    pub fn merge(&mut self, keep: LrgId, gone: LrgId) {
        let edges = std::mem::take(&mut self.adj[gone.ix()]);
        for n in edges {
            self.adj[n.ix()].remove(&gone);
            if n != keep {
                self.add_edge(keep, n);
            }
        }
    }

    /// Builds edges with a backwards walk over every block. A def interferes with everything
    /// live after it, except that a copy does not interfere with its source. Phis interfere
    /// with each other and with the block's live-in values.
    pub fn build(g: &MachGraph, cfg: &Cfg, live: &Liveness, lrgs: &LiveRanges) -> InterferenceGraph {
        let mut ifg = InterferenceGraph::new(lrgs.len());
        let lrg_of = |n: NodeId| lrgs.lrg(n).map(|l| (l, lrgs.get(l).class));

        for b in &cfg.blocks {
            let mut live_now: HashSet<NodeId> = live.live_out(b.id).clone();
            for &n in b.nodes.iter().rev() {
                let node = g.node(n);
                if node.is_phi() {
                    continue;
                }
                if let Some((l, class)) = lrg_of(n) {
                    let copy_src = node.is_copy().then(|| node.inputs[0]);
                    for &v in &live_now {
                        if v == n || Some(v) == copy_src {
                            continue;
                        }
                        if let Some((lv, cv)) = lrg_of(v) {
                            if cv == class {
                                ifg.add_edge(l, lv);
                            }
                        }
                    }
                    live_now.remove(&n);
                }
                for (_, input) in node.register_inputs() {
                    if lrg_of(input).is_some() {
                        live_now.insert(input);
                    }
                }
            }
            let phis: Vec<NodeId> = b.phis(g).collect();
            for &p in &phis {
                let Some((lp, class)) = lrg_of(p) else { continue };
                for &v in live_now.iter().chain(phis.iter()) {
                    if v == p {
                        continue;
                    }
                    if let Some((lv, cv)) = lrg_of(v) {
                        if cv == class {
                            ifg.add_edge(lp, lv);
                        }
                    }
                }
            }
        }
        ifg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_moves_edges() {
        let mut ifg = InterferenceGraph::new(4);
        ifg.add_edge(LrgId(0), LrgId(2));
        ifg.add_edge(LrgId(1), LrgId(3));
        ifg.add_edge(LrgId(1), LrgId(2));
        ifg.merge(LrgId(0), LrgId(1));
        assert!(ifg.interferes(LrgId(0), LrgId(3)));
        assert!(ifg.interferes(LrgId(3), LrgId(0)));
        assert_eq!(ifg.degree(LrgId(0)), 2);
        assert_eq!(ifg.degree(LrgId(1)), 0);
        assert_eq!(ifg.degree(LrgId(2)), 1);
        assert_eq!(ifg.edge_count(), 2);
    }

    #[test]
    fn self_edges_are_ignored() {
        let mut ifg = InterferenceGraph::new(1);
        ifg.add_edge(LrgId(0), LrgId(0));
        assert_eq!(ifg.degree(LrgId(0)), 0);
    }

    #[test]
    fn unspillable_ranges_are_never_the_cheapest() {
        let mut lr = LiveRange {
            id: LrgId(0),
            class: RegClass::Float,
            members: vec![NodeId(1)],
            cost: 1.0,
            spillable: true,
            coalesced: false,
        };
        assert_eq!(lr.spill_ratio(4), 0.25);
        lr.spillable = false;
        assert!(lr.spill_ratio(100).is_infinite());
    }
}
