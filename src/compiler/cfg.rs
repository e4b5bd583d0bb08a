use std::{collections::BTreeMap, fmt};

use arrayvec::ArrayVec;
use rustc_hash::FxHashSet as HashSet;
use smallvec::SmallVec;

use crate::compiler::{
    analyzer,
    arena::MachGraph,
    error::CompileError,
    ops::{BlockId, NodeId, Opcode, RegClass},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: BlockId,
    pub name: String,
    /// expected executions per method invocation
    pub freq: f64,
    pub preds: SmallVec<[BlockId; 2]>,
    pub succs: ArrayVec<BlockId, 2>,
    /// Node order. Before global code motion only pinned nodes are here.
    pub nodes: Vec<NodeId>,
    pub idom: BlockId,
    pub dom_depth: u32,
    pub loop_depth: u32,
    pub rpo: u32,
}

impl Block {
    pub fn new(id: BlockId, name: String, freq: f64) -> Self {
        Self {
            id,
            name,
            freq,
            preds: SmallVec::new(),
            succs: ArrayVec::new(),
            nodes: Vec::new(),
            idom: BlockId::UNDEFINED,
            dom_depth: 0,
            loop_depth: 0,
            rpo: u32::MAX,
        }
    }

    pub fn position(&self, n: NodeId) -> Option<usize> {
        self.nodes.iter().position(|&x| x == n)
    }

    pub fn terminator(&self, g: &MachGraph) -> Option<NodeId> {
        self.nodes.last().copied().filter(|&n| g.node(n).op.is_terminator())
    }

    /// Index of the first node that is not a phi.
    pub fn first_non_phi(&self, g: &MachGraph) -> usize {
        self.nodes.iter().position(|&n| !g.node(n).is_phi()).unwrap_or(self.nodes.len())
    }

    pub fn phis<'a>(&'a self, g: &'a MachGraph) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes.iter().copied().filter(move |&n| g.node(n).is_phi())
    }

    /// Inserts `n` right before the terminator (or at the end of an unterminated block).
    pub fn insert_before_terminator(&mut self, g: &MachGraph, n: NodeId) {
        let pos = if self.terminator(g).is_some() { self.nodes.len() - 1 } else { self.nodes.len() };
        self.nodes.insert(pos, n);
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} (freq {}, loop depth {}", self.id, self.name, self.freq, self.loop_depth)?;
        if self.idom.is_defined() {
            write!(f, ", idom {}", self.idom)?;
        }
        write!(f, ")")?;
        if !self.preds.is_empty() {
            write!(f, " preds: {}", self.preds.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", "))?;
        }
        if !self.succs.is_empty() {
            write!(f, " succs: {}", self.succs.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cfg {
    pub blocks: Vec<Block>,
    pub rpo: Vec<BlockId>,
}

impl Cfg {
    #[inline]
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.ix()]
    }

    #[inline]
    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.ix()]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    /// Immediate dominators (Cooper, Harvey, Kennedy) over reverse postorder.
    pub fn compute_dominators(&mut self) {
        self.rpo = analyzer::reverse_postorder(self);
        for b in &mut self.blocks {
            b.rpo = u32::MAX;
        }
        for (i, &b) in self.rpo.iter().enumerate() {
            self.blocks[b.ix()].rpo = i as u32;
        }

        let mut idom = vec![BlockId::UNDEFINED; self.blocks.len()];
        idom[BlockId::ENTRY.ix()] = BlockId::ENTRY;
        let mut changed = true;
        while changed {
            changed = false;
            for &b in self.rpo.iter().skip(1) {
                let mut new_idom = BlockId::UNDEFINED;
                for &p in &self.blocks[b.ix()].preds {
                    if !idom[p.ix()].is_defined() {
                        continue;
                    }
                    new_idom = if new_idom.is_defined() { self.intersect(&idom, p, new_idom) } else { p };
                }
                if new_idom != idom[b.ix()] {
                    idom[b.ix()] = new_idom;
                    changed = true;
                }
            }
        }

        for i in 0..self.rpo.len() {
            let b = self.rpo[i];
            if b.is_entry() {
                self.blocks[b.ix()].idom = BlockId::UNDEFINED;
                self.blocks[b.ix()].dom_depth = 0;
            } else {
                let parent = idom[b.ix()];
                self.blocks[b.ix()].idom = parent;
                self.blocks[b.ix()].dom_depth = self.blocks[parent.ix()].dom_depth + 1;
            }
        }
    }

    fn intersect(&self, idom: &[BlockId], mut a: BlockId, mut b: BlockId) -> BlockId {
        while a != b {
            while self.blocks[a.ix()].rpo > self.blocks[b.ix()].rpo {
                a = idom[a.ix()];
            }
            while self.blocks[b.ix()].rpo > self.blocks[a.ix()].rpo {
                b = idom[b.ix()];
            }
        }
        a
    }

    /// Loop depth from natural loops; back edges sharing a header form one loop.
    pub fn compute_loops(&mut self) {
        let mut loops: BTreeMap<BlockId, HashSet<BlockId>> = BTreeMap::new();
        for b in &self.blocks {
            for &s in &b.succs {
                if self.dominates(s, b.id) {
                    let body = loops.entry(s).or_insert_with(|| [s].into_iter().collect());
                    let mut stack = vec![b.id];
                    while let Some(x) = stack.pop() {
                        if body.insert(x) {
                            stack.extend(self.blocks[x.ix()].preds.iter().copied());
                        }
                    }
                }
            }
        }
        for b in &mut self.blocks {
            b.loop_depth = 0;
        }
        for body in loops.values() {
            for x in body {
                self.blocks[x.ix()].loop_depth += 1;
            }
        }
    }

    pub fn dominates(&self, a: BlockId, mut b: BlockId) -> bool {
        let depth = self.blocks[a.ix()].dom_depth;
        while self.blocks[b.ix()].dom_depth > depth {
            b = self.blocks[b.ix()].idom;
        }
        a == b
    }

    /// Lowest common ancestor in the dominator tree. `UNDEFINED` acts as the identity.
    pub fn lca(&self, mut a: BlockId, mut b: BlockId) -> BlockId {
        if !a.is_defined() {
            return b;
        }
        if !b.is_defined() {
            return a;
        }
        while self.blocks[a.ix()].dom_depth > self.blocks[b.ix()].dom_depth {
            a = self.blocks[a.ix()].idom;
        }
        while self.blocks[b.ix()].dom_depth > self.blocks[a.ix()].dom_depth {
            b = self.blocks[b.ix()].idom;
        }
        while a != b {
            a = self.blocks[a.ix()].idom;
            b = self.blocks[b.ix()].idom;
        }
        a
    }

    /// Splits every edge from a block with several successors into a block with several
    /// predecessors, so that copies for phi inputs have a block of their own.
    pub fn split_critical_edges(&mut self, g: &mut MachGraph) -> usize {
        let mut split = 0;
        let count = self.blocks.len();
        for from_ix in 0..count {
            let from = BlockId(from_ix as u32);
            let succ_count = self.blocks[from_ix].succs.len();
            if succ_count < 2 {
                continue;
            }
            for succ_pos in 0..succ_count {
                let to = self.blocks[from_ix].succs[succ_pos];
                if self.blocks[to.ix()].preds.len() < 2 {
                    continue;
                }
                let id = BlockId(self.blocks.len() as u32);
                let name = format!("{}_{}", self.blocks[from_ix].name, self.blocks[to.ix()].name);
                let freq = self.blocks[from_ix].freq / succ_count as f64;
                let mut block = Block::new(id, name, freq);
                block.preds.push(from);
                block.succs.push(to);
                block.nodes.push(g.add_node(Opcode::Goto, &[], None, Some(id)));
                self.blocks.push(block);

                self.blocks[from_ix].succs[succ_pos] = id;
                let to_block = &mut self.blocks[to.ix()];
                if let Some(p) = to_block.preds.iter().position(|&p| p == from) {
                    to_block.preds[p] = id;
                }
                split += 1;
            }
        }
        split
    }
}

/// One compilation unit: the node arena plus its block structure.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub graph: MachGraph,
    pub cfg: Cfg,
}

impl Method {
    pub fn block_of(&self, n: NodeId) -> BlockId {
        self.graph.node(n).block
    }

    /// Node order of every block, for comparing schedules.
    pub fn schedule_snapshot(&self) -> Vec<Vec<NodeId>> {
        self.cfg.blocks.iter().map(|b| b.nodes.clone()).collect()
    }

    pub fn scheduled_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cfg.blocks.iter().flat_map(|b| b.nodes.iter().copied())
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "method {} {{", self.name)?;
        for b in &self.cfg.blocks {
            writeln!(f, "  {b}")?;
            for &n in &b.nodes {
                writeln!(f, "    {}", self.graph.node(n))?;
            }
        }
        let unscheduled: Vec<String> = self.graph.live_nodes()
            .filter(|n| !n.block.is_defined())
            .map(|n| n.to_string())
            .collect();
        if !unscheduled.is_empty() {
            writeln!(f, "  floating:")?;
            for n in unscheduled {
                writeln!(f, "    {n}")?;
            }
        }
        write!(f, "}}")
    }
}

/// Incremental construction of a [`Method`], the input format expected from instruction selection.
pub struct MethodBuilder {
    name: String,
    g: MachGraph,
    cfg: Cfg,
    current: BlockId,
    param_count: u32,
    errors: Vec<String>,
}

impl MethodBuilder {
    pub fn new(name: &str) -> Self {
        let mut cfg = Cfg::default();
        cfg.blocks.push(Block::new(BlockId::ENTRY, "entry".to_string(), 1.0));
        Self {
            name: name.to_string(),
            g: MachGraph::new(),
            cfg,
            current: BlockId::ENTRY,
            param_count: 0,
            errors: Vec::new(),
        }
    }

    pub fn entry(&self) -> BlockId {
        BlockId::ENTRY
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    pub fn new_block(&mut self, name: &str, freq: f64) -> BlockId {
        let id = BlockId(self.cfg.blocks.len() as u32);
        self.cfg.blocks.push(Block::new(id, name.to_string(), freq));
        id
    }

    pub fn block_count(&self) -> usize {
        self.cfg.blocks.len()
    }

    pub fn configure_block(&mut self, id: BlockId, name: &str, freq: f64) {
        let b = self.cfg.block_mut(id);
        b.name = name.to_string();
        b.freq = freq;
    }

    pub fn switch_to_block(&mut self, id: BlockId) {
        self.current = id;
    }

    pub fn node_class(&self, n: NodeId) -> Option<RegClass> {
        self.g.class_of(n)
    }

    fn add(&mut self, op: Opcode, inputs: &[NodeId], class: Option<RegClass>) -> NodeId {
        if op.is_floating() {
            self.g.add_node(op, inputs, class, None)
        } else {
            let id = self.g.add_node(op, inputs, class, Some(self.current));
            self.cfg.block_mut(self.current).nodes.push(id);
            id
        }
    }

    pub fn param(&mut self, class: RegClass) -> NodeId {
        let index = self.param_count;
        self.param_count += 1;
        let id = self.g.add_node(Opcode::Param(index), &[], Some(class), Some(BlockId::ENTRY));
        self.cfg.block_mut(BlockId::ENTRY).nodes.push(id);
        id
    }

    pub fn con_i(&mut self, value: i64) -> NodeId {
        self.add(Opcode::ConI(value), &[], Some(RegClass::Int))
    }

    pub fn con_f(&mut self, value: f64) -> NodeId {
        self.add(Opcode::con_f(value), &[], Some(RegClass::Float))
    }

    /// Adds an opcode whose result class is implied (arithmetic, loads, stores).
    pub fn push(&mut self, op: Opcode, inputs: &[NodeId]) -> NodeId {
        if op.has_free_result_class() || op.is_terminator() {
            self.errors.push(format!("{} needs an explicit class or target", op.mnemonic()));
        }
        self.add(op, inputs, op.fixed_result_class())
    }

    pub fn copy(&mut self, class: RegClass, input: NodeId) -> NodeId {
        self.add(Opcode::Copy, &[input], Some(class))
    }

    /// Phi in the current block. Inputs follow the predecessor order and may be set later.
    pub fn phi(&mut self, class: RegClass, inputs: &[NodeId]) -> NodeId {
        self.add(Opcode::Phi, inputs, Some(class))
    }

    pub fn load(&mut self, class: RegClass, base: NodeId) -> NodeId {
        let op = match class {
            RegClass::Int => Opcode::LoadI,
            RegClass::Float => Opcode::LoadF,
        };
        self.add(op, &[base], Some(class))
    }

    pub fn store(&mut self, class: RegClass, base: NodeId, value: NodeId) -> NodeId {
        let op = match class {
            RegClass::Int => Opcode::StoreI,
            RegClass::Float => Opcode::StoreF,
        };
        self.add(op, &[base, value], None)
    }

    fn add_edge(&mut self, to: BlockId) {
        let from = self.current;
        if to.is_entry() {
            self.errors.push(format!("{from} jumps to the entry block"));
            return;
        }
        if self.cfg.block_mut(from).succs.try_push(to).is_err() {
            self.errors.push(format!("{from} has more than two successors"));
            return;
        }
        self.cfg.block_mut(to).preds.push(from);
    }

    pub fn terminate(&mut self, op: Opcode, inputs: &[NodeId], targets: &[BlockId]) -> NodeId {
        let id = self.add(op, inputs, None);
        for &t in targets {
            self.add_edge(t);
        }
        id
    }

    pub fn goto(&mut self, target: BlockId) -> NodeId {
        self.terminate(Opcode::Goto, &[], &[target])
    }

    pub fn branch(&mut self, cond: NodeId, if_true: BlockId, if_false: BlockId) -> NodeId {
        self.terminate(Opcode::If, &[cond], &[if_true, if_false])
    }

    pub fn ret(&mut self, value: Option<NodeId>) -> NodeId {
        let inputs: SmallVec<[NodeId; 1]> = value.into_iter().collect();
        self.terminate(Opcode::Return, &inputs, &[])
    }

    pub fn set_inputs(&mut self, n: NodeId, inputs: &[NodeId]) {
        self.g.node_mut(n).inputs = SmallVec::from_slice(inputs);
    }

    pub fn finish(mut self) -> Result<Method, CompileError> {
        if let Some(err) = self.errors.first() {
            return Err(CompileError::MalformedGraph(err.clone()));
        }
        self.validate_blocks()?;
        self.validate_nodes()?;

        let split = self.cfg.split_critical_edges(&mut self.g);
        if split > 0 {
            log::debug!("{}: split {split} critical edges", self.name);
        }
        self.cfg.compute_dominators();
        self.cfg.compute_loops();
        self.validate_dominance()?;

        Ok(Method { name: self.name, graph: self.g, cfg: self.cfg })
    }

    fn validate_blocks(&self) -> Result<(), CompileError> {
        let malformed = |msg: String| Err(CompileError::MalformedGraph(msg));
        for b in &self.cfg.blocks {
            let Some(term) = b.terminator(&self.g) else {
                return malformed(format!("{} ({}) has no terminator", b.id, b.name));
            };
            let terminators = b.nodes.iter().filter(|&&n| self.g.node(n).op.is_terminator()).count();
            if terminators != 1 {
                return malformed(format!("{} ({}) has {terminators} terminators", b.id, b.name));
            }
            let expected = match self.g.node(term).op {
                Opcode::Goto => 1,
                Opcode::If => 2,
                _ => 0,
            };
            if b.succs.len() != expected {
                return malformed(format!("{} ({}) has {} successors, its terminator needs {expected}", b.id, b.name, b.succs.len()));
            }
        }
        let reachable = analyzer::postorder(&self.cfg);
        if reachable.len() != self.cfg.blocks.len() {
            let seen: HashSet<BlockId> = reachable.into_iter().collect();
            if let Some(b) = self.cfg.blocks.iter().find(|b| !seen.contains(&b.id)) {
                return malformed(format!("{} ({}) is unreachable", b.id, b.name));
            }
        }
        Ok(())
    }

    fn validate_nodes(&self) -> Result<(), CompileError> {
        let malformed = |msg: String| Err(CompileError::MalformedGraph(msg));
        for n in self.g.live_nodes() {
            if let Some(arity) = n.op.arity() {
                if n.inputs.len() != arity {
                    return malformed(format!("{n} expects {arity} inputs"));
                }
            }
            match n.op {
                Opcode::Phi => {
                    let preds = self.cfg.block(n.block).preds.len();
                    if preds == 0 || n.inputs.len() != preds {
                        return malformed(format!("{n} has {} inputs but its block has {preds} predecessors", n.inputs.len()));
                    }
                }
                Opcode::Return if n.inputs.len() > 1 => return malformed(format!("{n} returns more than one value")),
                _ => {}
            }
            for (i, &input) in n.inputs.iter().enumerate() {
                if input.ix() >= self.g.len() {
                    return malformed(format!("{n} refers to missing node {input}"));
                }
                let Some(class) = self.g.class_of(input) else {
                    return malformed(format!("input {input} of {n} is not a value"));
                };
                let expected = match n.op {
                    Opcode::Phi | Opcode::Copy => n.class,
                    op => op.input_class(i),
                };
                if expected.is_some_and(|e| e != class) {
                    return malformed(format!("input {input} of {n} is {class}, expected {}", expected.map_or(String::new(), |e| e.to_string())));
                }
            }
        }
        Ok(())
    }

    /// Pinned definitions must dominate their pinned uses. Floating nodes are checked by scheduling.
    fn validate_dominance(&self) -> Result<(), CompileError> {
        for b in &self.cfg.blocks {
            for (pos, &u) in b.nodes.iter().enumerate() {
                let user = self.g.node(u);
                for (i, &d) in user.inputs.iter().enumerate() {
                    let def = self.g.node(d);
                    if !def.is_pinned() {
                        continue;
                    }
                    let use_block = if user.is_phi() { b.preds[i] } else { b.id };
                    let ok = if def.block == use_block && !user.is_phi() {
                        b.position(d).is_some_and(|dp| dp < pos)
                    } else {
                        self.cfg.dominates(def.block, use_block)
                    };
                    if !ok {
                        return Err(CompileError::MalformedGraph(format!("{d} does not dominate its use in {user}")));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> (Method, [BlockId; 4]) {
        let mut b = MethodBuilder::new("diamond");
        let p = b.param(RegClass::Int);
        let zero = b.con_i(0);
        let c = b.push(Opcode::CmpI, &[p, zero]);
        let left = b.new_block("left", 0.5);
        let right = b.new_block("right", 0.5);
        let merge = b.new_block("merge", 1.0);
        b.branch(c, left, right);
        b.switch_to_block(left);
        b.goto(merge);
        b.switch_to_block(right);
        b.goto(merge);
        b.switch_to_block(merge);
        let phi = b.phi(RegClass::Int, &[p, zero]);
        b.ret(Some(phi));
        (b.finish().unwrap(), [BlockId::ENTRY, left, right, merge])
    }

    #[test]
    fn diamond_dominators() {
        let (m, [entry, left, right, merge]) = diamond();
        assert_eq!(m.cfg.block(left).idom, entry);
        assert_eq!(m.cfg.block(right).idom, entry);
        assert_eq!(m.cfg.block(merge).idom, entry);
        assert!(m.cfg.dominates(entry, merge));
        assert!(!m.cfg.dominates(left, merge));
        assert_eq!(m.cfg.lca(left, right), entry);
        assert_eq!(m.cfg.lca(merge, BlockId::UNDEFINED), merge);
        assert_eq!(m.cfg.len(), 4, "no critical edges in a diamond");
    }

    #[test]
    fn critical_edge_is_split() {
        // entry -> (head, exit); head -> (head, exit): all four edges are critical
        let mut b = MethodBuilder::new("critical");
        let p = b.param(RegClass::Int);
        let one = b.con_i(1);
        let head = b.new_block("head", 10.0);
        let exit = b.new_block("exit", 1.0);
        b.branch(p, head, exit);
        b.switch_to_block(head);
        let i = b.phi(RegClass::Int, &[p, p]);
        let next = b.push(Opcode::SubI, &[i, one]);
        b.set_inputs(i, &[p, next]);
        b.branch(next, head, exit);
        b.switch_to_block(exit);
        b.ret(None);
        let m = b.finish().unwrap();

        println!("{m}");
        assert_eq!(m.cfg.len(), 7, "{m}");
        for blk in &m.cfg.blocks {
            if blk.succs.len() > 1 {
                for &s in &blk.succs {
                    assert!(m.cfg.block(s).preds.len() < 2, "critical edge {} -> {s} left\n{m}", blk.id);
                }
            }
        }
        assert_eq!(m.cfg.block(head).loop_depth, 1);
        assert_eq!(m.cfg.block(exit).loop_depth, 0);
        // back edge now goes through a split block inside the loop
        let latch = m.cfg.block(head).preds[1];
        assert_eq!(m.cfg.block(latch).loop_depth, 1);
        assert_eq!(m.cfg.block(latch).succs.as_slice(), &[head]);
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let mut b = MethodBuilder::new("broken");
        b.param(RegClass::Int);
        assert!(matches!(b.finish(), Err(CompileError::MalformedGraph(_))));
    }

    #[test]
    fn class_mismatch_is_rejected() {
        let mut b = MethodBuilder::new("broken");
        let f = b.con_f(1.0);
        let i = b.con_i(1);
        b.push(Opcode::AddI, &[i, f]);
        b.ret(None);
        let err = b.finish().unwrap_err();
        assert!(err.to_string().contains("expected int"), "{err}");
    }

    #[test]
    fn unreachable_block_is_rejected() {
        let mut b = MethodBuilder::new("broken");
        b.ret(None);
        let orphan = b.new_block("orphan", 1.0);
        b.switch_to_block(orphan);
        b.ret(None);
        let err = b.finish().unwrap_err();
        assert!(err.to_string().contains("unreachable"), "{err}");
    }

    #[test]
    fn use_before_def_in_block_is_rejected() {
        let mut b = MethodBuilder::new("broken");
        let base = b.param(RegClass::Int);
        let st = b.store(RegClass::Int, base, base);
        let ld = b.load(RegClass::Int, base);
        b.set_inputs(st, &[base, ld]);
        b.ret(None);
        assert!(matches!(b.finish(), Err(CompileError::MalformedGraph(_))));
    }
}
