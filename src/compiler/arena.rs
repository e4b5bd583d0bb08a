use std::fmt;

use smallvec::SmallVec;

use crate::compiler::{
    error::CompileError,
    ops::{BlockId, MemOperand, Node, NodeId, Opcode, RegClass, SpillSlot},
};

/// Location assigned to a node by the allocator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OptoReg {
    #[default]
    Bad,
    Reg(RegClass, u8),
    Stack(SpillSlot),
}

impl OptoReg {
    pub fn is_reg(self) -> bool {
        matches!(self, OptoReg::Reg(..))
    }
}

impl fmt::Display for OptoReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptoReg::Bad => write!(f, "-"),
            OptoReg::Reg(RegClass::Int, r) => write!(f, "r{r}"),
            OptoReg::Reg(RegClass::Float, r) => write!(f, "xmm{r}"),
            OptoReg::Stack(slot) => write!(f, "{slot}"),
        }
    }
}
impl fmt::Debug for OptoReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(self, f) }
}

/// Dense node → location table. Capacity only ever grows, and [`MachGraph`] grows it
/// whenever it hands out a node index, so every index the graph produced is addressable.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeRegMap {
    regs: Vec<OptoReg>,
}

impl NodeRegMap {
    pub fn with_capacity(capacity: usize) -> Self {
        NodeRegMap { regs: vec![OptoReg::Bad; capacity] }
    }

    pub fn capacity(&self) -> usize {
        self.regs.len()
    }

    /// Makes indices `0..node_count` addressable.
    pub fn ensure(&mut self, node_count: usize) {
        if node_count > self.regs.len() {
            let new_len = node_count.next_power_of_two();
            self.regs.resize(new_len, OptoReg::Bad);
        }
    }

    pub fn get(&self, node: NodeId) -> Result<OptoReg, CompileError> {
        self.regs.get(node.ix()).copied()
            .ok_or(CompileError::NodeIndexOverflow { node, capacity: self.regs.len() })
    }

    pub fn set(&mut self, node: NodeId, reg: OptoReg) -> Result<(), CompileError> {
        let capacity = self.regs.len();
        let slot = self.regs.get_mut(node.ix())
            .ok_or(CompileError::NodeIndexOverflow { node, capacity })?;
        *slot = reg;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.regs.fill(OptoReg::Bad);
    }
}

/// Arena of all nodes of one compilation unit. Node indices are never reused; dead nodes
/// keep their slot. All node creation goes through [`MachGraph::add_node`].
#[derive(Clone, Debug, Default)]
pub struct MachGraph {
    nodes: Vec<Node>,
    regs: NodeRegMap,
}

impl MachGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, op: Opcode, inputs: &[NodeId], class: Option<RegClass>, control: Option<BlockId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            op,
            inputs: SmallVec::from_slice(inputs),
            class,
            control,
            block: control.unwrap_or(BlockId::UNDEFINED),
            mem_operand: None,
            dead: false,
        });
        self.regs.ensure(self.nodes.len());
        id
    }

    /// Creates the memory-operand form of `orig`: input `input` is replaced by the stack value `store`.
    /// `orig` itself is left untouched; the caller swaps the new node in.
    pub fn add_cisc_version(&mut self, orig: NodeId, input: usize, store: NodeId, slot: SpillSlot) -> NodeId {
        let n = self.node(orig).clone();
        let mut inputs = n.inputs.clone();
        inputs[input] = store;
        let id = self.add_node(n.op, &inputs, n.class, n.control);
        let new = self.node_mut(id);
        new.block = n.block;
        new.mem_operand = Some(MemOperand { input: input as u8, slot });
        id
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.ix()]
    }

    #[inline]
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.ix()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.dead)
    }

    pub fn class_of(&self, id: NodeId) -> Option<RegClass> {
        self.node(id).class
    }

    /// Rewires every live use of `old` to `new`, `new` included: a loop phi may read itself
    /// once its back-edge copy is gone.
    pub fn replace_all_uses(&mut self, old: NodeId, new: NodeId) -> usize {
        let mut count = 0;
        for n in self.nodes.iter_mut().filter(|n| !n.dead) {
            for input in n.inputs.iter_mut().filter(|i| **i == old) {
                *input = new;
                count += 1;
            }
        }
        count
    }

    /// Live users of each node as `(user, input index)`, indexed by node.
    pub fn users(&self) -> Vec<SmallVec<[(NodeId, u32); 2]>> {
        let mut users: Vec<SmallVec<[(NodeId, u32); 2]>> = vec![SmallVec::new(); self.nodes.len()];
        for n in self.live_nodes() {
            for (i, input) in n.inputs.iter().enumerate() {
                users[input.ix()].push((n.id, i as u32));
            }
        }
        users
    }

    pub fn regs(&self) -> &NodeRegMap {
        &self.regs
    }

    pub fn reg(&self, id: NodeId) -> Result<OptoReg, CompileError> {
        self.regs.get(id)
    }

    pub fn set_reg(&mut self, id: NodeId, reg: OptoReg) -> Result<(), CompileError> {
        self.regs.set(id, reg)
    }

    pub fn clear_regs(&mut self) {
        self.regs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_tracks_node_counter() {
        let mut g = MachGraph::new();
        let mut last = g.add_node(Opcode::ConI(0), &[], Some(RegClass::Int), None);
        for i in 1..1000 {
            last = g.add_node(Opcode::AddI, &[last, last], Some(RegClass::Int), None);
            assert!(g.regs().capacity() >= g.len(), "capacity {} behind counter {} at {i}", g.regs().capacity(), g.len());
        }
        g.set_reg(last, OptoReg::Reg(RegClass::Int, 3)).unwrap();
        assert_eq!(g.reg(last).unwrap(), OptoReg::Reg(RegClass::Int, 3));
    }

    #[test]
    fn out_of_range_index_is_an_error_not_a_panic() {
        let mut map = NodeRegMap::with_capacity(4);
        assert!(map.get(NodeId(3)).is_ok());
        assert_eq!(map.get(NodeId(4)), Err(CompileError::NodeIndexOverflow { node: NodeId(4), capacity: 4 }));
        assert!(map.set(NodeId(100), OptoReg::Bad).is_err());
        map.ensure(101);
        assert!(map.set(NodeId(100), OptoReg::Stack(SpillSlot(1))).is_ok());
    }

    #[test]
    fn cisc_version_gets_fresh_index_and_memory_operand() {
        let mut g = MachGraph::new();
        let a = g.add_node(Opcode::con_f(1.0), &[], Some(RegClass::Float), None);
        let b = g.add_node(Opcode::con_f(2.0), &[], Some(RegClass::Float), None);
        let add = g.add_node(Opcode::AddF, &[a, b], Some(RegClass::Float), None);
        let store = g.add_node(Opcode::SpillStore(SpillSlot(0)), &[b], None, Some(BlockId::ENTRY));
        let cisc = g.add_cisc_version(add, 1, store, SpillSlot(0));

        assert_eq!(cisc, NodeId(4));
        assert_eq!(g.node(cisc).inputs.as_slice(), &[a, store]);
        assert_eq!(g.node(cisc).mem_operand, Some(MemOperand { input: 1, slot: SpillSlot(0) }));
        assert!(g.reg(cisc).is_ok());

        let user = g.add_node(Opcode::MulF, &[add, add], Some(RegClass::Float), None);
        assert_eq!(g.replace_all_uses(add, cisc), 2);
        assert_eq!(g.node(user).inputs.as_slice(), &[cisc, cisc]);
    }
}
