use rustc_hash::FxHashSet as HashSet;
use smallvec::SmallVec;

use crate::compiler::{
    cfg::Method,
    chaitin::PhaseChaitin,
    error::CompileError,
    ifg::LiveRange,
    ops::{BlockId, NodeId, Opcode, SpillSlot},
};

impl PhaseChaitin<'_> {
    /// Follows CISC replacements to the node currently standing for `n`.
    fn resolve(&self, mut n: NodeId) -> NodeId {
        while let Some(&next) = self.replaced.get(&n) {
            n = next;
        }
        n
    }

    /// Moves `lr` to a fresh stack slot: a store after every def, and for every use either a
    /// memory operand or a reload right before it.
    pub(crate) fn spill_live_range(&mut self, m: &mut Method, lr: &LiveRange) -> Result<(), CompileError> {
        let slot = SpillSlot(self.next_slot);
        self.next_slot += 1;
        self.stats.spilled_lrgs += 1;

        let members: Vec<NodeId> = lr.members.iter()
            .map(|&n| self.resolve(n))
            .filter(|&n| !m.graph.node(n).dead)
            .collect();
        let member_set: HashSet<NodeId> = members.iter().copied().collect();
        if self.conf.trace_spilling {
            log::debug!("{}: spilling {} to {slot}", m.name, lr);
        }

        let mut store = None;
        for &def in &members {
            let b = m.graph.node(def).block;
            let block = m.cfg.block(b);
            let pos = if m.graph.node(def).is_phi() {
                block.first_non_phi(&m.graph)
            } else {
                match block.position(def) {
                    Some(p) => p + 1,
                    None => continue,
                }
            };
            let st = m.graph.add_node(Opcode::SpillStore(slot), &[def], None, Some(b));
            m.cfg.block_mut(b).nodes.insert(pos, st);
            self.spilled_defs.insert(def);
            self.stats.spill_stores += 1;
            store.get_or_insert(st);
            if self.conf.trace_spilling {
                log::debug!("  store {def} -> {slot} in {b}");
            }
        }
        let Some(store) = store else {
            return Ok(());
        };

        let users = m.graph.users();
        let mut handled: HashSet<NodeId> = HashSet::default();
        for &def in &members {
            for &(u, _) in &users[def.ix()] {
                let user = m.graph.node(u);
                if user.dead || user.is_phi() || matches!(user.op, Opcode::SpillStore(_)) || !handled.insert(u) {
                    continue;
                }
                let positions: SmallVec<[usize; 2]> = user.register_inputs()
                    .filter(|(_, input)| member_set.contains(input))
                    .map(|(p, _)| p)
                    .collect();
                if positions.is_empty() {
                    continue;
                }
                if self.try_cisc_spill(m, u, &positions, store, slot) {
                    continue;
                }
                self.insert_reload(m, lr, u, &positions, store, slot);
            }
        }
        Ok(())
    }

    fn insert_reload(&mut self, m: &mut Method, lr: &LiveRange, user: NodeId, positions: &[usize], store: NodeId, slot: SpillSlot) {
        let b = m.graph.node(user).block;
        let Some(pos) = m.cfg.block(b).position(user) else { return };
        let reload = m.graph.add_node(Opcode::SpillLoad(slot), &[store], Some(lr.class), Some(b));
        m.cfg.block_mut(b).nodes.insert(pos, reload);
        let node = m.graph.node_mut(user);
        for &p in positions {
            node.inputs[p] = reload;
        }
        self.stats.reloads += 1;
        if self.conf.trace_spilling {
            log::debug!("  reload {slot} -> {reload} for {user} in {b}");
        }
    }

    /// Replaces `user` by its memory-operand form when the spilled value is its only
    /// CISC-capable operand. Commutative operations swap the operand into place first.
    fn try_cisc_spill(&mut self, m: &mut Method, user: NodeId, positions: &[usize], store: NodeId, slot: SpillSlot) -> bool {
        if !self.conf.allow_cisc_spill || positions.len() != 1 {
            return false;
        }
        let node = m.graph.node(user);
        let Some(operand) = node.op.cisc_operand() else { return false };
        if node.mem_operand.is_some() {
            return false;
        }
        let p = positions[0];
        if p != operand {
            if !(node.op.is_commutative() && p == 0 && operand == 1) {
                return false;
            }
            m.graph.node_mut(user).inputs.swap(0, 1);
        }

        let b = m.graph.node(user).block;
        let Some(pos) = m.cfg.block(b).position(user) else { return false };
        let cisc = m.graph.add_cisc_version(user, operand, store, slot);
        m.cfg.block_mut(b).nodes[pos] = cisc;
        m.graph.replace_all_uses(user, cisc);
        let old = m.graph.node_mut(user);
        old.dead = true;
        old.block = BlockId::UNDEFINED;
        self.replaced.insert(user, cisc);
        if self.spilled_defs.contains(&user) {
            self.spilled_defs.insert(cisc);
        }
        self.stats.cisc_conversions += 1;
        if self.conf.trace_cisc_spill {
            log::debug!("CISC spill: {user} -> {}", m.graph.node(cisc));
        }
        true
    }
}
