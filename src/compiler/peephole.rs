use rustc_hash::FxHashMap as HashMap;

use crate::compiler::{
    arena::OptoReg,
    cfg::Method,
    config::OptoConfig,
    error::CompileError,
    ops::{BlockId, NodeId, Opcode, SpillSlot},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeepholeStats {
    pub removed_copies: usize,
    pub forwarded_reloads: usize,
    pub folded_reloads: usize,
}

/// Local rewrites on allocated code. New nodes get their register set immediately.
pub fn optimize(m: &mut Method, conf: &OptoConfig) -> Result<PeepholeStats, CompileError> {
    let mut stats = PeepholeStats::default();
    let blocks: Vec<BlockId> = m.cfg.block_ids().collect();
    for &b in &blocks {
        if conf.allow_cisc_spill {
            stats.folded_reloads += fold_reloads(m, b)?;
        }
        stats.forwarded_reloads += forward_reloads(m, b)?;
    }
    for &b in &blocks {
        stats.removed_copies += remove_identity_copies(m, b)?;
    }
    if stats != PeepholeStats::default() {
        log::debug!("{}: peephole removed {} copies, forwarded {} reloads, folded {} reloads",
            m.name, stats.removed_copies, stats.forwarded_reloads, stats.folded_reloads);
    }
    Ok(stats)
}

fn kill(m: &mut Method, n: NodeId) {
    let node = m.graph.node_mut(n);
    node.dead = true;
    node.block = BlockId::UNDEFINED;
}

/// Copies whose source already sits in the destination register.
fn remove_identity_copies(m: &mut Method, b: BlockId) -> Result<usize, CompileError> {
    let mut removed = 0;
    let nodes = m.cfg.block(b).nodes.clone();
    let mut keep = Vec::with_capacity(nodes.len());
    for n in nodes {
        let node = m.graph.node(n);
        if node.is_copy() {
            let src = node.inputs[0];
            let dst_reg = m.graph.reg(n)?;
            if dst_reg.is_reg() && dst_reg == m.graph.reg(src)? {
                m.graph.replace_all_uses(n, src);
                kill(m, n);
                removed += 1;
                continue;
            }
        }
        keep.push(n);
    }
    m.cfg.block_mut(b).nodes = keep;
    Ok(removed)
}

/// A reload of a slot stored earlier in the same block reads the stored register instead,
/// as long as that register was not overwritten in between.
fn forward_reloads(m: &mut Method, b: BlockId) -> Result<usize, CompileError> {
    let mut forwarded = 0;
    let mut stored: HashMap<SpillSlot, (NodeId, OptoReg)> = HashMap::default();
    let mut pos = 0;
    while pos < m.cfg.block(b).nodes.len() {
        let n = m.cfg.block(b).nodes[pos];
        let node = m.graph.node(n);
        let class = node.class;
        match node.op {
            Opcode::SpillStore(slot) => {
                let value = node.inputs[0];
                stored.insert(slot, (value, m.graph.reg(value)?));
            }
            Opcode::SpillLoad(slot) if stored.contains_key(&slot) => {
                let (value, src_reg) = stored[&slot];
                let dst_reg = m.graph.reg(n)?;
                if dst_reg == src_reg {
                    m.graph.replace_all_uses(n, value);
                    kill(m, n);
                    m.cfg.block_mut(b).nodes.remove(pos);
                    forwarded += 1;
                    continue;
                }
                let copy = m.graph.add_node(Opcode::Copy, &[value], class, Some(b));
                m.graph.set_reg(copy, dst_reg)?;
                m.cfg.block_mut(b).nodes[pos] = copy;
                m.graph.replace_all_uses(n, copy);
                kill(m, n);
                stored.retain(|_, (_, r)| *r != dst_reg);
                forwarded += 1;
            }
            _ => {
                if class.is_some() {
                    let reg = m.graph.reg(n)?;
                    stored.retain(|_, (_, r)| *r != reg);
                }
            }
        }
        pos += 1;
    }
    Ok(forwarded)
}

/// A reload with a single user that can take the slot as a memory operand disappears into it.
fn fold_reloads(m: &mut Method, b: BlockId) -> Result<usize, CompileError> {
    let users = m.graph.users();
    let mut folded = 0;
    let reloads: Vec<NodeId> = m.cfg.block(b).nodes.iter().copied()
        .filter(|&n| matches!(m.graph.node(n).op, Opcode::SpillLoad(_)))
        .collect();
    for reload in reloads {
        let Opcode::SpillLoad(slot) = m.graph.node(reload).op else { continue };
        let [(user, _)] = users[reload.ix()].as_slice() else { continue };
        let user = *user;
        let node = m.graph.node(user);
        if node.dead || node.block != b || node.mem_operand.is_some() {
            continue;
        }
        let Some(operand) = node.op.cisc_operand() else { continue };
        let positions: Vec<usize> = node.register_inputs().filter(|&(_, i)| i == reload).map(|(p, _)| p).collect();
        let [p] = positions.as_slice() else { continue };
        if *p != operand {
            if !(node.op.is_commutative() && *p == 0 && operand == 1) {
                continue;
            }
            m.graph.node_mut(user).inputs.swap(0, 1);
        }

        let store = m.graph.node(reload).inputs[0];
        let reg = m.graph.reg(user)?;
        let cisc = m.graph.add_cisc_version(user, operand, store, slot);
        m.graph.set_reg(cisc, reg)?;
        let block = m.cfg.block_mut(b);
        block.nodes.retain(|&x| x != reload);
        if let Some(pos) = block.position(user) {
            block.nodes[pos] = cisc;
        }
        m.graph.replace_all_uses(user, cisc);
        kill(m, user);
        kill(m, reload);
        folded += 1;
    }
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{
        cfg::MethodBuilder,
        ops::{MemOperand, RegClass},
    };

    fn xmm(r: u8) -> OptoReg {
        OptoReg::Reg(RegClass::Float, r)
    }

    /// base; x = load; spill x; ...; r = reload; y = sub.f x?, r; store y
    fn spilled(reload_reg: u8, clobber: bool) -> (Method, NodeId, NodeId) {
        let mut b = MethodBuilder::new("peephole");
        let base = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        b.ret(None);
        let mut m = b.finish().unwrap();
        let g = &mut m.graph;
        let st = g.add_node(Opcode::SpillStore(SpillSlot(0)), &[x], None, Some(BlockId::ENTRY));
        let other = g.add_node(Opcode::LoadF, &[base], Some(RegClass::Float), Some(BlockId::ENTRY));
        let reload = g.add_node(Opcode::SpillLoad(SpillSlot(0)), &[st], Some(RegClass::Float), Some(BlockId::ENTRY));
        let user = g.add_node(Opcode::SubF, &[reload, other], Some(RegClass::Float), Some(BlockId::ENTRY));
        let out = g.add_node(Opcode::StoreF, &[base, user], None, Some(BlockId::ENTRY));
        g.set_reg(base, OptoReg::Reg(RegClass::Int, 0)).unwrap();
        g.set_reg(x, xmm(0)).unwrap();
        g.set_reg(st, OptoReg::Stack(SpillSlot(0))).unwrap();
        g.set_reg(other, xmm(if clobber { 0 } else { 1 })).unwrap();
        g.set_reg(reload, xmm(reload_reg)).unwrap();
        g.set_reg(user, xmm(reload_reg)).unwrap();
        let ret = m.cfg.block(BlockId::ENTRY).nodes[2];
        m.cfg.block_mut(BlockId::ENTRY).nodes = vec![base, x, st, other, reload, user, out, ret];
        (m, reload, user)
    }

    #[test]
    fn reload_in_same_register_is_dropped() {
        let (mut m, reload, user) = spilled(0, false);
        assert_eq!(forward_reloads(&mut m, BlockId::ENTRY).unwrap(), 1);
        assert!(m.graph.node(reload).dead);
        assert_eq!(m.graph.node(user).inputs[0], NodeId(1));
    }

    #[test]
    fn reload_into_other_register_becomes_a_copy() {
        let (mut m, reload, user) = spilled(2, false);
        let before = m.graph.len();
        assert_eq!(forward_reloads(&mut m, BlockId::ENTRY).unwrap(), 1);
        let copy = m.graph.node(user).inputs[0];
        assert_eq!(copy, NodeId(before as u32));
        assert!(m.graph.node(copy).is_copy());
        assert_eq!(m.graph.reg(copy).unwrap(), xmm(2));
        assert!(m.graph.node(reload).dead);
    }

    #[test]
    fn clobbered_register_blocks_forwarding() {
        let (mut m, reload, _) = spilled(2, true);
        assert_eq!(forward_reloads(&mut m, BlockId::ENTRY).unwrap(), 0);
        assert!(!m.graph.node(reload).dead);
    }

    #[test]
    fn single_user_reload_folds_with_swap() {
        let (mut m, reload, user) = spilled(2, true);
        assert_eq!(fold_reloads(&mut m, BlockId::ENTRY).unwrap(), 0, "sub.f is not commutative");
        m.graph.node_mut(user).op = Opcode::AddF;
        assert_eq!(fold_reloads(&mut m, BlockId::ENTRY).unwrap(), 1);
        assert!(m.graph.node(reload).dead && m.graph.node(user).dead);
        let cisc = m.cfg.block(BlockId::ENTRY).nodes[4];
        let node = m.graph.node(cisc);
        assert_eq!(node.mem_operand, Some(MemOperand { input: 1, slot: SpillSlot(0) }));
        assert_eq!(m.graph.reg(cisc).unwrap(), xmm(2));
    }

    #[test]
    fn copies_on_the_back_edge_fold_into_the_phi() {
        let mut b = MethodBuilder::new("back_edge");
        let base = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        let head = b.new_block("head", 10.0);
        let body = b.new_block("body", 9.0);
        let exit = b.new_block("exit", 1.0);
        b.goto(head);
        b.switch_to_block(head);
        let f = b.phi(RegClass::Float, &[x, x]);
        b.branch(base, body, exit);
        b.switch_to_block(body);
        let c1 = b.copy(RegClass::Float, f);
        let c2 = b.copy(RegClass::Float, c1);
        b.goto(head);
        b.set_inputs(f, &[x, c2]);
        b.switch_to_block(exit);
        b.store(RegClass::Float, base, f);
        b.ret(None);
        let mut m = b.finish().unwrap();
        for n in [f, c1, c2] {
            m.graph.set_reg(n, xmm(0)).unwrap();
        }

        assert_eq!(remove_identity_copies(&mut m, body).unwrap(), 2);
        assert_eq!(m.graph.node(f).inputs.as_slice(), &[x, f]);
        for n in m.graph.live_nodes() {
            assert!(n.inputs.iter().all(|&i| !m.graph.node(i).dead), "{n} reads a removed node");
        }
    }

    #[test]
    fn identity_copy_is_removed() {
        let mut b = MethodBuilder::new("copy");
        let base = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        let c = b.copy(RegClass::Float, x);
        let st = b.store(RegClass::Float, base, c);
        b.ret(None);
        let mut m = b.finish().unwrap();
        m.graph.set_reg(x, xmm(3)).unwrap();
        m.graph.set_reg(c, xmm(3)).unwrap();
        assert_eq!(remove_identity_copies(&mut m, BlockId::ENTRY).unwrap(), 1);
        assert_eq!(m.graph.node(st).inputs[1], x);
        assert!(m.cfg.block(BlockId::ENTRY).position(c).is_none());
    }
}
