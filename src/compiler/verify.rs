use rustc_hash::FxHashMap as HashMap;

use crate::compiler::{
    analyzer::compute_liveness,
    arena::{MachGraph, OptoReg},
    cfg::Method,
    error::CompileError,
    ops::{NodeId, Opcode},
};

/// The value a node carries: copies carry the value of their source.
fn root(g: &MachGraph, mut n: NodeId) -> NodeId {
    while g.node(n).is_copy() {
        n = g.node(n).inputs[0];
    }
    n
}

fn fail(node: NodeId, reason: String) -> CompileError {
    CompileError::VerificationFailed { node, reason }
}

/// Register of value `n`, which has to be a machine register of its own class.
fn value_reg(g: &MachGraph, n: NodeId) -> Result<OptoReg, CompileError> {
    let reg = g.reg(n)?;
    match (reg, g.node(n).class) {
        (OptoReg::Reg(rc, _), Some(class)) if rc == class => Ok(reg),
        (reg, class) => Err(fail(n, format!("value of class {class:?} assigned {reg}"))),
    }
}

/// Simulates register contents through every block and checks that each read finds the
/// value it expects, that live-out values survive to the block end and that phi inputs
/// arrive in the phi's register.
pub fn verify_registers(m: &Method) -> Result<(), CompileError> {
    let g = &m.graph;
    let live = compute_liveness(g, &m.cfg)?;

    for block in &m.cfg.blocks {
        let mut holds: HashMap<OptoReg, NodeId> = HashMap::default();
        let mut live_in: Vec<NodeId> = live.live_in(block.id).iter().copied().collect();
        live_in.sort_unstable();
        for v in live_in {
            let reg = value_reg(g, v)?;
            let r = root(g, v);
            if let Some(other) = holds.insert(reg, r) {
                if other != r {
                    return Err(fail(v, format!("shares {reg} with {other} on entry to {}", block.id)));
                }
            }
        }
        for phi in block.phis(g) {
            let reg = value_reg(g, phi)?;
            if let Some(other) = holds.insert(reg, phi) {
                return Err(fail(phi, format!("shares {reg} with live-in {other}")));
            }
        }

        for &n in &block.nodes[block.first_non_phi(g)..] {
            let node = g.node(n);
            for (i, input) in node.register_inputs() {
                if !g.node(input).is_value() {
                    continue;
                }
                let reg = value_reg(g, input)?;
                let expected = root(g, input);
                match holds.get(&reg) {
                    Some(&v) if v == expected => {}
                    found => return Err(fail(n, format!("input {i} expects {expected} in {reg}, found {found:?}"))),
                }
            }
            if let Some(mem) = node.mem_operand {
                let store = node.inputs[mem.input as usize];
                if g.node(store).op != Opcode::SpillStore(mem.slot) {
                    return Err(fail(n, format!("memory operand {} is not fed by its store ({store})", mem.slot)));
                }
            }
            match node.op {
                Opcode::SpillStore(slot) if g.reg(n)? != OptoReg::Stack(slot) => {
                    return Err(fail(n, format!("store to {slot} assigned {}", g.reg(n)?)));
                }
                Opcode::SpillLoad(slot) if g.node(node.inputs[0]).op != Opcode::SpillStore(slot) => {
                    return Err(fail(n, format!("reload of {slot} is not fed by a store to it")));
                }
                _ => {}
            }
            if node.is_value() {
                holds.insert(value_reg(g, n)?, root(g, n));
            }
        }

        let mut live_out: Vec<NodeId> = live.live_out(block.id).iter().copied().collect();
        live_out.sort_unstable();
        for v in live_out {
            let reg = value_reg(g, v)?;
            if holds.get(&reg) != Some(&root(g, v)) {
                return Err(fail(v, format!("clobbered in {reg} before the end of {}", block.id)));
            }
        }
        for &succ in &block.succs {
            let succ_block = m.cfg.block(succ);
            let Some(i) = succ_block.preds.iter().position(|&p| p == block.id) else { continue };
            for phi in succ_block.phis(g) {
                let input = g.node(phi).inputs[i];
                let reg = value_reg(g, phi)?;
                if value_reg(g, input)? != reg || holds.get(&reg) != Some(&root(g, input)) {
                    return Err(fail(phi, format!("input {input} from {} does not arrive in {reg}", block.id)));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{
        cfg::MethodBuilder,
        config::OptoConfig,
        gcm::global_code_motion,
        ops::{BlockId, RegClass},
    };

    fn two_values() -> (Method, NodeId, NodeId, NodeId) {
        let mut b = MethodBuilder::new("verify");
        let base = b.param(RegClass::Int);
        let x = b.load(RegClass::Float, base);
        let y = b.load(RegClass::Float, base);
        let sum = b.push(Opcode::AddF, &[x, y]);
        b.store(RegClass::Float, base, sum);
        b.ret(None);
        let mut m = b.finish().unwrap();
        global_code_motion(&mut m, &OptoConfig::default()).unwrap();
        assert_eq!(m.block_of(sum), BlockId::ENTRY);
        m.graph.set_reg(base, OptoReg::Reg(RegClass::Int, 0)).unwrap();
        m.graph.set_reg(sum, OptoReg::Reg(RegClass::Float, 0)).unwrap();
        (m, x, y, sum)
    }

    #[test]
    fn distinct_registers_pass() {
        let (mut m, x, y, _) = two_values();
        m.graph.set_reg(x, OptoReg::Reg(RegClass::Float, 0)).unwrap();
        m.graph.set_reg(y, OptoReg::Reg(RegClass::Float, 1)).unwrap();
        verify_registers(&m).unwrap();
    }

    #[test]
    fn overlapping_values_in_one_register_fail() {
        let (mut m, x, y, sum) = two_values();
        m.graph.set_reg(x, OptoReg::Reg(RegClass::Float, 1)).unwrap();
        m.graph.set_reg(y, OptoReg::Reg(RegClass::Float, 1)).unwrap();
        let err = verify_registers(&m).unwrap_err();
        assert!(matches!(err, CompileError::VerificationFailed { node, .. } if node == sum), "{err}");
    }

    #[test]
    fn wrong_class_fails() {
        let (mut m, x, y, _) = two_values();
        m.graph.set_reg(x, OptoReg::Reg(RegClass::Int, 1)).unwrap();
        m.graph.set_reg(y, OptoReg::Reg(RegClass::Float, 1)).unwrap();
        let err = verify_registers(&m).unwrap_err();
        assert!(matches!(err, CompileError::VerificationFailed { node, .. } if node == x), "{err}");
    }
}
