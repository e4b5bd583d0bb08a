//! Method generators shared by tests, benches and the fuzzer.

use crate::compiler::{
    cfg::{Method, MethodBuilder},
    error::CompileError,
    ops::{BlockId, NodeId, Opcode, RegClass},
};

fn finished(b: MethodBuilder) -> Method {
    match b.finish() {
        Ok(m) => m,
        Err(e) => panic!("generated method is malformed: {e}"),
    }
}

/// `steps` floating-point accumulations in one block. Each step adds one of `live` loaded
/// values, which stay live until a final sum at the end, so every step is a CISC-spill
/// candidate once the float registers run out.
pub fn unrolled_accumulation(steps: usize, live: usize) -> Method {
    let mut b = MethodBuilder::new(&format!("unrolled_{steps}x{live}"));
    let base = b.param(RegClass::Int);
    let vals: Vec<NodeId> = (0..live.max(1)).map(|_| b.load(RegClass::Float, base)).collect();
    let mut acc = b.con_f(0.0);
    for i in 0..steps {
        acc = b.push(Opcode::AddF, &[acc, vals[i % vals.len()]]);
    }
    let mut total = vals[0];
    for &v in &vals[1..] {
        total = b.push(Opcode::AddF, &[total, v]);
    }
    b.store(RegClass::Float, base, total);
    b.ret(Some(acc));
    finished(b)
}

/// A counted loop with a loop-invariant product and a float accumulator phi.
pub fn counted_loop() -> Method {
    let mut b = MethodBuilder::new("counted_loop");
    let base = b.param(RegClass::Int);
    let n = b.param(RegClass::Int);
    let x = b.load(RegClass::Float, base);
    let y = b.load(RegClass::Float, base);
    let zero = b.con_f(0.0);
    let one = b.con_i(1);
    let head = b.new_block("head", 10.0);
    let body = b.new_block("body", 9.0);
    let exit = b.new_block("exit", 1.0);
    b.goto(head);

    b.switch_to_block(head);
    let i = b.phi(RegClass::Int, &[n, n]);
    let acc = b.phi(RegClass::Float, &[zero, zero]);
    let more = b.push(Opcode::CmpI, &[i, one]);
    b.branch(more, body, exit);

    b.switch_to_block(body);
    let t = b.push(Opcode::MulF, &[x, y]);
    let acc2 = b.push(Opcode::AddF, &[acc, t]);
    let next = b.push(Opcode::SubI, &[i, one]);
    b.goto(head);
    b.set_inputs(i, &[n, next]);
    b.set_inputs(acc, &[zero, acc2]);

    b.switch_to_block(exit);
    b.store(RegClass::Float, base, acc);
    b.ret(Some(i));
    finished(b)
}

/// if/else producing one float through a phi.
pub fn diamond() -> Method {
    let mut b = MethodBuilder::new("diamond");
    let base = b.param(RegClass::Int);
    let c = b.load(RegClass::Int, base);
    let left = b.new_block("left", 0.5);
    let right = b.new_block("right", 0.5);
    let merge = b.new_block("merge", 1.0);
    b.branch(c, left, right);
    b.switch_to_block(left);
    let l = b.load(RegClass::Float, base);
    b.goto(merge);
    b.switch_to_block(right);
    let r = b.load(RegClass::Float, base);
    b.goto(merge);
    b.switch_to_block(merge);
    let p = b.phi(RegClass::Float, &[l, r]);
    b.store(RegClass::Float, base, p);
    b.ret(None);
    finished(b)
}

struct RandomMethod<'a> {
    b: MethodBuilder,
    choose: &'a mut dyn FnMut(u32) -> u32,
    base: NodeId,
    ints: Vec<NodeId>,
    floats: Vec<NodeId>,
    budget: usize,
}

impl RandomMethod<'_> {
    fn pick(&mut self, n: usize) -> usize {
        ((self.choose)(n as u32) as usize).min(n - 1)
    }

    fn int(&mut self) -> NodeId {
        let i = self.pick(self.ints.len());
        self.ints[i]
    }

    fn float(&mut self) -> NodeId {
        let i = self.pick(self.floats.len());
        self.floats[i]
    }

    fn block(&mut self, freq: f64) -> BlockId {
        let name = format!("b{}", self.b.block_count());
        self.b.new_block(&name, freq)
    }

    fn straight(&mut self) {
        let base = self.base;
        match self.pick(9) {
            0 => {
                let v = self.b.load(RegClass::Int, base);
                self.ints.push(v);
            }
            1 => {
                let v = self.b.load(RegClass::Float, base);
                self.floats.push(v);
            }
            2 | 3 => {
                let op = [Opcode::AddI, Opcode::SubI, Opcode::MulI, Opcode::AndI, Opcode::CmpI][self.pick(5)];
                let (x, y) = (self.int(), self.int());
                let v = self.b.push(op, &[x, y]);
                self.ints.push(v);
            }
            4 | 5 => {
                let op = [Opcode::AddF, Opcode::SubF, Opcode::MulF, Opcode::DivF][self.pick(4)];
                let (x, y) = (self.float(), self.float());
                let v = self.b.push(op, &[x, y]);
                self.floats.push(v);
            }
            6 => {
                let x = self.int();
                let v = self.b.push(Opcode::ConvI2F, &[x]);
                self.floats.push(v);
            }
            7 => {
                if self.pick(2) == 0 {
                    let v = self.int();
                    self.b.store(RegClass::Int, base, v);
                } else {
                    let v = self.float();
                    self.b.store(RegClass::Float, base, v);
                }
            }
            _ => {
                let k = self.pick(100);
                if self.pick(2) == 0 {
                    let v = self.b.con_i(k as i64);
                    self.ints.push(v);
                } else {
                    let v = self.b.con_f(k as f64 * 0.5);
                    self.floats.push(v);
                }
            }
        }
    }

    fn region(&mut self, freq: f64, depth: u32) {
        while self.budget > 0 {
            self.budget -= 1;
            match self.pick(14) {
                0 if depth < 3 => self.diamond(freq, depth),
                1 if depth < 3 => self.looped(freq, depth),
                2 if depth > 0 => return,
                _ => self.straight(),
            }
        }
    }

    fn diamond(&mut self, freq: f64, depth: u32) {
        let cond = self.int();
        let left = self.block(freq / 2.0);
        let right = self.block(freq / 2.0);
        let merge = self.block(freq);
        self.b.branch(cond, left, right);
        let scope = (self.ints.len(), self.floats.len());

        self.b.switch_to_block(left);
        self.region(freq / 2.0, depth + 1);
        let (li, lf) = (self.int(), self.float());
        self.b.goto(merge);
        self.ints.truncate(scope.0);
        self.floats.truncate(scope.1);

        self.b.switch_to_block(right);
        self.region(freq / 2.0, depth + 1);
        let (ri, rf) = (self.int(), self.float());
        self.b.goto(merge);
        self.ints.truncate(scope.0);
        self.floats.truncate(scope.1);

        self.b.switch_to_block(merge);
        let pi = self.b.phi(RegClass::Int, &[li, ri]);
        let pf = self.b.phi(RegClass::Float, &[lf, rf]);
        self.ints.push(pi);
        self.floats.push(pf);
    }

    fn looped(&mut self, freq: f64, depth: u32) {
        let head = self.block(freq * 8.0);
        let body = self.block(freq * 7.0);
        let exit = self.block(freq);
        let (init_i, init_f) = (self.int(), self.float());
        self.b.goto(head);

        self.b.switch_to_block(head);
        let i = self.b.phi(RegClass::Int, &[init_i, init_i]);
        let f = self.b.phi(RegClass::Float, &[init_f, init_f]);
        self.ints.push(i);
        self.floats.push(f);
        let limit = self.int();
        let cond = self.b.push(Opcode::CmpI, &[i, limit]);
        self.ints.push(cond);
        self.b.branch(cond, body, exit);
        let scope = (self.ints.len(), self.floats.len());

        self.b.switch_to_block(body);
        self.region(freq * 7.0, depth + 1);
        let step = self.int();
        let next_i = self.b.push(Opcode::SubI, &[i, step]);
        let next_f = self.float();
        self.b.goto(head);
        self.b.set_inputs(i, &[init_i, next_i]);
        self.b.set_inputs(f, &[init_f, next_f]);
        self.ints.truncate(scope.0);
        self.floats.truncate(scope.1);

        self.b.switch_to_block(exit);
    }
}

/// A random structured method of roughly `size` operations: straight-line code, if/else
/// diamonds with merge phis and counted loops with loop-carried phis, nested up to three
/// levels. `choose(n)` returns a number below `n`; every decision comes from it, so a
/// seeded source reproduces the same method.
pub fn random_method(name: &str, choose: &mut dyn FnMut(u32) -> u32, size: usize) -> Method {
    let mut b = MethodBuilder::new(name);
    let base = b.param(RegClass::Int);
    let n = b.param(RegClass::Int);
    let x = b.param(RegClass::Float);
    let mut gen = RandomMethod { b, choose, base, ints: vec![base, n], floats: vec![x], budget: size };
    gen.region(1.0, 0);
    let f = gen.float();
    gen.b.store(RegClass::Float, base, f);
    let r = gen.int();
    gen.b.ret(Some(r));
    finished(gen.b)
}

/// Errors a healthy allocator may report for hostile inputs. Everything else is a bug.
pub fn is_expected_bailout(e: &CompileError) -> bool {
    matches!(e, CompileError::Uncolorable { .. } | CompileError::SpillNonConvergence { .. })
}

/// Every node the graph ever handed out has a slot in the register map.
pub fn assert_register_map_covers(m: &Method) {
    assert!(m.graph.regs().capacity() >= m.graph.len(),
        "register map holds {} entries for {} nodes", m.graph.regs().capacity(), m.graph.len());
    for node in m.graph.nodes() {
        if let Err(e) = m.graph.reg(node.id) {
            panic!("{e}");
        }
    }
}
