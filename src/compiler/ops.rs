use std::fmt::{self, Debug, Display};

use smallvec::SmallVec;

/// Dense index of a node. Assigned from a monotonic counter and never reused within one compilation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);
impl NodeId {
    #[inline]
    pub const fn ix(self) -> usize {
        self.0 as usize
    }
}
impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}
impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(self, f) }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);
impl BlockId {
    pub const UNDEFINED: BlockId = BlockId(u32::MAX);
    pub const ENTRY: BlockId = BlockId(0);

    #[inline]
    pub const fn ix(self) -> usize {
        self.0 as usize
    }
    pub const fn is_entry(self) -> bool {
        self.0 == 0
    }
    pub const fn is_defined(self) -> bool {
        self.0 != u32::MAX
    }
}
impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_defined() {
            write!(f, "bb{}", self.0)
        } else {
            write!(f, "bb?")
        }
    }
}
impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(self, f) }
}

/// Register file a value lives in. Values of different classes never interfere.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum RegClass {
    Int,
    Float,
}
impl RegClass {
    pub const COUNT: usize = 2;
    pub const ALL: [RegClass; RegClass::COUNT] = [RegClass::Int, RegClass::Float];

    #[inline]
    pub const fn ix(self) -> usize {
        match self {
            RegClass::Int => 0,
            RegClass::Float => 1,
        }
    }

    pub const fn suffix(self) -> &'static str {
        match self {
            RegClass::Int => "i",
            RegClass::Float => "f",
        }
    }

    pub fn from_suffix(s: &str) -> Option<RegClass> {
        match s {
            "i" => Some(RegClass::Int),
            "f" => Some(RegClass::Float),
            _ => None,
        }
    }
}
impl Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegClass::Int => write!(f, "int"),
            RegClass::Float => write!(f, "float"),
        }
    }
}

/// Stack slot holding a spilled live range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpillSlot(pub u32);
impl fmt::Display for SpillSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ss{}", self.0)
    }
}
impl fmt::Debug for SpillSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(self, f) }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Opcode {
    Param(u32),
    ConI(i64),
    /// bit pattern of an f64
    ConF(u64),
    AddI,
    SubI,
    MulI,
    AndI,
    CmpI,
    AddF,
    SubF,
    MulF,
    DivF,
    ConvI2F,
    LoadI,
    LoadF,
    StoreI,
    StoreF,
    Phi,
    Copy,
    SpillStore(SpillSlot),
    SpillLoad(SpillSlot),
    Goto,
    If,
    Return,
}

impl Opcode {
    pub fn con_f(value: f64) -> Opcode {
        Opcode::ConF(value.to_bits())
    }

    /// Floating nodes carry no control dependence and are placed by global code motion.
    pub const fn is_floating(&self) -> bool {
        use Opcode::*;
        matches!(self, ConI(_) | ConF(_) | AddI | SubI | MulI | AndI | CmpI | AddF | SubF | MulF | DivF | ConvI2F)
    }

    pub const fn is_terminator(&self) -> bool {
        matches!(self, Opcode::Goto | Opcode::If | Opcode::Return)
    }

    /// Memory operations keep their relative program order inside a block.
    pub const fn is_memory(&self) -> bool {
        matches!(self, Opcode::LoadI | Opcode::LoadF | Opcode::StoreI | Opcode::StoreF)
    }

    pub const fn is_spill_code(&self) -> bool {
        matches!(self, Opcode::SpillStore(_) | Opcode::SpillLoad(_))
    }

    pub const fn is_commutative(&self) -> bool {
        matches!(self, Opcode::AddI | Opcode::MulI | Opcode::AndI | Opcode::AddF | Opcode::MulF)
    }

    /// Input that may be replaced by a stack-slot memory operand (`op reg, [slot]`).
    pub const fn cisc_operand(&self) -> Option<usize> {
        use Opcode::*;
        match self {
            AddI | SubI | MulI | AndI | CmpI | AddF | SubF | MulF | DivF => Some(1),
            _ => None,
        }
    }

    pub const fn arity(&self) -> Option<usize> {
        use Opcode::*;
        match self {
            Param(_) | ConI(_) | ConF(_) | Goto => Some(0),
            AddI | SubI | MulI | AndI | CmpI | AddF | SubF | MulF | DivF | StoreI | StoreF => Some(2),
            ConvI2F | LoadI | LoadF | Copy | SpillStore(_) | SpillLoad(_) | If => Some(1),
            Phi | Return => None,
        }
    }

    /// Result class implied by the opcode. `None` for opcodes that produce no value
    /// and for those whose class is chosen by the creator (params, phis, copies, reloads).
    pub const fn fixed_result_class(&self) -> Option<RegClass> {
        use Opcode::*;
        match self {
            ConI(_) | AddI | SubI | MulI | AndI | CmpI | LoadI => Some(RegClass::Int),
            ConF(_) | AddF | SubF | MulF | DivF | ConvI2F | LoadF => Some(RegClass::Float),
            _ => None,
        }
    }

    pub const fn has_free_result_class(&self) -> bool {
        matches!(self, Opcode::Param(_) | Opcode::Phi | Opcode::Copy | Opcode::SpillLoad(_))
    }

    /// Expected class of input `i`, if constrained.
    pub const fn input_class(&self, i: usize) -> Option<RegClass> {
        use Opcode::*;
        match (self, i) {
            (AddI | SubI | MulI | AndI | CmpI, _) => Some(RegClass::Int),
            (AddF | SubF | MulF | DivF, _) => Some(RegClass::Float),
            (ConvI2F | LoadI | LoadF | If, 0) => Some(RegClass::Int),
            (StoreI | StoreF, 0) => Some(RegClass::Int),
            (StoreI, 1) => Some(RegClass::Int),
            (StoreF, 1) => Some(RegClass::Float),
            _ => None,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        use Opcode::*;
        match self {
            Param(_) => "param",
            ConI(_) => "con.i",
            ConF(_) => "con.f",
            AddI => "add.i",
            SubI => "sub.i",
            MulI => "mul.i",
            AndI => "and.i",
            CmpI => "cmp.i",
            AddF => "add.f",
            SubF => "sub.f",
            MulF => "mul.f",
            DivF => "div.f",
            ConvI2F => "conv.i2f",
            LoadI => "load.i",
            LoadF => "load.f",
            StoreI => "store.i",
            StoreF => "store.f",
            Phi => "phi",
            Copy => "copy",
            SpillStore(_) => "spill",
            SpillLoad(_) => "reload",
            Goto => "goto",
            If => "if",
            Return => "ret",
        }
    }

    /// Inverse of [`Opcode::mnemonic`] for opcodes without an immediate.
    pub fn from_mnemonic(s: &str) -> Option<Opcode> {
        use Opcode::*;
        Some(match s {
            "add.i" => AddI,
            "sub.i" => SubI,
            "mul.i" => MulI,
            "and.i" => AndI,
            "cmp.i" => CmpI,
            "add.f" => AddF,
            "sub.f" => SubF,
            "mul.f" => MulF,
            "div.f" => DivF,
            "conv.i2f" => ConvI2F,
            "load.i" => LoadI,
            "load.f" => LoadF,
            "store.i" => StoreI,
            "store.f" => StoreF,
            _ => return None,
        })
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Param(i) => write!(f, "param #{i}"),
            Opcode::ConI(v) => write!(f, "con.i {v}"),
            Opcode::ConF(bits) => write!(f, "con.f {}", f64::from_bits(*bits)),
            Opcode::SpillStore(slot) => write!(f, "spill {slot}"),
            Opcode::SpillLoad(slot) => write!(f, "reload {slot}"),
            op => write!(f, "{}", op.mnemonic()),
        }
    }
}

/// Input `input` of the owning node was folded into a stack-slot memory operand.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MemOperand {
    pub input: u8,
    pub slot: SpillSlot,
}

#[derive(Clone, PartialEq, Debug)]
pub struct Node {
    pub id: NodeId,
    pub op: Opcode,
    pub inputs: SmallVec<[NodeId; 3]>,
    /// register class of the produced value, `None` if the node produces no register value
    pub class: Option<RegClass>,
    /// pinned block, `None` for floating nodes
    pub control: Option<BlockId>,
    /// current placement
    pub block: BlockId,
    pub mem_operand: Option<MemOperand>,
    pub dead: bool,
}

impl Node {
    pub fn is_pinned(&self) -> bool {
        self.control.is_some()
    }

    pub fn is_value(&self) -> bool {
        self.class.is_some()
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.op, Opcode::Phi)
    }

    pub fn is_copy(&self) -> bool {
        matches!(self.op, Opcode::Copy)
    }

    pub fn spill_slot(&self) -> Option<SpillSlot> {
        match self.op {
            Opcode::SpillStore(slot) | Opcode::SpillLoad(slot) => Some(slot),
            _ => None,
        }
    }

    /// Inputs read from a register (the folded memory operand is excluded).
    pub fn register_inputs(&self) -> impl Iterator<Item = (usize, NodeId)> + '_ {
        let mem = self.mem_operand.map(|m| m.input as usize);
        self.inputs.iter().copied().enumerate().filter(move |(i, _)| Some(*i) != mem)
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(class) = self.class {
            match self.op {
                Opcode::Param(_) | Opcode::Phi | Opcode::Copy | Opcode::SpillLoad(_) =>
                    write!(f, "{} = {}.{}", self.id, self.op, class.suffix())?,
                _ => write!(f, "{} = {}", self.id, self.op)?,
            }
        } else {
            write!(f, "{}", self.op)?;
        }
        let mem = self.mem_operand;
        let args: SmallVec<[String; 3]> = self.inputs.iter().enumerate().map(|(i, input)| {
            match mem {
                Some(m) if m.input as usize == i => format!("[{}]", m.slot),
                _ => input.to_string(),
            }
        }).collect();
        if !args.is_empty() {
            write!(f, " {}", args.join(", "))?;
        }
        Ok(())
    }
}
