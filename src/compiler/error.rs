use thiserror::Error;

use crate::compiler::ops::{BlockId, NodeId, RegClass};

/// Reasons a compilation is abandoned. None of these reach the running program:
/// the method keeps executing in a lower tier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),
    #[error("No legal block for {node}: earliest {early} does not dominate latest {late}")]
    NoLegalBlock { node: NodeId, early: BlockId, late: BlockId },
    #[error("Cyclic data dependence through {node}")]
    CyclicDependence { node: NodeId },
    #[error("Register allocation did not converge after {rounds} spill rounds")]
    SpillNonConvergence { rounds: u32 },
    #[error("Live range of {node} ({class}) is uncolorable and cannot be spilled")]
    Uncolorable { node: NodeId, class: RegClass },
    #[error("Node index {node} is beyond the register map capacity {capacity}")]
    NodeIndexOverflow { node: NodeId, capacity: usize },
    #[error("Stale pressure for {block}: recorded {recorded:?}, recomputed {recomputed:?}")]
    PressureMismatch { block: BlockId, recorded: [u32; RegClass::COUNT], recomputed: [u32; RegClass::COUNT] },
    #[error("Dataflow analysis did not reach a fixpoint after {iterations} iterations")]
    DataflowDiverged { iterations: usize },
    #[error("Register verification failed at {node}: {reason}")]
    VerificationFailed { node: NodeId, reason: String },
    #[error("Compilation aborted")]
    Aborted,
}

impl CompileError {
    /// Internal invariant violations point at a bug in an earlier pass rather than at the input.
    pub fn is_internal(&self) -> bool {
        !matches!(self, CompileError::Aborted | CompileError::MalformedGraph(_))
    }
}
