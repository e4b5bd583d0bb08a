//! # optoreg
//! The back half of an optimizing JIT compiler: pressure-aware global code motion over a
//! sea-of-nodes graph, Chaitin/Briggs register allocation with spilling and CISC-spill
//! folding, and a register map that stays addressable while spill code keeps adding nodes.
//!
//! Compilation of one method runs on one thread and publishes its result only when every
//! phase succeeded; see [`compiler::compile::CompileBroker`]. The [`gc`] module keeps the
//! pause and CPU-time counters a runtime exposes next to its compiler.
pub mod compiler;
pub mod gc;
pub mod parser;
