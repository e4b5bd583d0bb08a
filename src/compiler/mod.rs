pub mod config;
pub mod error;
pub mod ops;
pub mod arena;
pub mod cfg;
pub mod analyzer;
pub mod lcm;
pub mod pressure;
pub mod gcm;
pub mod ifg;
pub mod chaitin;
pub mod spill;
pub mod peephole;
pub mod verify;
pub mod compile;
pub mod test_utils;
#[cfg(test)]
mod tests;
