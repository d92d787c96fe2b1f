//! Foundation Session Service (spec §4.4): a process-level wrapper around
//! an on-device platform language model, independent of the MLX path.

pub mod randomness;
pub mod session;
