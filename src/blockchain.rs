// Thin re-export module: implementation is in `blockchain/core.rs`, split
// into block, chain node, validation, mining, fork and difficulty parts.

pub mod core;
pub use core::*;
