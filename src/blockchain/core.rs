// core.rs splits the chain state machine into submodules: the block record,
// the persistent node list, and the mining, validation, fork and retarget
// paths that extend it.
pub mod block;
pub mod chain;
pub mod difficulty;
pub mod fork;
pub mod mining;
pub mod validation;

pub use block::*;
pub use chain::*;
pub use difficulty::*;
pub use fork::*;
pub use mining::*;
