//! Difficulty retargeting.
//!
//! Once the head is at least `ADJUSTMENT_WINDOW` blocks past the oldest
//! block still in memory, the target moves by one bit depending on the
//! average spacing of the last `ADJUSTMENT_WINDOW` blocks. The head and its
//! `STABILITY_SPAN` predecessors must all share one difficulty before any
//! change is made.

use super::chain::Chain;
use std::sync::Arc;

pub const ADJUSTMENT_WINDOW: u64 = 20;
pub const STABILITY_SPAN: usize = 5;
pub const MIN_DIFFICULTY_FOR_DECREASE: u32 = 15;
/// Average spacing above which the target is lowered, in seconds.
pub const SLOW_BLOCK_SECS: f64 = 40.0;
/// Average spacing below which the target is raised, in seconds.
pub const FAST_BLOCK_SECS: f64 = 20.0;

impl Chain {
    /// Depth of the oldest block still reachable from this node.
    pub fn last_block_depth(self: &Arc<Self>) -> Option<u64> {
        self.ancestors().filter_map(|node| node.depth()).last()
    }

    /// Timestamp of the oldest block at most `limit` hops back.
    pub fn last_block_time(self: &Arc<Self>, limit: usize) -> Option<u64> {
        self.ancestors()
            .take(limit + 1)
            .filter_map(|node| node.block().map(|b| b.timestamp()))
            .last()
    }

    /// True when the next block's difficulty is subject to retargeting.
    pub fn retargets(self: &Arc<Self>) -> bool {
        match (self.depth(), self.last_block_depth()) {
            (Some(depth), Some(oldest)) => depth >= oldest + ADJUSTMENT_WINDOW,
            _ => false,
        }
    }

    fn difficulty_is_stable(self: &Arc<Self>, difficulty: u32) -> bool {
        let span: Vec<u32> = self
            .ancestors()
            .take(STABILITY_SPAN + 1)
            .filter_map(|node| node.block().map(|b| b.header.difficulty))
            .collect();
        span.len() == STABILITY_SPAN + 1 && span.iter().all(|d| *d == difficulty)
    }

    /// Difficulty the next block on top of this node must declare.
    pub fn target_difficulty(self: &Arc<Self>) -> u32 {
        let Some(current) = self.block() else {
            return self.settings().genesis_difficulty;
        };
        let difficulty = current.header.difficulty;
        if !self.retargets() {
            return difficulty;
        }

        let window_start = self
            .last_block_time(ADJUSTMENT_WINDOW as usize)
            .unwrap_or(current.timestamp());
        let frame_ms = current.timestamp().saturating_sub(window_start);
        let avg_secs = frame_ms as f64 / 1000.0 / ADJUSTMENT_WINDOW as f64;

        if !self.difficulty_is_stable(difficulty) {
            return difficulty;
        }
        if avg_secs > SLOW_BLOCK_SECS && difficulty > MIN_DIFFICULTY_FOR_DECREASE {
            difficulty - 1
        } else if avg_secs < FAST_BLOCK_SECS {
            difficulty + 1
        } else {
            difficulty
        }
    }
}
