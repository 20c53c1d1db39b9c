//! Fork resolution.
//!
//! A block that does not extend the head may still extend a recent ancestor.
//! The fork is rebuilt from that ancestor with a fresh slot and its own pool;
//! every operation of the abandoned blocks goes back into that pool so it
//! can be mined again on the new branch.

use super::block::Block;
use super::chain::Chain;
use crate::pool::Pool;
use std::sync::Arc;
use tracing::{debug, info};

/// How many ancestors a fork point may lie behind the head.
pub const MAX_FORK_HOPS: usize = 20;

impl Chain {
    /// True if `block` extends this node or one of its recent ancestors.
    pub fn can_fork(self: &Arc<Self>, block: &Block) -> bool {
        if block.is_genesis_shaped() {
            return true;
        }
        let Some(previous_hash) = block.header.previous_hash else {
            return false;
        };
        self.committed_window()
            .any(|node| node.block().is_some_and(|b| b.hash() == previous_hash))
    }

    fn committed_window(self: &Arc<Self>) -> impl Iterator<Item = Arc<Chain>> {
        self.ancestors()
            .take(MAX_FORK_HOPS + 1)
            .take_while(|node| node.block().is_some())
    }

    /// Rebuilds the branch at the ancestor `block` extends, re-seeds `pool`
    /// with the operations of every block above that ancestor, and validates
    /// `block` on top. Returns the new head of the fork.
    pub fn fork(self: &Arc<Self>, block: Block, pool: Arc<Pool>) -> Option<Arc<Chain>> {
        let mut orphaned: Vec<Arc<Block>> = Vec::new();
        let mut base = None;

        match block.header.previous_hash {
            Some(previous_hash) => {
                for node in self.committed_window() {
                    let Some(current) = node.block() else { break };
                    if current.hash() == previous_hash {
                        base = Some(node.rebuilt(pool.clone()));
                        break;
                    }
                    orphaned.push(current.clone());
                }
            }
            None if block.is_genesis_shaped() => {
                orphaned = self.blocks_new_to_old();
                base = Some(Chain::with_pool(self.settings().clone(), pool.clone()));
            }
            None => {}
        }

        let Some(base) = base else {
            debug!(depth = block.depth(), "no fork point within reach");
            return None;
        };

        for abandoned in orphaned.iter().rev() {
            pool.add_block_operations(abandoned);
        }
        info!(
            fork_depth = base.depth(),
            orphaned = orphaned.len(),
            pending = pool.len(),
            "forking chain"
        );

        let head = base.append_block(block)?;
        head.update_pool();
        Some(head)
    }
}
