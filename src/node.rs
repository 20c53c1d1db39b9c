//! Node orchestrator: owns the current head, the block repository and the
//! miner loop. Every new head goes through the same bookkeeping whether it
//! was mined here, received from a peer, or replayed from storage.

use crate::blockchain::{Block, Chain, Committed, MAX_FORK_HOPS};
use crate::crypto::Sha256Hash;
use crate::config::Config;
use crate::error::ChainError;
use crate::operation::{now_millis, Deposit, Offer, OfferCancel, Transaction, Withdrawal};
use crate::persistence::{open_repository, BlockPersistInfo, BlockRepository, BlockStats};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How a block offered to the node was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Extended,
    Forked,
    /// Already known, or valid but not deeper than the current head.
    Ignored,
    Rejected,
}

pub struct Node {
    config: Config,
    repository: Box<dyn BlockRepository>,
    head: RwLock<Arc<Chain>>,
    /// Valid branches that are not deeper than the head, kept so later
    /// blocks can extend them.
    branches: Mutex<Vec<Arc<Chain>>>,
}

/// Side branches remembered at most.
const MAX_BRANCHES: usize = 8;

impl Node {
    pub fn open(config: Config) -> Result<Node, ChainError> {
        let repository = open_repository(&config.database.path)?;
        Node::with_repository(config, repository)
    }

    /// Builds a node over `repository`, replaying every stored block.
    pub fn with_repository(config: Config, repository: Box<dyn BlockRepository>) -> Result<Node, ChainError> {
        config.validate()?;
        let node = Node {
            head: RwLock::new(Chain::new(config.chain_settings())),
            branches: Mutex::new(Vec::new()),
            config,
            repository,
        };
        node.replay()?;
        Ok(node)
    }

    fn replay(&self) -> Result<(), ChainError> {
        if let Some(info) = self.repository.get_persist_info()? {
            debug!(hash = %info.block_hash, "last persisted block");
        }

        let mut replayed = 0u64;
        for block in self.repository.get_range(0, None)?.iter() {
            match self.resolve(block?, true) {
                BlockOutcome::Rejected => {}
                _ => replayed += 1,
            }
        }

        let head = self.head();
        info!(blocks = replayed, depth = ?head.depth(), "replayed stored blocks");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &dyn BlockRepository {
        self.repository.as_ref()
    }

    pub fn head(&self) -> Arc<Chain> {
        self.head.read().clone()
    }

    pub fn block_stats(&self) -> Result<BlockStats, ChainError> {
        self.repository.get_block_stats()
    }

    /// Installs `next` as the head if it is deeper than the current one,
    /// then persists the blocks the repository lacks and trims history.
    fn adopt(&self, next: &Arc<Chain>, persist: bool) -> Result<bool, ChainError> {
        {
            let mut head = self.head.write();
            if next.depth() <= head.depth() {
                debug!(depth = ?next.depth(), current = ?head.depth(), "not adopting shallower branch");
                return Ok(false);
            }
            if !head.is_closed() {
                head.stop_mining();
            }
            *head = next.clone();
        }
        next.update_pool();
        self.branches.lock().retain(|branch| !Arc::ptr_eq(branch, next));

        if persist {
            self.persist(next)?;
        }
        next.cleanup();
        Ok(true)
    }

    fn persist(&self, head: &Arc<Chain>) -> Result<(), ChainError> {
        let mut missing = Vec::new();
        for block in head.blocks_new_to_old().into_iter().take(MAX_FORK_HOPS + 1) {
            if self.repository.contains(&block.hash_str())? {
                break;
            }
            missing.push(block);
        }
        for block in missing.iter().rev() {
            self.repository.save(block)?;
            self.repository.save_persist_info(&BlockPersistInfo {
                block_hash: block.hash_str(),
                timestamp: now_millis(),
            })?;
        }
        Ok(())
    }

    fn adopt_logged(&self, next: &Arc<Chain>, persist: bool) -> bool {
        match self.adopt(next, persist) {
            Ok(adopted) => adopted,
            Err(e) => {
                error!(depth = ?next.depth(), error = %e, "failed to persist block");
                true
            }
        }
    }

    fn remember_branch(&self, branch: Arc<Chain>) {
        let depth = self.head().depth().unwrap_or(0);
        let mut branches = self.branches.lock();
        branches.retain(|b| b.depth().map_or(false, |d| d + MAX_FORK_HOPS as u64 >= depth));
        branches.push(branch);
        if branches.len() > MAX_BRANCHES {
            branches.remove(0);
        }
    }

    fn take_branch(&self, previous_hash: &Sha256Hash) -> Option<Arc<Chain>> {
        let mut branches = self.branches.lock();
        let index = branches
            .iter()
            .position(|b| b.block().is_some_and(|block| block.hash() == *previous_hash))?;
        Some(branches.remove(index))
    }

    /// Places `block` on the head, on a remembered side branch, or on a fork
    /// from a recent ancestor. With `seed`, the block's own operations are
    /// put into the target pool first, as when replaying stored blocks.
    fn resolve(&self, block: Block, seed: bool) -> BlockOutcome {
        let head = self.head();
        if head.contains_block(&block) {
            debug!(hash = %block.hash_str(), "block already known");
            return BlockOutcome::Ignored;
        }

        let extends = match (head.block(), block.header.previous_hash) {
            (None, None) => true,
            (Some(current), Some(previous)) => current.hash() == previous,
            _ => false,
        };

        let (next, outcome) = if extends {
            if seed {
                head.pool().add_block_operations(&block);
            }
            (head.append_block(block), BlockOutcome::Extended)
        } else if let Some(branch) = block.header.previous_hash.and_then(|p| self.take_branch(&p)) {
            if seed {
                branch.pool().add_block_operations(&block);
            }
            let next = branch.append_block(block);
            match &next {
                Some(extended) => extended.update_pool(),
                None => self.remember_branch(branch),
            }
            (next, BlockOutcome::Forked)
        } else if head.can_fork(&block) {
            let pool = Arc::new(head.pool().copy());
            if seed {
                pool.add_block_operations(&block);
            }
            (head.fork(block, pool), BlockOutcome::Forked)
        } else {
            debug!(depth = block.depth(), hash = %block.hash_str(), "block does not attach to any recent ancestor");
            return BlockOutcome::Rejected;
        };

        let Some(next) = next else {
            return BlockOutcome::Rejected;
        };
        if self.adopt_logged(&next, !seed) {
            if outcome == BlockOutcome::Forked {
                info!(depth = ?next.depth(), "switched to deeper branch");
            }
            return outcome;
        }
        debug!(depth = ?next.depth(), "keeping branch that is not deeper than head");
        self.remember_branch(next);
        BlockOutcome::Ignored
    }

    pub fn submit<T: Committed>(&self, op: T) -> bool {
        self.head().append(op)
    }

    pub fn submit_transaction(&self, tx: Transaction) -> bool {
        self.submit(tx)
    }

    pub fn submit_deposit(&self, deposit: Deposit) -> bool {
        self.submit(deposit)
    }

    pub fn submit_withdrawal(&self, withdrawal: Withdrawal) -> bool {
        self.submit(withdrawal)
    }

    pub fn submit_offer(&self, offer: Offer) -> bool {
        self.submit(offer)
    }

    pub fn submit_offer_cancel(&self, cancel: OfferCancel) -> bool {
        self.submit(cancel)
    }

    /// Offers a block from elsewhere: it either extends the head, extends
    /// or opens a side branch, or is rejected. A branch only becomes the
    /// head once it is deeper.
    pub fn receive_block(&self, block: Block) -> BlockOutcome {
        self.resolve(block, false)
    }

    /// Mines one block on the current head.
    pub async fn mine_once(&self) -> Option<Arc<Chain>> {
        let head = self.head();
        let next = head.start_mining().await?;
        if self.adopt_logged(&next, true) {
            Some(next)
        } else {
            None
        }
    }

    /// Mines until `cancel` fires or `max_blocks` blocks have been produced.
    /// Returns the number of blocks mined.
    pub async fn run_miner(&self, cancel: CancellationToken, max_blocks: Option<u64>) -> u64 {
        let idle = Duration::from_millis(self.config.miner.idle_delay_ms);
        let mut mined = 0u64;
        info!(wallet = %self.config.miner.wallet, "miner started");

        while max_blocks.map_or(true, |max| mined < max) {
            let head = self.head();
            tokio::select! {
                _ = cancel.cancelled() => {
                    head.stop_mining();
                    break;
                }
                result = self.mine_once() => match result {
                    Some(_) => mined += 1,
                    None => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(idle) => {}
                        }
                    }
                }
            }
        }

        info!(mined, "miner stopped");
        mined
    }
}
