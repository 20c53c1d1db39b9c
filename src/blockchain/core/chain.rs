use super::block::{Block, BlockIndexed};
use crate::crypto::Sha256Hash;
use crate::error::ChainError;
use crate::manager::{Ledger, OfferBook};
use crate::operation::{Amount, Deposit, Offer, OfferCancel, Operation, Trade, Transaction, Withdrawal};
use crate::pool::Pool;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default genesis proof-of-work target, in leading zero bits.
pub const GENESIS_DIFFICULTY: u32 = 21;

/// How far `get_trades` and `get_processed_offers` look back.
pub const RECENT_HISTORY_HOPS: usize = 17;

/// Default number of ancestors kept reachable in memory by `cleanup`.
pub const RETENTION_DEPTH: usize = 39;

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub miner_wallet: String,
    pub genesis_difficulty: u32,
    /// Hops of history `cleanup` keeps reachable.
    pub retention_depth: usize,
}

impl Default for ChainSettings {
    fn default() -> Self {
        ChainSettings {
            miner_wallet: String::new(),
            genesis_difficulty: GENESIS_DIFFICULTY,
            retention_depth: RETENTION_DEPTH,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CommitState {
    pub(crate) mining: bool,
    pub(crate) mined: bool,
}

/// One link of the ledger: a committed block, the manager versions that
/// resulted from it, and a pointer to the node it extends.
///
/// A node with neither block nor predecessor is the pre-genesis root.
/// Everything but the commit state and the backward pointer is fixed at
/// construction.
pub struct Chain {
    id: Uuid,
    block: Option<Arc<Block>>,
    previous: RwLock<Option<Arc<Chain>>>,
    pool: Arc<Pool>,
    ledger: Ledger,
    settings: Arc<ChainSettings>,
    pub(crate) commit_lock: Mutex<CommitState>,
    pub(crate) cancel: CancellationToken,
}

impl Chain {
    /// Pre-genesis root with an empty pool.
    pub fn new(settings: ChainSettings) -> Arc<Chain> {
        Chain::with_pool(settings, Arc::new(Pool::new()))
    }

    pub fn with_pool(settings: ChainSettings, pool: Arc<Pool>) -> Arc<Chain> {
        Arc::new(Chain::build(None, None, Ledger::new(), pool, Arc::new(settings)))
    }

    fn build(
        previous: Option<Arc<Chain>>,
        block: Option<Arc<Block>>,
        ledger: Ledger,
        pool: Arc<Pool>,
        settings: Arc<ChainSettings>,
    ) -> Chain {
        Chain {
            id: Uuid::new_v4(),
            block,
            previous: RwLock::new(previous),
            pool,
            ledger,
            settings,
            commit_lock: Mutex::new(CommitState::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Replacement for this node sharing its block and managers but with a
    /// fresh slot, used as the base of a fork.
    pub(crate) fn rebuilt(&self, pool: Arc<Pool>) -> Arc<Chain> {
        Arc::new(Chain::build(
            self.previous(),
            self.block.clone(),
            self.ledger.clone(),
            pool,
            self.settings.clone(),
        ))
    }

    /// Claims this node's next-block slot and builds the successor. Fails
    /// with `SlotFilled` if another block already won the slot.
    pub(crate) fn commit(self: &Arc<Self>, block: Block, ledger: Ledger, mined: bool) -> Result<Arc<Chain>, ChainError> {
        let mut state = self.commit_lock.lock();
        state.mining = false;
        if self.cancel.is_cancelled() {
            return Err(ChainError::SlotFilled);
        }
        self.cancel.cancel();
        state.mined = mined;
        debug!(depth = block.depth(), hash = %block.hash_str(), mined, "committed block");
        Ok(Arc::new(Chain::build(
            Some(self.clone()),
            Some(Arc::new(block)),
            ledger,
            self.pool.clone(),
            self.settings.clone(),
        )))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn block(&self) -> Option<&Arc<Block>> {
        self.block.as_ref()
    }

    pub fn previous(&self) -> Option<Arc<Chain>> {
        self.previous.read().clone()
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn settings(&self) -> &ChainSettings {
        &self.settings
    }

    pub fn depth(&self) -> Option<u64> {
        self.block.as_ref().map(|b| b.depth())
    }

    /// Number of blocks up to and including this node's.
    pub fn count(&self) -> u64 {
        self.depth().map_or(0, |d| d + 1)
    }

    pub fn is_mining(&self) -> bool {
        self.commit_lock.lock().mining
    }

    pub fn is_mined(&self) -> bool {
        self.commit_lock.lock().mined
    }

    /// True once the next-block slot has been filled or abandoned.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// This node followed by each predecessor still reachable in memory.
    pub fn ancestors(self: &Arc<Self>) -> Ancestors {
        Ancestors {
            next: Some(self.clone()),
        }
    }

    /// Nodes that carry a block, newest first.
    fn committed(self: &Arc<Self>) -> impl Iterator<Item = Arc<Chain>> {
        self.ancestors().take_while(|node| node.block.is_some())
    }

    pub fn blocks_new_to_old(self: &Arc<Self>) -> Vec<Arc<Block>> {
        self.committed().filter_map(|node| node.block.clone()).collect()
    }

    pub fn blocks_old_to_new(self: &Arc<Self>) -> Vec<Arc<Block>> {
        let mut blocks = self.blocks_new_to_old();
        blocks.reverse();
        blocks
    }

    /// Pending in the pool, committed in a reachable block, or (for offers)
    /// already known to the order book.
    pub fn contains<T: Committed>(self: &Arc<Self>, op: &T) -> bool {
        self.pool.contains(op) || T::known_to_ledger(&self.ledger, op) || self.contains_committed(op)
    }

    /// Block membership only; the pool is not consulted.
    pub fn contains_committed<T: Committed>(self: &Arc<Self>, op: &T) -> bool {
        let hash = op.hash();
        self.committed()
            .any(|node| node.block.as_ref().is_some_and(|b| b.contains::<T>(&hash)))
    }

    pub fn contains_block(self: &Arc<Self>, block: &Block) -> bool {
        self.committed()
            .any(|node| node.block.as_ref().is_some_and(|b| b.hash() == block.hash()))
    }

    /// Queues an operation for a future block. Returns false for duplicates
    /// and for operations that fail stateless validation.
    pub fn append<T: Committed>(self: &Arc<Self>, op: T) -> bool {
        if let Err(e) = T::admissible(&op) {
            warn!(kind = T::KIND, hash = %op.hash_str(), error = %e, "rejected operation");
            return false;
        }
        if self.contains(&op) {
            debug!(kind = T::KIND, hash = %op.hash_str(), "duplicate operation");
            return false;
        }
        self.pool.add(op)
    }

    /// Committed operation by hash, searching reachable blocks newest first.
    pub fn get<T: Committed>(self: &Arc<Self>, hash: &Sha256Hash) -> Option<T> {
        self.committed()
            .find_map(|node| node.block.as_ref().and_then(|b| b.get::<T>(hash).cloned()))
    }

    pub fn get_processed_offer(self: &Arc<Self>, hash: &str) -> Option<Offer> {
        self.committed()
            .find_map(|node| node.ledger.book.get_processed_offer(hash).cloned())
    }

    /// Pending operations followed by every committed one, newest block first.
    pub fn all<T: Committed>(self: &Arc<Self>) -> Vec<T> {
        let mut result = self.pool.snapshot::<T>();
        for block in self.blocks_new_to_old() {
            result.extend(T::operations(&block).iter().cloned());
        }
        result
    }

    pub fn all_transactions(self: &Arc<Self>) -> Vec<Transaction> {
        self.all()
    }

    pub fn all_deposits(self: &Arc<Self>) -> Vec<Deposit> {
        self.all()
    }

    pub fn all_withdrawals(self: &Arc<Self>) -> Vec<Withdrawal> {
        self.all()
    }

    pub fn all_offers(self: &Arc<Self>) -> Vec<Offer> {
        self.all()
    }

    pub fn all_offer_cancels(self: &Arc<Self>) -> Vec<OfferCancel> {
        self.all()
    }

    pub fn get_balance(&self, wallet: &str) -> HashMap<String, Amount> {
        self.ledger.transact.balance(wallet)
    }

    pub fn get_book(&self, asset: &str) -> Option<OfferBook> {
        self.ledger.book.get_book(asset).cloned()
    }

    /// Book managers of the recent window, oldest first. A node whose book
    /// is shared with its predecessor did not trade and is skipped.
    fn recent_books(self: &Arc<Self>) -> Vec<Arc<Chain>> {
        let mut nodes: Vec<Arc<Chain>> = self.committed().take(RECENT_HISTORY_HOPS + 1).collect();
        nodes.reverse();
        let mut result: Vec<Arc<Chain>> = Vec::with_capacity(nodes.len());
        for node in nodes {
            let shared = node
                .previous()
                .is_some_and(|prev| Arc::ptr_eq(&prev.ledger.book, &node.ledger.book));
            if !shared {
                result.push(node);
            }
        }
        result
    }

    /// Trades executed on `asset` in the recent window, oldest first.
    pub fn get_trades(self: &Arc<Self>, asset: &str) -> Vec<Trade> {
        self.recent_books()
            .iter()
            .flat_map(|node| node.ledger.book.get_trades(asset))
            .collect()
    }

    /// Offers placed by `wallet` in the recent window, oldest first.
    pub fn get_processed_offers(self: &Arc<Self>, wallet: &str) -> Vec<Offer> {
        self.recent_books()
            .iter()
            .flat_map(|node| node.ledger.book.get_processed_offers(wallet))
            .collect()
    }

    /// The committed ancestor `limit + 1` hops back, if every node on the
    /// way still carries a block.
    pub fn get_ancestor(self: &Arc<Self>, limit: usize) -> Option<Arc<Chain>> {
        let mut node = self.clone();
        for _ in 0..limit {
            let previous = node.previous().filter(|p| p.block.is_some())?;
            node = previous;
        }
        node.previous().filter(|p| p.block.is_some())
    }

    /// Detaches history beyond the retention window and returns the detached
    /// part, which the caller may drop.
    pub fn cleanup(self: &Arc<Self>) -> Option<Arc<Chain>> {
        let terminal = self.get_ancestor(self.settings.retention_depth)?;
        let detached = terminal.previous.write().take();
        if let Some(detached) = &detached {
            debug!(terminal = terminal.depth(), detached = detached.depth(), "detached old chain history");
        }
        detached
    }

    /// Drops this node's committed operations from the shared pool.
    pub fn update_pool(&self) {
        if let Some(block) = &self.block {
            self.pool.remove_block_operations(block);
        }
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("id", &self.id)
            .field("depth", &self.depth())
            .field("hash", &self.block.as_ref().map(|b| b.hash_str()))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Chain {
    // Unlink iteratively so dropping a long branch cannot overflow the stack.
    fn drop(&mut self) {
        let mut next = self.previous.get_mut().take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.previous.get_mut().take(),
                Err(_) => break,
            }
        }
    }
}

pub struct Ancestors {
    next: Option<Arc<Chain>>,
}

impl Iterator for Ancestors {
    type Item = Arc<Chain>;

    fn next(&mut self) -> Option<Arc<Chain>> {
        let current = self.next.take()?;
        self.next = current.previous();
        Some(current)
    }
}

/// Operations a chain node accepts, indexes and deduplicates.
pub trait Committed: BlockIndexed {
    /// Checks run before an operation enters the pool.
    fn admissible(op: &Self) -> Result<(), ChainError> {
        op.validate()?;
        op.validate_size()
    }

    fn known_to_ledger(_ledger: &Ledger, _op: &Self) -> bool {
        false
    }
}

impl Committed for Deposit {}

impl Committed for Withdrawal {}

impl Committed for OfferCancel {}

impl Committed for Transaction {
    fn admissible(op: &Self) -> Result<(), ChainError> {
        if op.is_reward_shaped() {
            return Err(ChainError::InvalidOperation(
                "reward transactions are synthesized by miners".to_string(),
            ));
        }
        op.validate()?;
        op.validate_size()
    }
}

impl Committed for Offer {
    fn known_to_ledger(ledger: &Ledger, op: &Self) -> bool {
        ledger.book.contains_offer(op)
    }
}
