//! Pending-operation pool (mempool)
//!
//! Five independent sub-pools keyed by operation content hash. A pool is
//! shared by `Arc` down a branch of chain nodes and copied when a fork
//! rebuilds the branch. Each sub-pool keeps insertion order so block
//! assembly iterates deterministically.

use crate::blockchain::Block;
use crate::crypto::Sha256Hash;
use crate::operation::{Deposit, Offer, OfferCancel, Operation, Transaction, Withdrawal};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

struct Entries<T> {
    items: HashMap<Sha256Hash, (u64, T)>,
    next_seq: u64,
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            next_seq: 0,
        }
    }
}

/// One operation kind's pending set.
pub struct SubPool<T> {
    entries: RwLock<Entries<T>>,
}

impl<T> Default for SubPool<T> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
        }
    }
}

impl<T: Operation> SubPool<T> {
    /// Returns false when an operation with the same hash is already pending.
    pub fn add(&self, op: T) -> bool {
        let hash = op.hash();
        let mut entries = self.entries.write();
        if entries.items.contains_key(&hash) {
            return false;
        }
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.items.insert(hash, (seq, op));
        true
    }

    pub fn remove(&self, ops: &[T]) {
        let mut entries = self.entries.write();
        for op in ops {
            entries.items.remove(&op.hash());
        }
    }

    pub fn contains(&self, op: &T) -> bool {
        self.contains_hash(&op.hash())
    }

    pub fn contains_hash(&self, hash: &Sha256Hash) -> bool {
        self.entries.read().items.contains_key(hash)
    }

    pub fn get(&self, hash: &Sha256Hash) -> Option<T> {
        self.entries.read().items.get(hash).map(|(_, op)| op.clone())
    }

    /// Pending operations in insertion order.
    pub fn snapshot(&self) -> Vec<T> {
        let entries = self.entries.read();
        let mut items: Vec<&(u64, T)> = entries.items.values().collect();
        items.sort_by_key(|(seq, _)| *seq);
        items.into_iter().map(|(_, op)| op.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn copy(&self) -> Self {
        let entries = self.entries.read();
        Self {
            entries: RwLock::new(Entries {
                items: entries.items.clone(),
                next_seq: entries.next_seq,
            }),
        }
    }
}

/// Maps an operation type onto its sub-pool.
pub trait Pooled: Operation {
    fn sub_pool(pool: &Pool) -> &SubPool<Self>;

    /// Normalises an operation before it is stored.
    fn for_pool(self) -> Self {
        self
    }
}

impl Pooled for Transaction {
    fn sub_pool(pool: &Pool) -> &SubPool<Self> {
        &pool.transactions
    }
}

impl Pooled for Deposit {
    fn sub_pool(pool: &Pool) -> &SubPool<Self> {
        &pool.deposits
    }
}

impl Pooled for Withdrawal {
    fn sub_pool(pool: &Pool) -> &SubPool<Self> {
        &pool.withdrawals
    }
}

impl Pooled for Offer {
    fn sub_pool(pool: &Pool) -> &SubPool<Self> {
        &pool.offers
    }

    // Trades are re-derived whenever the offer is processed again.
    fn for_pool(mut self) -> Self {
        self.clean_trades();
        self
    }
}

impl Pooled for OfferCancel {
    fn sub_pool(pool: &Pool) -> &SubPool<Self> {
        &pool.offer_cancels
    }
}

#[derive(Default)]
pub struct Pool {
    transactions: SubPool<Transaction>,
    deposits: SubPool<Deposit>,
    withdrawals: SubPool<Withdrawal>,
    offers: SubPool<Offer>,
    offer_cancels: SubPool<OfferCancel>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<T: Pooled>(&self, op: T) -> bool {
        T::sub_pool(self).add(op.for_pool())
    }

    /// Adds every operation, returning how many were new.
    pub fn add_all<T: Pooled>(&self, ops: impl IntoIterator<Item = T>) -> usize {
        ops.into_iter().map(|op| self.add(op)).filter(|added| *added).count()
    }

    pub fn remove<T: Pooled>(&self, ops: &[T]) {
        T::sub_pool(self).remove(ops);
    }

    pub fn contains<T: Pooled>(&self, op: &T) -> bool {
        T::sub_pool(self).contains(op)
    }

    pub fn get<T: Pooled>(&self, hash: &Sha256Hash) -> Option<T> {
        T::sub_pool(self).get(hash)
    }

    pub fn snapshot<T: Pooled>(&self) -> Vec<T> {
        T::sub_pool(self).snapshot()
    }

    pub fn transactions(&self) -> &SubPool<Transaction> {
        &self.transactions
    }

    pub fn deposits(&self) -> &SubPool<Deposit> {
        &self.deposits
    }

    pub fn withdrawals(&self) -> &SubPool<Withdrawal> {
        &self.withdrawals
    }

    pub fn offers(&self) -> &SubPool<Offer> {
        &self.offers
    }

    pub fn offer_cancels(&self) -> &SubPool<OfferCancel> {
        &self.offer_cancels
    }

    /// Independent copy used when a fork rebuilds a branch.
    pub fn copy(&self) -> Pool {
        Pool {
            transactions: self.transactions.copy(),
            deposits: self.deposits.copy(),
            withdrawals: self.withdrawals.copy(),
            offers: self.offers.copy(),
            offer_cancels: self.offer_cancels.copy(),
        }
    }

    /// Re-seeds every operation of `block` except its reward transaction.
    pub fn add_block_operations(&self, block: &Block) -> usize {
        let added = self.add_all(block.deposits().iter().cloned())
            + self.add_all(block.offers().iter().cloned())
            + self.add_all(block.offer_cancels().iter().cloned())
            + self.add_all(block.user_transactions().iter().cloned())
            + self.add_all(block.withdrawals().iter().cloned());
        debug!(depth = block.depth(), added, "re-seeded block operations into pool");
        added
    }

    /// Drops the operations committed by `block` (reward excluded, it never enters the pool).
    pub fn remove_block_operations(&self, block: &Block) {
        self.remove(block.deposits());
        self.remove(block.offers());
        self.remove(block.offer_cancels());
        self.remove(block.user_transactions());
        self.remove(block.withdrawals());
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
            + self.deposits.len()
            + self.withdrawals.len()
            + self.offers.len()
            + self.offer_cancels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
