use crate::crypto::Sha256Hash;
use crate::operation::{Deposit, Offer, OfferCancel, Operation, Transaction, Withdrawal};
use crate::pool::Pooled;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    #[default]
    Open,
    Mined,
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub depth: u64,
    pub previous_hash: Option<Sha256Hash>,
    pub difficulty: u32,
    pub nonce: u64,
    pub timestamp: u64,
    pub merkle_root: Option<Sha256Hash>,
    pub hash: Sha256Hash,
    pub status: BlockStatus,
}

impl BlockHeader {
    pub fn new(
        depth: u64,
        previous_hash: Option<Sha256Hash>,
        difficulty: u32,
        timestamp: u64,
        merkle_root: Option<Sha256Hash>,
    ) -> Self {
        BlockHeader {
            depth,
            previous_hash,
            difficulty,
            nonce: 0,
            timestamp,
            merkle_root,
            hash: [0u8; 32],
            status: BlockStatus::Open,
        }
    }

    /// Hash over every header field except `hash` and `status`.
    pub fn compute_hash(&self) -> Sha256Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.depth.to_le_bytes());
        match &self.previous_hash {
            Some(hash) => {
                hasher.update([1u8]);
                hasher.update(hash);
            }
            None => hasher.update([0u8]),
        }
        hasher.update(self.difficulty.to_le_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        match &self.merkle_root {
            Some(root) => {
                hasher.update([1u8]);
                hasher.update(root);
            }
            None => hasher.update([0u8]),
        }
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Default)]
struct BlockIndex {
    deposits: HashMap<Sha256Hash, usize>,
    withdrawals: HashMap<Sha256Hash, usize>,
    transactions: HashMap<Sha256Hash, usize>,
    offers: HashMap<Sha256Hash, usize>,
    offer_cancels: HashMap<Sha256Hash, usize>,
}

fn index_of<T: Operation>(ops: &[T]) -> HashMap<Sha256Hash, usize> {
    ops.iter().enumerate().map(|(i, op)| (op.hash(), i)).collect()
}

#[derive(Serialize, Deserialize)]
struct BlockBody {
    header: BlockHeader,
    deposits: Vec<Deposit>,
    withdrawals: Vec<Withdrawal>,
    transactions: Vec<Transaction>,
    offers: Vec<Offer>,
    offer_cancels: Vec<OfferCancel>,
}

impl From<BlockBody> for Block {
    fn from(body: BlockBody) -> Self {
        let mut block = Block {
            header: body.header,
            deposits: body.deposits,
            withdrawals: body.withdrawals,
            transactions: body.transactions,
            offers: body.offers,
            offer_cancels: body.offer_cancels,
            index: BlockIndex::default(),
        };
        block.reindex();
        block
    }
}

/// One round's committed operations. The per-kind hash indexes are built
/// once when the block is constructed or deserialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "BlockBody")]
pub struct Block {
    pub header: BlockHeader,
    deposits: Vec<Deposit>,
    withdrawals: Vec<Withdrawal>,
    transactions: Vec<Transaction>,
    offers: Vec<Offer>,
    offer_cancels: Vec<OfferCancel>,
    #[serde(skip)]
    index: BlockIndex,
}

impl Block {
    pub fn new(
        header: BlockHeader,
        deposits: Vec<Deposit>,
        offers: Vec<Offer>,
        offer_cancels: Vec<OfferCancel>,
        transactions: Vec<Transaction>,
        withdrawals: Vec<Withdrawal>,
    ) -> Self {
        BlockBody {
            header,
            deposits,
            withdrawals,
            transactions,
            offers,
            offer_cancels,
        }
        .into()
    }

    /// Empty depth-zero block with no predecessor.
    pub fn genesis(difficulty: u32, timestamp: u64) -> Self {
        Block::new(
            BlockHeader::new(0, None, difficulty, timestamp, None),
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
        )
    }

    fn reindex(&mut self) {
        self.index = BlockIndex {
            deposits: index_of(&self.deposits),
            withdrawals: index_of(&self.withdrawals),
            transactions: index_of(&self.transactions),
            offers: index_of(&self.offers),
            offer_cancels: index_of(&self.offer_cancels),
        };
    }

    pub fn hash(&self) -> Sha256Hash {
        self.header.hash
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.header.hash)
    }

    pub fn depth(&self) -> u64 {
        self.header.depth
    }

    pub fn timestamp(&self) -> u64 {
        self.header.timestamp
    }

    pub fn is_genesis_shaped(&self) -> bool {
        self.header.previous_hash.is_none() && self.transactions.is_empty()
    }

    pub fn deposits(&self) -> &[Deposit] {
        &self.deposits
    }

    pub fn withdrawals(&self) -> &[Withdrawal] {
        &self.withdrawals
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn offers(&self) -> &[Offer] {
        &self.offers
    }

    pub fn offer_cancels(&self) -> &[OfferCancel] {
        &self.offer_cancels
    }

    /// Transactions that came from the pool: the leading reward is skipped.
    pub fn user_transactions(&self) -> &[Transaction] {
        match self.transactions.first() {
            Some(first) if first.is_reward_shaped() => &self.transactions[1..],
            _ => &self.transactions,
        }
    }

    pub fn operation_count(&self) -> usize {
        self.deposits.len()
            + self.withdrawals.len()
            + self.transactions.len()
            + self.offers.len()
            + self.offer_cancels.len()
    }

    pub fn contains<T: BlockIndexed>(&self, hash: &Sha256Hash) -> bool {
        T::index(self).contains_key(hash)
    }

    pub fn get<T: BlockIndexed>(&self, hash: &Sha256Hash) -> Option<&T> {
        T::index(self).get(hash).map(|i| &T::operations(self)[*i])
    }
}

/// Maps an operation type onto its list and hash index inside a block.
pub trait BlockIndexed: Pooled {
    fn operations(block: &Block) -> &[Self];
    fn index(block: &Block) -> &HashMap<Sha256Hash, usize>;
}

impl BlockIndexed for Deposit {
    fn operations(block: &Block) -> &[Self] {
        &block.deposits
    }
    fn index(block: &Block) -> &HashMap<Sha256Hash, usize> {
        &block.index.deposits
    }
}

impl BlockIndexed for Withdrawal {
    fn operations(block: &Block) -> &[Self] {
        &block.withdrawals
    }
    fn index(block: &Block) -> &HashMap<Sha256Hash, usize> {
        &block.index.withdrawals
    }
}

impl BlockIndexed for Transaction {
    fn operations(block: &Block) -> &[Self] {
        &block.transactions
    }
    fn index(block: &Block) -> &HashMap<Sha256Hash, usize> {
        &block.index.transactions
    }
}

impl BlockIndexed for Offer {
    fn operations(block: &Block) -> &[Self] {
        &block.offers
    }
    fn index(block: &Block) -> &HashMap<Sha256Hash, usize> {
        &block.index.offers
    }
}

impl BlockIndexed for OfferCancel {
    fn operations(block: &Block) -> &[Self] {
        &block.offer_cancels
    }
    fn index(block: &Block) -> &HashMap<Sha256Hash, usize> {
        &block.index.offer_cancels
    }
}
