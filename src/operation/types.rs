/// Ledger operation types for OrderChain
use crate::crypto::{self, KeyPair, Sha256Hash};
use crate::error::ChainError;
use fixed::types::I64F64;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point quantity used for balances, prices and sizes.
pub type Amount = I64F64;

/// Asset every offer is priced in and every miner reward is paid in.
pub const BASE_ASSET: &str = "BIZ";

/// Size of the single output carried by a miner reward transaction.
pub const REWARD_SIZE: Amount = Amount::from_bits(100i128 << 64);

/// Maximum serialized operation size in bytes (100KB) to prevent DoS
pub const MAX_OPERATION_SIZE: usize = 100_000;

pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Common contract of everything that travels through the pool and into blocks.
///
/// `encode` is the canonical text form: it keys the pool and block indexes,
/// is the signed message, and is what the rolling Merkle root folds over.
/// Signatures, public keys and offer trade annotations are not part of it.
pub trait Operation: Clone + fmt::Debug + Serialize + Send + Sync + 'static {
    const KIND: &'static str;

    fn encode(&self) -> String;

    /// Stateless checks (shape, amounts, signature).
    fn validate(&self) -> Result<(), ChainError>;

    fn hash(&self) -> Sha256Hash {
        crypto::hash(self.encode().as_bytes())
    }

    fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    /// Validate serialized size to prevent DoS attacks
    fn validate_size(&self) -> Result<(), ChainError> {
        let size = bincode::serialized_size(self)? as usize;
        if size > MAX_OPERATION_SIZE {
            return Err(ChainError::OperationTooLarge {
                size,
                max: MAX_OPERATION_SIZE,
            });
        }
        Ok(())
    }
}

/// Operations authorised by a wallet's secp256k1 key.
pub trait Signed: Operation {
    fn wallet(&self) -> &str;
    fn public_key(&self) -> &str;
    fn signature(&self) -> &str;
    fn set_signature(&mut self, public_key: String, signature: String);

    fn sign(&mut self, keypair: &KeyPair) -> Result<(), ChainError> {
        let signature = keypair.sign(self.encode().as_bytes())?;
        self.set_signature(keypair.public_key_hex(), hex::encode(signature));
        Ok(())
    }

    fn verify_signature(&self) -> Result<(), ChainError> {
        if self.signature().is_empty() || self.public_key().is_empty() {
            return Err(ChainError::InvalidOperation(format!("{} not signed", Self::KIND)));
        }
        crypto::verify_wallet_signature(
            self.wallet(),
            self.public_key(),
            self.encode().as_bytes(),
            self.signature(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub wallet: String,
    pub size: Amount,
}

/// Transfer of one asset from a wallet to one or more outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub wallet: String,
    #[serde(default)]
    pub public_key: String,
    pub asset: String,
    pub outputs: Vec<TransactionOutput>,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
}

impl Transaction {
    pub fn new(wallet: String, asset: &str, outputs: Vec<TransactionOutput>, timestamp: u64) -> Self {
        Transaction {
            wallet,
            public_key: String::new(),
            asset: asset.to_string(),
            outputs,
            timestamp,
            signature: String::new(),
        }
    }

    /// Miner reward: no wallet, no signature, a single output of `REWARD_SIZE`.
    pub fn reward(miner_wallet: &str, timestamp: u64) -> Self {
        Transaction::new(
            String::new(),
            BASE_ASSET,
            vec![TransactionOutput {
                wallet: miner_wallet.to_string(),
                size: REWARD_SIZE,
            }],
            timestamp,
        )
    }

    /// Structural recognition of the reward transaction. Any transaction with
    /// this shape is treated as a reward candidate.
    pub fn is_reward_shaped(&self) -> bool {
        self.wallet.is_empty()
            && self.signature.is_empty()
            && self.outputs.len() == 1
            && self.outputs[0].size == REWARD_SIZE
    }

    pub fn total_output(&self) -> Result<Amount, ChainError> {
        self.outputs
            .iter()
            .try_fold(Amount::ZERO, |total, o| total.checked_add(o.size))
            .ok_or_else(|| ChainError::InvalidOperation("Transaction outputs out of range".to_string()))
    }
}

impl Operation for Transaction {
    const KIND: &'static str = "transaction";

    fn encode(&self) -> String {
        let mut out = format!("tx|{}|{}|{}|", self.wallet, self.asset, self.timestamp);
        for output in &self.outputs {
            out.push_str(&format!("{}:{};", output.wallet, output.size));
        }
        out
    }

    fn validate(&self) -> Result<(), ChainError> {
        self.validate_fields()
    }
}

impl Signed for Transaction {
    fn wallet(&self) -> &str {
        &self.wallet
    }
    fn public_key(&self) -> &str {
        &self.public_key
    }
    fn signature(&self) -> &str {
        &self.signature
    }
    fn set_signature(&mut self, public_key: String, signature: String) {
        self.public_key = public_key;
        self.signature = signature;
    }
}

/// Funds bridged in from an external chain; credited to `target_wallet`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub target_wallet: String,
    pub asset: String,
    pub quantity: Amount,
    /// Reference of the originating transfer on the external chain.
    pub tx_hash: String,
    pub timestamp: u64,
}

impl Deposit {
    pub fn new(target_wallet: String, asset: &str, quantity: Amount, tx_hash: String, timestamp: u64) -> Self {
        Deposit {
            target_wallet,
            asset: asset.to_string(),
            quantity,
            tx_hash,
            timestamp,
        }
    }
}

impl Operation for Deposit {
    const KIND: &'static str = "deposit";

    fn encode(&self) -> String {
        format!(
            "dp|{}|{}|{}|{}|{}",
            self.target_wallet, self.asset, self.quantity, self.tx_hash, self.timestamp
        )
    }

    fn validate(&self) -> Result<(), ChainError> {
        self.validate_fields()
    }
}

/// Funds leaving the ledger towards an external address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub source_wallet: String,
    #[serde(default)]
    pub public_key: String,
    pub target_wallet: String,
    pub asset: String,
    pub size: Amount,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
}

impl Withdrawal {
    pub fn new(source_wallet: String, target_wallet: String, asset: &str, size: Amount, timestamp: u64) -> Self {
        Withdrawal {
            source_wallet,
            public_key: String::new(),
            target_wallet,
            asset: asset.to_string(),
            size,
            timestamp,
            signature: String::new(),
        }
    }
}

impl Operation for Withdrawal {
    const KIND: &'static str = "withdrawal";

    fn encode(&self) -> String {
        format!(
            "wd|{}|{}|{}|{}|{}",
            self.source_wallet, self.target_wallet, self.asset, self.size, self.timestamp
        )
    }

    fn validate(&self) -> Result<(), ChainError> {
        self.validate_fields()
    }
}

impl Signed for Withdrawal {
    fn wallet(&self) -> &str {
        &self.source_wallet
    }
    fn public_key(&self) -> &str {
        &self.public_key
    }
    fn signature(&self) -> &str {
        &self.signature
    }
    fn set_signature(&mut self, public_key: String, signature: String) {
        self.public_key = public_key;
        self.signature = signature;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OfferSide {
    Buy,
    Sell,
}

impl fmt::Display for OfferSide {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OfferSide::Buy => write!(f, "buy"),
            OfferSide::Sell => write!(f, "sell"),
        }
    }
}

/// Execution of a buy offer against a sell offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub asset: String,
    pub buy_offer: String,
    pub sell_offer: String,
    pub buyer_wallet: String,
    pub seller_wallet: String,
    pub price: Amount,
    pub quantity: Amount,
    pub timestamp: u64,
}

/// Limit offer on `asset`, priced in `BASE_ASSET`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub wallet: String,
    #[serde(default)]
    pub public_key: String,
    pub asset: String,
    pub side: OfferSide,
    pub price: Amount,
    pub quantity: Amount,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
    /// Executions produced while processing; not part of the canonical encoding.
    #[serde(default)]
    pub trades: Vec<Trade>,
}

impl Offer {
    pub fn new(wallet: String, asset: &str, side: OfferSide, price: Amount, quantity: Amount, timestamp: u64) -> Self {
        Offer {
            wallet,
            public_key: String::new(),
            asset: asset.to_string(),
            side,
            price,
            quantity,
            timestamp,
            signature: String::new(),
            trades: Vec::new(),
        }
    }

    pub fn clean_trades(&mut self) {
        self.trades.clear();
    }

    pub fn filled(&self) -> Amount {
        self.trades.iter().map(|t| t.quantity).sum()
    }

    pub fn remaining(&self) -> Amount {
        self.quantity - self.filled()
    }

    /// Asset locked while the offer is open and the amount locked for `quantity`.
    pub fn locked(&self, quantity: Amount) -> Result<(&str, Amount), ChainError> {
        match self.side {
            OfferSide::Buy => self
                .price
                .checked_mul(quantity)
                .map(|amount| (BASE_ASSET, amount))
                .ok_or_else(|| ChainError::InvalidOperation(format!("Offer value {} x {} out of range", self.price, quantity))),
            OfferSide::Sell => Ok((self.asset.as_str(), quantity)),
        }
    }
}

impl Operation for Offer {
    const KIND: &'static str = "offer";

    fn encode(&self) -> String {
        format!(
            "of|{}|{}|{}|{}|{}|{}",
            self.wallet, self.asset, self.side, self.price, self.quantity, self.timestamp
        )
    }

    fn validate(&self) -> Result<(), ChainError> {
        self.validate_fields()
    }
}

impl Signed for Offer {
    fn wallet(&self) -> &str {
        &self.wallet
    }
    fn public_key(&self) -> &str {
        &self.public_key
    }
    fn signature(&self) -> &str {
        &self.signature
    }
    fn set_signature(&mut self, public_key: String, signature: String) {
        self.public_key = public_key;
        self.signature = signature;
    }
}

/// Withdraws a resting offer from its book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferCancel {
    pub wallet: String,
    #[serde(default)]
    pub public_key: String,
    pub offer_hash: String,
    pub timestamp: u64,
    #[serde(default)]
    pub signature: String,
}

impl OfferCancel {
    pub fn new(wallet: String, offer_hash: String, timestamp: u64) -> Self {
        OfferCancel {
            wallet,
            public_key: String::new(),
            offer_hash,
            timestamp,
            signature: String::new(),
        }
    }
}

impl Operation for OfferCancel {
    const KIND: &'static str = "offer cancel";

    fn encode(&self) -> String {
        format!("oc|{}|{}|{}", self.wallet, self.offer_hash, self.timestamp)
    }

    fn validate(&self) -> Result<(), ChainError> {
        self.validate_fields()
    }
}

impl Signed for OfferCancel {
    fn wallet(&self) -> &str {
        &self.wallet
    }
    fn public_key(&self) -> &str {
        &self.public_key
    }
    fn signature(&self) -> &str {
        &self.signature
    }
    fn set_signature(&mut self, public_key: String, signature: String) {
        self.public_key = public_key;
        self.signature = signature;
    }
}
