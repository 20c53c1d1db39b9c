use crate::crypto::RollingRoot;
use crate::error::ChainError;
use crate::operation::{now_millis, Amount, Operation, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Wallet balances: wallet → asset → amount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionManager {
    balances: HashMap<String, HashMap<String, Amount>>,
    block_hash: Option<String>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Working copy for the next block; the stamp belongs to the previous one.
    pub fn next(&self) -> Self {
        Self {
            balances: self.balances.clone(),
            block_hash: None,
        }
    }

    pub fn balance(&self, wallet: &str) -> HashMap<String, Amount> {
        self.balances.get(wallet).cloned().unwrap_or_default()
    }

    pub fn balance_of(&self, wallet: &str, asset: &str) -> Amount {
        self.balances
            .get(wallet)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or(Amount::ZERO)
    }

    pub fn has_balance(&self, wallet: &str, asset: &str, amount: Amount) -> bool {
        self.balance_of(wallet, asset) >= amount
    }

    pub fn wallet_count(&self) -> usize {
        self.balances.len()
    }

    pub fn block_hash(&self) -> Option<&str> {
        self.block_hash.as_deref()
    }

    pub fn set_block_hash(&mut self, hash: String) {
        self.block_hash = Some(hash);
    }

    pub(crate) fn credit(&mut self, wallet: &str, asset: &str, amount: Amount) -> Result<(), ChainError> {
        self.settle(&[], &[(wallet, asset, amount)])
    }

    pub(crate) fn debit(&mut self, wallet: &str, asset: &str, amount: Amount) -> Result<(), ChainError> {
        self.settle(&[(wallet, asset, amount)], &[])
    }

    /// Applies every debit and credit, or none of them when a wallet lacks
    /// funds or a balance would overflow.
    pub(crate) fn settle(
        &mut self,
        debits: &[(&str, &str, Amount)],
        credits: &[(&str, &str, Amount)],
    ) -> Result<(), ChainError> {
        let mut staged: HashMap<(&str, &str), Amount> = HashMap::new();
        for &(wallet, asset, amount) in debits {
            let available = staged
                .get(&(wallet, asset))
                .copied()
                .unwrap_or_else(|| self.balance_of(wallet, asset));
            if available < amount {
                return Err(ChainError::InsufficientBalance(format!(
                    "wallet {} holds {} {} but needs {}",
                    wallet, available, asset, amount
                )));
            }
            let left = available
                .checked_sub(amount)
                .ok_or_else(|| overflow(wallet, asset))?;
            staged.insert((wallet, asset), left);
        }
        for &(wallet, asset, amount) in credits {
            let current = staged
                .get(&(wallet, asset))
                .copied()
                .unwrap_or_else(|| self.balance_of(wallet, asset));
            let total = current
                .checked_add(amount)
                .ok_or_else(|| overflow(wallet, asset))?;
            staged.insert((wallet, asset), total);
        }

        for ((wallet, asset), amount) in staged {
            self.balances
                .entry(wallet.to_string())
                .or_default()
                .insert(asset.to_string(), amount);
        }
        Ok(())
    }

    /// Signature and balance check for a user transaction. Reward-shaped
    /// transactions never pass: they are only applied in the reward slot.
    pub fn can_process(&self, tx: &Transaction) -> bool {
        !tx.is_reward_shaped()
            && tx.validate().is_ok()
            && tx
                .total_output()
                .map_or(false, |total| self.has_balance(&tx.wallet, &tx.asset, total))
    }

    pub fn process_transaction(&mut self, tx: &Transaction) -> Result<(), ChainError> {
        let total = tx.total_output()?;
        let debits = if tx.wallet.is_empty() {
            vec![]
        } else {
            vec![(tx.wallet.as_str(), tx.asset.as_str(), total)]
        };
        let credits: Vec<(&str, &str, Amount)> = tx
            .outputs
            .iter()
            .map(|output| (output.wallet.as_str(), tx.asset.as_str(), output.size))
            .collect();
        self.settle(&debits, &credits)
    }

    /// Block assembly: synthesizes the miner reward as element zero, then
    /// keeps every pending transaction that can be applied in order.
    pub fn process_transactions(
        &mut self,
        mut root: RollingRoot,
        miner_wallet: &str,
        pending: Vec<Transaction>,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Transaction>, RollingRoot), ChainError> {
        let reward = Transaction::reward(miner_wallet, now_millis());
        self.process_transaction(&reward)?;
        root.fold(&reward.encode());

        let mut eligible = vec![reward];
        for tx in pending {
            if cancel.is_cancelled() {
                return Err(ChainError::Cancelled);
            }
            if !self.can_process(&tx) {
                debug!(tx = %tx.hash_str(), "skipping transaction without balance");
                continue;
            }
            self.process_transaction(&tx)?;
            root.fold(&tx.encode());
            eligible.push(tx);
        }
        Ok((eligible, root))
    }
}

fn overflow(wallet: &str, asset: &str) -> ChainError {
    ChainError::InvalidOperation(format!("{} balance of {} out of range", asset, wallet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::operation::{Signed, TransactionOutput, BASE_ASSET, REWARD_SIZE};

    fn transfer(keypair: &KeyPair, to: &str, size: i64, ts: u64) -> Transaction {
        let mut tx = Transaction::new(
            keypair.address(),
            BASE_ASSET,
            vec![TransactionOutput {
                wallet: to.to_string(),
                size: Amount::from_num(size),
            }],
            ts,
        );
        tx.sign(keypair).unwrap();
        tx
    }

    #[test]
    fn test_reward_synthesized_first() {
        let mut manager = TransactionManager::new();
        let (eligible, root) = manager
            .process_transactions(RollingRoot::new(), "miner", vec![], &CancellationToken::new())
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert!(eligible[0].is_reward_shaped());
        assert_eq!(manager.balance_of("miner", BASE_ASSET), REWARD_SIZE);
        assert_eq!(root, RollingRoot::new().folded(&eligible[0].encode()));
    }

    #[test]
    fn test_transactions_without_balance_are_skipped() {
        let alice = KeyPair::generate().unwrap();
        let mut manager = TransactionManager::new();
        manager.credit(&alice.address(), BASE_ASSET, Amount::from_num(10)).unwrap();

        let ok = transfer(&alice, "bob", 6, 1);
        let too_much = transfer(&alice, "carol", 6, 2);
        let (eligible, _) = manager
            .process_transactions(RollingRoot::new(), "miner", vec![ok.clone(), too_much], &CancellationToken::new())
            .unwrap();

        assert_eq!(eligible.len(), 2);
        assert_eq!(eligible[1], ok);
        assert_eq!(manager.balance_of(&alice.address(), BASE_ASSET), Amount::from_num(4));
        assert_eq!(manager.balance_of("bob", BASE_ASSET), Amount::from_num(6));
        assert_eq!(manager.balance_of("carol", BASE_ASSET), Amount::ZERO);
    }

    #[test]
    fn test_working_copy_leaves_prior_untouched() {
        let mut base = TransactionManager::new();
        base.credit("alice", "ETH", Amount::from_num(3)).unwrap();
        base.set_block_hash("h".to_string());

        let mut next = base.next();
        next.debit("alice", "ETH", Amount::from_num(2)).unwrap();

        assert_eq!(base.balance_of("alice", "ETH"), Amount::from_num(3));
        assert_eq!(next.balance_of("alice", "ETH"), Amount::from_num(1));
        assert_eq!(next.block_hash(), None);
    }

    #[test]
    fn test_debit_rejects_overdraft() {
        let mut manager = TransactionManager::new();
        manager.credit("alice", "ETH", Amount::from_num(1)).unwrap();
        assert!(matches!(
            manager.debit("alice", "ETH", Amount::from_num(2)),
            Err(ChainError::InsufficientBalance(_))
        ));
        assert_eq!(manager.balance_of("alice", "ETH"), Amount::from_num(1));
    }

    #[test]
    fn test_cancelled_assembly_stops() {
        let alice = KeyPair::generate().unwrap();
        let mut manager = TransactionManager::new();
        manager.credit(&alice.address(), BASE_ASSET, Amount::from_num(10)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = manager.process_transactions(RollingRoot::new(), "miner", vec![transfer(&alice, "bob", 1, 1)], &cancel);
        assert!(matches!(result, Err(ChainError::Cancelled)));
    }

    #[test]
    fn test_overflowing_credit_changes_nothing() {
        let alice = KeyPair::generate().unwrap();
        let mut manager = TransactionManager::new();
        manager.credit(&alice.address(), "ETH", Amount::MAX).unwrap();
        manager.credit("bob", "ETH", Amount::MAX).unwrap();

        assert!(matches!(
            manager.credit("bob", "ETH", Amount::from_num(1)),
            Err(ChainError::InvalidOperation(_))
        ));
        assert_eq!(manager.balance_of("bob", "ETH"), Amount::MAX);

        // The debit half of a transfer is rolled back with the failed credit.
        let mut tx = Transaction::new(
            alice.address(),
            "ETH",
            vec![TransactionOutput {
                wallet: "bob".to_string(),
                size: Amount::from_num(1),
            }],
            1,
        );
        tx.sign(&alice).unwrap();
        assert!(manager.process_transaction(&tx).is_err());
        assert_eq!(manager.balance_of(&alice.address(), "ETH"), Amount::MAX);
    }

    #[test]
    fn test_overflowing_outputs_are_skipped() {
        let alice = KeyPair::generate().unwrap();
        let mut manager = TransactionManager::new();
        manager.credit(&alice.address(), BASE_ASSET, Amount::MAX).unwrap();

        let half = Amount::from_num(1i64 << 62);
        let mut tx = Transaction::new(
            alice.address(),
            BASE_ASSET,
            vec![
                TransactionOutput { wallet: "bob".to_string(), size: half },
                TransactionOutput { wallet: "carol".to_string(), size: half },
            ],
            1,
        );
        tx.sign(&alice).unwrap();
        assert!(!manager.can_process(&tx));

        let (eligible, _) = manager
            .process_transactions(RollingRoot::new(), "miner", vec![tx], &CancellationToken::new())
            .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(manager.balance_of(&alice.address(), BASE_ASSET), Amount::MAX);
    }
}
