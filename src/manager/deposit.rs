use super::TransactionManager;
use crate::crypto::RollingRoot;
use crate::error::ChainError;
use crate::operation::{Deposit, Operation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Deposits credited by one block, plus a running total along the branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepositManager {
    processed: Vec<Deposit>,
    total_processed: u64,
}

impl DepositManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Self {
        Self {
            processed: Vec::new(),
            total_processed: self.total_processed,
        }
    }

    pub fn processed(&self) -> &[Deposit] {
        &self.processed
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn process_deposit(&mut self, transact: &mut TransactionManager, deposit: &Deposit) -> Result<(), ChainError> {
        deposit.validate()?;
        transact.credit(&deposit.target_wallet, &deposit.asset, deposit.quantity)?;
        self.processed.push(deposit.clone());
        self.total_processed += 1;
        Ok(())
    }

    pub fn process_deposits(
        &mut self,
        transact: &mut TransactionManager,
        mut root: RollingRoot,
        pending: Vec<Deposit>,
    ) -> (Vec<Deposit>, RollingRoot) {
        let mut eligible = Vec::with_capacity(pending.len());
        for deposit in pending {
            if let Err(e) = self.process_deposit(transact, &deposit) {
                debug!(deposit = %deposit.hash_str(), error = %e, "skipping deposit");
                continue;
            }
            root.fold(&deposit.encode());
            eligible.push(deposit);
        }
        (eligible, root)
    }
}
