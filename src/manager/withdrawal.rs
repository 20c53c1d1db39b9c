use super::TransactionManager;
use crate::crypto::RollingRoot;
use crate::error::ChainError;
use crate::operation::{Operation, Withdrawal};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Withdrawals debited by one block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WithdrawalManager {
    processed: Vec<Withdrawal>,
    total_processed: u64,
}

impl WithdrawalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> Self {
        Self {
            processed: Vec::new(),
            total_processed: self.total_processed,
        }
    }

    pub fn processed(&self) -> &[Withdrawal] {
        &self.processed
    }

    pub fn total_processed(&self) -> u64 {
        self.total_processed
    }

    pub fn can_process(&self, transact: &TransactionManager, withdrawal: &Withdrawal) -> bool {
        withdrawal.validate().is_ok()
            && transact.has_balance(&withdrawal.source_wallet, &withdrawal.asset, withdrawal.size)
    }

    pub fn process_withdrawal(
        &mut self,
        transact: &mut TransactionManager,
        withdrawal: &Withdrawal,
    ) -> Result<(), ChainError> {
        withdrawal.validate()?;
        transact.debit(&withdrawal.source_wallet, &withdrawal.asset, withdrawal.size)?;
        self.processed.push(withdrawal.clone());
        self.total_processed += 1;
        Ok(())
    }

    pub fn process_withdrawals(
        &mut self,
        transact: &mut TransactionManager,
        mut root: RollingRoot,
        pending: Vec<Withdrawal>,
    ) -> (Vec<Withdrawal>, RollingRoot) {
        let mut eligible = Vec::with_capacity(pending.len());
        for withdrawal in pending {
            if let Err(e) = self.process_withdrawal(transact, &withdrawal) {
                debug!(withdrawal = %withdrawal.hash_str(), error = %e, "skipping withdrawal");
                continue;
            }
            root.fold(&withdrawal.encode());
            eligible.push(withdrawal);
        }
        (eligible, root)
    }
}
