//! Ledger state managers.
//!
//! Each committed chain node owns an immutable [`Ledger`]: one `Arc` per
//! manager. Processing a block never touches those instances; it works on a
//! [`WorkingLedger`] that clones a manager the first time the block writes to
//! it and shares the previous instance for every domain the block leaves
//! alone.

pub mod book;
pub mod deposit;
pub mod transact;
pub mod withdrawal;

pub use book::{BookManager, OfferBook};
pub use deposit::DepositManager;
pub use transact::TransactionManager;
pub use withdrawal::WithdrawalManager;

use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    pub transact: Arc<TransactionManager>,
    pub deposit: Arc<DepositManager>,
    pub withdrawal: Arc<WithdrawalManager>,
    pub book: Arc<BookManager>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn working(&self) -> WorkingLedger {
        WorkingLedger {
            base: self.clone(),
            transact: None,
            deposit: None,
            withdrawal: None,
            book: None,
        }
    }
}

/// Copy-on-write view over a [`Ledger`] used while one block is processed.
pub struct WorkingLedger {
    base: Ledger,
    transact: Option<TransactionManager>,
    deposit: Option<DepositManager>,
    withdrawal: Option<WithdrawalManager>,
    book: Option<BookManager>,
}

impl WorkingLedger {
    pub fn transact(&self) -> &TransactionManager {
        self.transact.as_ref().unwrap_or(&self.base.transact)
    }

    pub fn transact_mut(&mut self) -> &mut TransactionManager {
        let base = &self.base.transact;
        self.transact.get_or_insert_with(|| base.next())
    }

    pub fn deposit_mut(&mut self) -> (&mut DepositManager, &mut TransactionManager) {
        let base = &self.base;
        (
            self.deposit.get_or_insert_with(|| base.deposit.next()),
            self.transact.get_or_insert_with(|| base.transact.next()),
        )
    }

    pub fn withdrawal(&self) -> &WithdrawalManager {
        self.withdrawal.as_ref().unwrap_or(&self.base.withdrawal)
    }

    pub fn withdrawal_mut(&mut self) -> (&mut WithdrawalManager, &mut TransactionManager) {
        let base = &self.base;
        (
            self.withdrawal.get_or_insert_with(|| base.withdrawal.next()),
            self.transact.get_or_insert_with(|| base.transact.next()),
        )
    }

    pub fn book(&self) -> &BookManager {
        self.book.as_ref().unwrap_or(&self.base.book)
    }

    pub fn book_mut(&mut self) -> (&mut BookManager, &mut TransactionManager) {
        let base = &self.base;
        (
            self.book.get_or_insert_with(|| base.book.next()),
            self.transact.get_or_insert_with(|| base.transact.next()),
        )
    }

    /// Freezes the working copies; the balance and book states that changed
    /// are stamped with `block_hash`.
    pub fn commit(self, block_hash: &str) -> Ledger {
        let WorkingLedger {
            base,
            transact,
            deposit,
            withdrawal,
            book,
        } = self;
        Ledger {
            transact: transact.map_or(base.transact, |mut m| {
                m.set_block_hash(block_hash.to_string());
                Arc::new(m)
            }),
            deposit: deposit.map_or(base.deposit, Arc::new),
            withdrawal: withdrawal.map_or(base.withdrawal, Arc::new),
            book: book.map_or(base.book, |mut m| {
                m.set_block_hash(block_hash.to_string());
                Arc::new(m)
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Amount, Deposit};

    #[test]
    fn test_untouched_managers_are_shared() {
        let ledger = Ledger::new();
        let mut working = ledger.working();
        let (deposits, transact) = working.deposit_mut();
        deposits
            .process_deposit(transact, &Deposit::new("alice".to_string(), "ETH", Amount::from_num(1), "0x1".to_string(), 1))
            .unwrap();
        let next = working.commit("abcd");

        assert!(Arc::ptr_eq(&ledger.book, &next.book));
        assert!(Arc::ptr_eq(&ledger.withdrawal, &next.withdrawal));
        assert!(!Arc::ptr_eq(&ledger.transact, &next.transact));
        assert_eq!(next.transact.block_hash(), Some("abcd"));
        assert_eq!(next.transact.balance_of("alice", "ETH"), Amount::from_num(1));
        assert_eq!(ledger.transact.balance_of("alice", "ETH"), Amount::ZERO);
    }

    #[test]
    fn test_dropped_working_ledger_changes_nothing() {
        let ledger = Ledger::new();
        {
            let mut working = ledger.working();
            working.transact_mut().credit("alice", "ETH", Amount::from_num(9)).unwrap();
            assert_eq!(working.transact().balance_of("alice", "ETH"), Amount::from_num(9));
        }
        assert_eq!(ledger.transact.balance_of("alice", "ETH"), Amount::ZERO);
    }
}
