use super::block::{Block, BlockHeader, BlockStatus};
use super::chain::Chain;
use crate::crypto::{self, RollingRoot};
use crate::error::ChainError;
use crate::manager::WorkingLedger;
use crate::operation::now_millis;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Increments the nonce until the header hash meets its difficulty or the
/// token fires. Returns `None` when cancelled.
pub fn solve(mut block: Block, cancel: &CancellationToken) -> Option<Block> {
    loop {
        let hash = block.header.compute_hash();
        if crypto::meets_difficulty(block.header.difficulty, &hash) {
            block.header.hash = hash;
            block.header.status = BlockStatus::Mined;
            return Some(block);
        }
        if cancel.is_cancelled() {
            return None;
        }
        block.header.nonce = block.header.nonce.wrapping_add(1);
    }
}

impl Chain {
    /// Mines the next block on top of this node. Returns the successor, or
    /// `None` if mining is already claimed, the slot was filled by another
    /// block, or the attempt failed.
    pub async fn start_mining(self: &Arc<Self>) -> Option<Arc<Chain>> {
        {
            let mut state = self.commit_lock.lock();
            if self.cancel.is_cancelled() || state.mining {
                debug!(depth = self.depth(), "mining slot unavailable");
                return None;
            }
            state.mining = true;
        }

        match self.mine_next().await {
            Ok(next) => Some(next),
            Err(ChainError::Cancelled) | Err(ChainError::SlotFilled) => {
                self.commit_lock.lock().mining = false;
                debug!(depth = self.depth(), "mining attempt superseded");
                None
            }
            Err(e) => {
                self.commit_lock.lock().mining = false;
                warn!(depth = self.depth(), error = %e, "mining failed");
                None
            }
        }
    }

    /// Abandons this node's slot: any running proof-of-work stops.
    pub fn stop_mining(&self) {
        self.cancel.cancel();
    }

    async fn mine_next(self: &Arc<Self>) -> Result<Arc<Chain>, ChainError> {
        let Some(current) = self.block().cloned() else {
            let genesis = Block::genesis(self.settings().genesis_difficulty, now_millis());
            let mined = self.proof_of_work(genesis).await?;
            return self.commit(mined, self.ledger().clone(), true);
        };

        // A block must be strictly newer than its parent.
        while now_millis() <= current.timestamp() {
            if self.is_closed() {
                return Err(ChainError::Cancelled);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let mut working = self.ledger().working();
        let candidate = self.assemble(&current, &mut working)?;
        info!(
            depth = candidate.depth(),
            difficulty = candidate.header.difficulty,
            deposits = candidate.deposits().len(),
            offers = candidate.offers().len(),
            cancels = candidate.offer_cancels().len(),
            transactions = candidate.transactions().len(),
            withdrawals = candidate.withdrawals().len(),
            "mining new block"
        );

        let mined = self.proof_of_work(candidate).await?;
        let ledger = working.commit(&mined.hash_str());
        self.commit(mined, ledger, true)
    }

    /// Runs the pending pool through the managers in category order and
    /// builds the candidate block with the resulting rolling root.
    fn assemble(self: &Arc<Self>, current: &Block, working: &mut WorkingLedger) -> Result<Block, ChainError> {
        let pool = self.pool();
        let root = RollingRoot::new();

        let pending = pool.deposits().snapshot();
        let (deposits, root) = if pending.is_empty() {
            (vec![], root)
        } else {
            let (manager, transact) = working.deposit_mut();
            manager.process_deposits(transact, root, pending)
        };

        let pending = pool.offers().snapshot();
        let (offers, root) = if pending.is_empty() {
            (vec![], root)
        } else {
            let (book, transact) = working.book_mut();
            book.process_offers(transact, root, pending)
        };

        let pending = pool.offer_cancels().snapshot();
        let (offer_cancels, root) = if pending.is_empty() {
            (vec![], root)
        } else {
            let (book, transact) = working.book_mut();
            book.process_offer_cancels(transact, root, pending)
        };

        let pending = pool.transactions().snapshot();
        let (transactions, root) = working.transact_mut().process_transactions(
            root,
            &self.settings().miner_wallet,
            pending,
            &self.cancel,
        )?;

        if self.is_closed() {
            return Err(ChainError::Cancelled);
        }

        let pending = pool.withdrawals().snapshot();
        let (withdrawals, root) = if pending.is_empty() {
            (vec![], root)
        } else {
            let (manager, transact) = working.withdrawal_mut();
            manager.process_withdrawals(transact, root, pending)
        };

        let header = BlockHeader::new(
            current.depth() + 1,
            Some(current.hash()),
            self.target_difficulty(),
            now_millis(),
            root.value(),
        );
        Ok(Block::new(header, deposits, offers, offer_cancels, transactions, withdrawals))
    }

    async fn proof_of_work(&self, block: Block) -> Result<Block, ChainError> {
        let cancel = self.cancel.clone();
        let difficulty = block.header.difficulty;
        let started = Instant::now();
        let solved = tokio::task::spawn_blocking(move || solve(block, &cancel))
            .await
            .map_err(|e| ChainError::InvalidBlock(format!("mining worker failed: {}", e)))?;
        let block = solved.ok_or(ChainError::Cancelled)?;
        info!(
            depth = block.depth(),
            difficulty,
            nonce = block.header.nonce,
            hash = %block.hash_str(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "found block"
        );
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::core::chain::ChainSettings;
    use crate::blockchain::core::test_support::{chain_of, genesis_chain, TEST_DIFFICULTY};
    use crate::crypto::KeyPair;
    use crate::operation::{Amount, Deposit, Offer, OfferSide, Signed, BASE_ASSET, REWARD_SIZE};
    use tokio::time::timeout;

    fn settings() -> ChainSettings {
        ChainSettings {
            miner_wallet: "miner".to_string(),
            genesis_difficulty: TEST_DIFFICULTY,
            ..ChainSettings::default()
        }
    }

    #[test]
    fn test_solve_meets_difficulty() {
        let block = Block::genesis(8, 1);
        let solved = solve(block, &CancellationToken::new()).unwrap();
        assert!(crypto::meets_difficulty(8, &solved.hash()));
        assert_eq!(solved.header.compute_hash(), solved.hash());
        assert_eq!(solved.header.status, BlockStatus::Mined);
    }

    #[test]
    fn test_solve_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(solve(Block::genesis(256, 1), &cancel).is_none());
    }

    #[tokio::test]
    async fn test_mines_genesis_then_block() {
        timeout(Duration::from_secs(30), async {
            let root = Chain::new(settings());
            let genesis = root.start_mining().await.expect("genesis mined");
            assert_eq!(genesis.depth(), Some(0));
            assert!(root.is_mined());
            assert!(root.is_closed());

            let next = genesis.start_mining().await.expect("block mined");
            assert_eq!(next.depth(), Some(1));
            let block = next.block().unwrap();
            assert!(block.transactions()[0].is_reward_shaped());
            assert_eq!(next.get_balance("miner").get(BASE_ASSET), Some(&REWARD_SIZE));
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn test_mined_block_validates_on_another_node() {
        timeout(Duration::from_secs(30), async {
            let head = genesis_chain();
            let keypair = KeyPair::generate().unwrap();
            let dp = Deposit::new(keypair.address(), "ETH", Amount::from_num(5), "0xfeed".to_string(), 1);
            let mut offer = Offer::new(keypair.address(), "ETH", OfferSide::Sell, Amount::from_num(2), Amount::from_num(3), 2);
            offer.sign(&keypair).unwrap();
            assert!(head.append(dp.clone()));
            assert!(head.append(offer.clone()));

            let peer = head.rebuilt(Arc::new(head.pool().copy()));
            let mined = head.start_mining().await.expect("block mined");
            let block = mined.block().unwrap();
            assert_eq!(block.deposits(), &[dp]);
            assert_eq!(block.offers().len(), 1);

            let accepted = peer.append_block((**block).clone()).expect("peer accepts mined block");
            assert_eq!(accepted.block().unwrap().hash(), block.hash());
            assert_eq!(accepted.get_balance(&keypair.address()), mined.get_balance(&keypair.address()));
            assert!(accepted.get_book("ETH").unwrap().best_ask().is_some());
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn test_cancellation_stops_running_miner() {
        timeout(Duration::from_secs(30), async {
            // No nonce can meet 200 leading zero bits: only cancellation ends the search.
            let head = chain_of(&[200], 1);
            let miner = head.clone();
            let attempt = tokio::spawn(async move { miner.start_mining().await });

            while !head.is_mining() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            head.stop_mining();

            assert!(attempt.await.unwrap().is_none());
            assert!(!head.is_mining());
            assert!(!head.is_mined());
            assert!(head.start_mining().await.is_none());
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn test_second_claim_fails_fast() {
        timeout(Duration::from_secs(30), async {
            let head = genesis_chain();
            head.commit_lock.lock().mining = true;
            assert!(head.start_mining().await.is_none());
        })
        .await
        .expect("test timed out");
    }

    #[tokio::test]
    async fn test_overflowing_pool_entries_do_not_stall_mining() {
        timeout(Duration::from_secs(30), async {
            let head = genesis_chain();
            let big = Amount::from_num(5_000_000_000_000_000_000u64);
            let first = Deposit::new("alice".to_string(), "ETH", big, "0xbig-1".to_string(), 1);
            let second = Deposit::new("alice".to_string(), "ETH", big, "0xbig-2".to_string(), 2);
            assert!(head.append(first.clone()));
            assert!(head.append(second));

            let keypair = KeyPair::generate().unwrap();
            let huge = Amount::from_num(1i64 << 40);
            let mut offer = Offer::new(keypair.address(), "ETH", OfferSide::Buy, huge, huge, 3);
            offer.sign(&keypair).unwrap();
            assert!(!head.append(offer));

            let next = head.start_mining().await.expect("block mined");
            assert_eq!(next.block().unwrap().deposits(), &[first]);
            assert_eq!(next.get_balance("alice").get("ETH"), Some(&big));
            assert!(!head.is_mining());
        })
        .await
        .expect("test timed out");
    }
}
