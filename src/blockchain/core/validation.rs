//! Block validation pipeline.
//!
//! Replays a received block's operations against working copies of this
//! node's managers, in the same category order mining uses, and checks the
//! recomputed rolling root against the declared one. The first failure
//! rejects the block; nothing is committed unless every step passes.

use super::block::Block;
use super::chain::Chain;
use crate::crypto::{self, RollingRoot};
use crate::error::ChainError;
use crate::manager::WorkingLedger;
use crate::operation::{now_millis, Operation, Withdrawal};
use std::sync::Arc;
use tracing::{debug, info, warn};

impl Chain {
    /// Validates `block` as the successor of this node. Rejections are
    /// logged and reported as `None`.
    pub fn append_block(self: &Arc<Self>, block: Block) -> Option<Arc<Chain>> {
        let depth = block.depth();
        let hash = block.hash_str();
        match self.process_block(block) {
            Ok(next) => {
                info!(depth, hash = %hash, "accepted block");
                Some(next)
            }
            Err(ChainError::SlotFilled) | Err(ChainError::Cancelled) => {
                debug!(depth, hash = %hash, "block lost the race for its slot");
                None
            }
            Err(e) => {
                warn!(depth, hash = %hash, error = %e, "rejected block");
                None
            }
        }
    }

    pub fn process_block(self: &Arc<Self>, block: Block) -> Result<Arc<Chain>, ChainError> {
        let Some(current) = self.block().cloned() else {
            if self.previous().is_none() && block.is_genesis_shaped() {
                debug!(hash = %block.hash_str(), "accepting genesis block");
                return self.commit(block, self.ledger().clone(), false);
            }
            return Err(ChainError::InvalidBlock(
                "chain has no genesis block yet".to_string(),
            ));
        };
        let header = &block.header;

        if header.timestamp <= current.timestamp() || header.timestamp > now_millis() {
            return Err(ChainError::InvalidTimestamp(format!(
                "{} is not after {} or lies in the future",
                header.timestamp,
                current.timestamp()
            )));
        }

        // Declared difficulty is only pinned when a retarget is due.
        let expected = self.target_difficulty();
        if self.retargets() && header.difficulty != expected {
            return Err(ChainError::InvalidDifficulty {
                expected,
                actual: header.difficulty,
            });
        }

        if header.depth != current.depth() + 1 {
            return Err(ChainError::InvalidDepth {
                expected: current.depth() + 1,
                actual: header.depth,
            });
        }

        match header.previous_hash {
            None => {
                return Err(ChainError::InvalidBlock(
                    "missing previous block hash".to_string(),
                ))
            }
            Some(previous) if previous != current.hash() => return Err(ChainError::InvalidBlockLinkage),
            Some(_) => {}
        }

        if header.compute_hash() != header.hash || !crypto::meets_difficulty(header.difficulty, &header.hash) {
            return Err(ChainError::InvalidProofOfWork);
        }

        let mut working = self.ledger().working();
        let root = self.replay(&block, &mut working)?;

        if root.value() != header.merkle_root {
            return Err(ChainError::InvalidMerkleRoot);
        }

        let ledger = working.commit(&block.hash_str());
        self.commit(block, ledger, false)
    }

    fn check_open(&self) -> Result<(), ChainError> {
        if self.is_closed() {
            return Err(ChainError::Cancelled);
        }
        Ok(())
    }

    fn require_pooled<T: crate::pool::Pooled>(&self, op: &T) -> Result<(), ChainError> {
        if !self.pool().contains(op) {
            return Err(ChainError::UnknownOperation {
                kind: T::KIND,
                hash: op.hash_str(),
            });
        }
        Ok(())
    }

    fn replay(&self, block: &Block, working: &mut WorkingLedger) -> Result<RollingRoot, ChainError> {
        let mut root = RollingRoot::new();

        for deposit in block.deposits() {
            self.check_open()?;
            self.require_pooled(deposit)?;
            let (deposits, transact) = working.deposit_mut();
            deposits.process_deposit(transact, deposit)?;
            root.fold(&deposit.encode());
        }

        for offer in block.offers() {
            self.check_open()?;
            self.require_pooled(offer)?;
            let mut clean = offer.clone();
            clean.clean_trades();
            let (book, transact) = working.book_mut();
            let processed = book.process_offer(transact, clean)?;
            if let Some(missing) = offer.trades.iter().find(|t| !processed.trades.contains(t)) {
                return Err(ChainError::InvalidTrade(format!(
                    "offer {} declares a trade against {} that does not replay",
                    offer.hash_str(),
                    missing.sell_offer
                )));
            }
            root.fold(&processed.encode());
        }

        for cancel in block.offer_cancels() {
            self.check_open()?;
            self.require_pooled(cancel)?;
            let (book, transact) = working.book_mut();
            book.process_offer_cancel(transact, cancel)?;
            root.fold(&cancel.encode());
        }

        let mut reward_seen = false;
        for (i, tx) in block.transactions().iter().enumerate() {
            self.check_open()?;
            if tx.is_reward_shaped() {
                if i != 0 || reward_seen {
                    return Err(ChainError::InvalidBlock(
                        "reward transaction outside the reward slot".to_string(),
                    ));
                }
                reward_seen = true;
            } else {
                self.require_pooled(tx)?;
                if !working.transact().can_process(tx) {
                    return Err(ChainError::InsufficientBalance(format!(
                        "transaction {} cannot be covered by wallet {}",
                        tx.hash_str(),
                        tx.wallet
                    )));
                }
            }
            working.transact_mut().process_transaction(tx)?;
            root.fold(&tx.encode());
        }

        for withdrawal in block.withdrawals() {
            self.check_open()?;
            if !self.pool().contains(withdrawal) && !working.withdrawal().can_process(working.transact(), withdrawal) {
                return Err(ChainError::UnknownOperation {
                    kind: Withdrawal::KIND,
                    hash: withdrawal.hash_str(),
                });
            }
            let (withdrawals, transact) = working.withdrawal_mut();
            withdrawals.process_withdrawal(transact, withdrawal)?;
            root.fold(&withdrawal.encode());
        }

        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::core::block::BlockHeader;
    use crate::blockchain::core::test_support::{chain_of, extend_with_deposits, genesis_chain, seal, TEST_DIFFICULTY};
    use crate::crypto::KeyPair;
    use crate::operation::{Amount, Deposit, Offer, OfferSide, Signed, Trade, Transaction, BASE_ASSET};
    use std::time::Duration;
    use tokio::time::timeout;

    fn next_header(head: &Arc<Chain>, timestamp: u64, merkle_root: Option<crypto::Sha256Hash>) -> BlockHeader {
        let current = head.block().unwrap();
        BlockHeader::new(
            current.depth() + 1,
            Some(current.hash()),
            head.target_difficulty(),
            timestamp,
            merkle_root,
        )
    }

    fn block_with_deposit(head: &Arc<Chain>, deposit: Deposit, timestamp: u64) -> Block {
        let reward = Transaction::reward("miner", timestamp);
        let root = RollingRoot::new().folded(&deposit.encode()).folded(&reward.encode());
        seal(Block::new(
            next_header(head, timestamp, root.value()),
            vec![deposit],
            vec![],
            vec![],
            vec![reward],
            vec![],
        ))
    }

    fn deposit(n: u64) -> Deposit {
        Deposit::new("alice".to_string(), "ETH", Amount::from_num(n), format!("0x{}", n), n)
    }

    #[test]
    fn test_genesis_accepted_on_empty_chain() {
        let root = Chain::new(Default::default());
        let genesis = seal(Block::genesis(TEST_DIFFICULTY, now_millis() - 10_000));
        let head = root.append_block(genesis.clone()).expect("genesis accepted");
        assert_eq!(head.depth(), Some(0));
        assert_eq!(head.block().unwrap().hash(), genesis.hash());
        assert!(root.is_closed());
    }

    #[test]
    fn test_valid_block_extends_chain() {
        let head = genesis_chain();
        let dp = deposit(1);
        assert!(head.append(dp.clone()));
        let block = block_with_deposit(&head, dp.clone(), head.block().unwrap().timestamp() + 1);

        let next = head.append_block(block).expect("block accepted");
        assert_eq!(next.depth(), Some(1));
        assert_eq!(next.get_balance("alice").get("ETH"), Some(&Amount::from_num(1)));
        assert_eq!(next.ledger().transact.block_hash(), Some(next.block().unwrap().hash_str().as_str()));
        assert!(next.contains(&dp));
        assert!(Arc::ptr_eq(&next.ledger().book, &head.ledger().book));
    }

    #[test]
    fn test_equal_timestamp_rejected() {
        let head = genesis_chain();
        let dp = deposit(1);
        head.append(dp.clone());
        let block = block_with_deposit(&head, dp, head.block().unwrap().timestamp());
        assert!(matches!(head.process_block(block), Err(ChainError::InvalidTimestamp(_))));
        assert!(!head.is_closed());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let head = genesis_chain();
        let dp = deposit(1);
        head.append(dp.clone());
        let block = block_with_deposit(&head, dp, now_millis() + 60_000);
        assert!(matches!(head.process_block(block), Err(ChainError::InvalidTimestamp(_))));
    }

    #[test]
    fn test_operation_missing_from_pool_rejected() {
        let head = genesis_chain();
        let keypair = KeyPair::generate().unwrap();
        let mut offer = Offer::new(keypair.address(), "ETH", OfferSide::Sell, Amount::from_num(1), Amount::from_num(1), 1);
        offer.sign(&keypair).unwrap();

        let ts = head.block().unwrap().timestamp() + 1;
        let root = RollingRoot::new().folded(&offer.encode());
        let block = seal(Block::new(next_header(&head, ts, root.value()), vec![], vec![offer], vec![], vec![], vec![]));
        assert!(matches!(
            head.process_block(block),
            Err(ChainError::UnknownOperation { kind: "offer", .. })
        ));
    }

    #[test]
    fn test_wrong_merkle_root_rejected() {
        let head = genesis_chain();
        let dp = deposit(1);
        head.append(dp.clone());
        let ts = head.block().unwrap().timestamp() + 1;
        let block = seal(Block::new(
            next_header(&head, ts, Some([3u8; 32])),
            vec![dp],
            vec![],
            vec![],
            vec![],
            vec![],
        ));
        assert!(matches!(head.process_block(block), Err(ChainError::InvalidMerkleRoot)));
    }

    #[test]
    fn test_wrong_depth_and_linkage_rejected() {
        let head = genesis_chain();
        let ts = head.block().unwrap().timestamp() + 1;

        let mut header = next_header(&head, ts, None);
        header.depth = 5;
        let block = seal(Block::new(header, vec![], vec![], vec![], vec![], vec![]));
        assert!(matches!(head.process_block(block), Err(ChainError::InvalidDepth { expected: 1, actual: 5 })));

        let mut header = next_header(&head, ts, None);
        header.previous_hash = Some([8u8; 32]);
        let block = seal(Block::new(header, vec![], vec![], vec![], vec![], vec![]));
        assert!(matches!(head.process_block(block), Err(ChainError::InvalidBlockLinkage)));
    }

    #[test]
    fn test_tampered_nonce_rejected() {
        let head = genesis_chain();
        let dp = deposit(1);
        head.append(dp.clone());
        let mut block = block_with_deposit(&head, dp, head.block().unwrap().timestamp() + 1);
        block.header.nonce = block.header.nonce.wrapping_add(1);
        assert!(matches!(head.process_block(block), Err(ChainError::InvalidProofOfWork)));
    }

    #[test]
    fn test_second_reward_rejected() {
        let head = genesis_chain();
        let ts = head.block().unwrap().timestamp() + 1;
        let rewards = vec![Transaction::reward("miner", ts), Transaction::reward("miner", ts + 1)];
        let root = rewards.iter().fold(RollingRoot::new(), |root, tx| root.folded(&tx.encode()));
        let block = seal(Block::new(next_header(&head, ts, root.value()), vec![], vec![], vec![], rewards, vec![]));
        assert!(matches!(head.process_block(block), Err(ChainError::InvalidBlock(_))));
    }

    #[test]
    fn test_only_one_block_wins_the_slot() {
        let head = genesis_chain();
        let dp = deposit(1);
        head.append(dp.clone());
        let block = block_with_deposit(&head, dp, head.block().unwrap().timestamp() + 1);

        let winners: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let head = head.clone();
                    let block = block.clone();
                    s.spawn(move || head.append_block(block).is_some())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap() as usize).sum()
        });
        assert_eq!(winners, 1);
        assert!(head.is_closed());
    }

    fn amount(n: i64) -> Amount {
        Amount::from_num(n)
    }

    fn funded(head: &Arc<Chain>, wallet: &str, asset: &str, n: i64) -> Arc<Chain> {
        let dp = Deposit::new(wallet.to_string(), asset, amount(n), format!("0xfund-{}-{}", wallet, asset), 1);
        extend_with_deposits(head, vec![dp])
    }

    #[test]
    fn test_off_target_difficulty_accepted_before_window() {
        let head = genesis_chain();
        assert!(!head.retargets());
        let ts = head.block().unwrap().timestamp() + 1;
        let mut header = next_header(&head, ts, None);
        header.difficulty = TEST_DIFFICULTY + 1;
        let block = seal(Block::new(header, vec![], vec![], vec![], vec![], vec![]));

        let next = head.process_block(block).expect("difficulty is free outside the window");
        assert_eq!(next.block().unwrap().header.difficulty, TEST_DIFFICULTY + 1);
        assert_eq!(next.target_difficulty(), TEST_DIFFICULTY + 1);
    }

    #[test]
    fn test_off_target_difficulty_rejected_when_retargeting() {
        let head = chain_of(&vec![TEST_DIFFICULTY; 21], 1000);
        assert!(head.retargets());
        assert_eq!(head.target_difficulty(), TEST_DIFFICULTY + 1);

        let header = BlockHeader::new(21, Some(head.block().unwrap().hash()), TEST_DIFFICULTY, now_millis(), None);
        let block = seal(Block::new(header, vec![], vec![], vec![], vec![], vec![]));
        assert!(matches!(
            head.process_block(block),
            Err(ChainError::InvalidDifficulty { expected, actual }) if expected == TEST_DIFFICULTY + 1 && actual == TEST_DIFFICULTY
        ));
        assert!(!head.is_closed());
    }

    #[test]
    fn test_overflowing_deposits_reject_block() {
        let head = genesis_chain();
        let big = Amount::from_num(5_000_000_000_000_000_000u64);
        let deposits = vec![
            Deposit::new("alice".to_string(), "ETH", big, "0xbig-1".to_string(), 1),
            Deposit::new("alice".to_string(), "ETH", big, "0xbig-2".to_string(), 2),
        ];
        for dp in &deposits {
            assert!(head.append(dp.clone()));
        }
        let root = deposits.iter().fold(RollingRoot::new(), |root, dp| root.folded(&dp.encode()));
        let ts = head.block().unwrap().timestamp() + 1;
        let block = seal(Block::new(next_header(&head, ts, root.value()), deposits, vec![], vec![], vec![], vec![]));

        assert!(matches!(head.process_block(block), Err(ChainError::InvalidOperation(_))));
        assert!(!head.is_closed());
    }

    #[test]
    fn test_declared_trades_must_replay() {
        let seller = KeyPair::generate().unwrap();
        let buyer = KeyPair::generate().unwrap();
        let head = funded(&genesis_chain(), &seller.address(), "ETH", 10);
        let head = funded(&head, &buyer.address(), BASE_ASSET, 100);

        let mut ask = Offer::new(seller.address(), "ETH", OfferSide::Sell, amount(5), amount(2), 10);
        ask.sign(&seller).unwrap();
        let mut bid = Offer::new(buyer.address(), "ETH", OfferSide::Buy, amount(5), amount(2), 11);
        bid.sign(&buyer).unwrap();
        assert!(head.append(ask.clone()));
        assert!(head.append(bid.clone()));

        let trade = Trade {
            asset: "ETH".to_string(),
            buy_offer: bid.hash_str(),
            sell_offer: ask.hash_str(),
            buyer_wallet: buyer.address(),
            seller_wallet: seller.address(),
            price: amount(5),
            quantity: amount(2),
            timestamp: bid.timestamp,
        };
        let root = RollingRoot::new().folded(&ask.encode()).folded(&bid.encode());
        let ts = head.block().unwrap().timestamp() + 1;
        let block_with = |trade: Trade| {
            let mut bid = bid.clone();
            bid.trades = vec![trade];
            seal(Block::new(next_header(&head, ts, root.value()), vec![], vec![ask.clone(), bid], vec![], vec![], vec![]))
        };

        let forged = Trade {
            price: amount(4),
            ..trade.clone()
        };
        assert!(matches!(head.process_block(block_with(forged)), Err(ChainError::InvalidTrade(_))));
        assert!(!head.is_closed());

        let next = head.process_block(block_with(trade.clone())).expect("replayed trade accepted");
        assert_eq!(next.get_trades("ETH"), vec![trade]);
        assert_eq!(next.get_balance(&seller.address()).get(BASE_ASSET), Some(&amount(10)));
        assert_eq!(next.get_balance(&buyer.address()).get("ETH"), Some(&amount(2)));
    }

    #[test]
    fn test_unpooled_withdrawal_accepted_only_when_funded() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let head = funded(&genesis_chain(), &alice.address(), "ETH", 5);
        let ts = head.block().unwrap().timestamp() + 1;
        let block_with = |wd: Withdrawal| {
            let root = RollingRoot::new().folded(&wd.encode());
            seal(Block::new(next_header(&head, ts, root.value()), vec![], vec![], vec![], vec![], vec![wd]))
        };

        let mut unfunded = Withdrawal::new(bob.address(), "0xexternal".to_string(), "ETH", amount(1), 1);
        unfunded.sign(&bob).unwrap();
        assert!(matches!(
            head.process_block(block_with(unfunded)),
            Err(ChainError::UnknownOperation { kind: "withdrawal", .. })
        ));

        let mut funded_wd = Withdrawal::new(alice.address(), "0xexternal".to_string(), "ETH", amount(3), 2);
        funded_wd.sign(&alice).unwrap();
        assert!(!head.pool().contains(&funded_wd));
        let next = head.process_block(block_with(funded_wd.clone())).expect("processable withdrawal accepted");
        assert_eq!(next.get_balance(&alice.address()).get("ETH"), Some(&amount(2)));
        assert_eq!(next.block().unwrap().withdrawals(), &[funded_wd]);
    }

    #[tokio::test]
    async fn test_received_block_beats_running_miner() {
        timeout(Duration::from_secs(30), async {
            // 200 leading zero bits cannot be met: the miner only stops when the slot fills.
            let head = chain_of(&[200], 1);
            let miner = head.clone();
            let attempt = tokio::spawn(async move { miner.start_mining().await });
            while !head.is_mining() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            let header = BlockHeader::new(1, Some(head.block().unwrap().hash()), TEST_DIFFICULTY, now_millis(), None);
            let block = seal(Block::new(header, vec![], vec![], vec![], vec![], vec![]));
            let next = head.append_block(block.clone()).expect("received block fills the slot");

            assert!(attempt.await.unwrap().is_none());
            assert!(!head.is_mined());
            assert!(!head.is_mining());
            assert!(head.is_closed());
            assert_eq!(next.block().unwrap().hash(), block.hash());
            assert!(Arc::ptr_eq(&next.previous().unwrap(), &head));

            let mut rival = BlockHeader::new(1, Some(head.block().unwrap().hash()), TEST_DIFFICULTY, now_millis(), None);
            rival.timestamp += 1;
            let rival = seal(Block::new(rival, vec![], vec![], vec![], vec![], vec![]));
            assert!(head.append_block(rival).is_none());
        })
        .await
        .expect("test timed out");
    }
}
