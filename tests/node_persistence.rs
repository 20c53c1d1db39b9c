//! Integration tests for restarting a node from its SQLite repository

use orderchain::config::Config;
use orderchain::node::{BlockOutcome, Node};
use orderchain::operation::{now_millis, Amount, Deposit, BASE_ASSET, REWARD_SIZE};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::timeout;

fn config(wallet: &str, db: &Path) -> Config {
    let mut config = Config::default();
    config.miner.wallet = wallet.to_string();
    config.miner.genesis_difficulty = 4;
    config.miner.idle_delay_ms = 1;
    config.database.path = db.to_string_lossy().into_owned();
    config
}

#[tokio::test]
async fn test_restart_replays_stored_blocks() {
    timeout(Duration::from_secs(60), async {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("chain.db");

        let (hash, balance) = {
            let node = Node::open(config("miner", &db)).unwrap();
            node.mine_once().await.expect("genesis");
            for n in 0..3 {
                let dp = Deposit::new("dave".to_string(), "ETH", Amount::from_num(n + 1), format!("0xdave{}", n), now_millis());
                assert!(node.submit_deposit(dp));
                node.mine_once().await.expect("block");
            }
            let head = node.head();
            (head.block().unwrap().hash(), head.get_balance("dave"))
        };

        let node = Node::open(config("miner", &db)).unwrap();
        let head = node.head();
        assert_eq!(head.depth(), Some(3));
        assert_eq!(head.block().unwrap().hash(), hash);
        assert_eq!(head.get_balance("dave"), balance);
        assert_eq!(head.get_balance("dave").get("ETH"), Some(&Amount::from_num(6)));
        assert!(head.pool().is_empty());

        let stats = node.block_stats().unwrap();
        assert_eq!(stats.total_count, 4);
        assert_eq!(stats.deposits, 3);

        // Mining resumes on the replayed head.
        let next = node.mine_once().await.expect("block after restart");
        assert_eq!(next.depth(), Some(4));
        assert_eq!(next.get_balance("miner").get(BASE_ASSET), Some(&(REWARD_SIZE * Amount::from_num(4))));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_restart_after_reorganization() {
    timeout(Duration::from_secs(60), async {
        let dir = TempDir::new().unwrap();
        let alice_db = dir.path().join("alice.db");
        let bob_db = dir.path().join("bob.db");

        let winner = {
            let alice = Node::open(config("alice", &alice_db)).unwrap();
            let bob = Node::open(config("bob", &bob_db)).unwrap();

            alice.mine_once().await.expect("genesis");
            let genesis = (**alice.head().block().unwrap()).clone();
            assert_eq!(bob.receive_block(genesis), BlockOutcome::Extended);

            bob.mine_once().await.expect("bob block");
            alice.mine_once().await.expect("alice block 1");
            alice.mine_once().await.expect("alice block 2");

            let mut outcome = BlockOutcome::Rejected;
            for block in alice.head().blocks_old_to_new() {
                outcome = bob.receive_block((*block).clone());
            }
            assert_eq!(outcome, BlockOutcome::Forked);
            bob.head().block().unwrap().hash()
        };

        // Both branches are stored; replay settles on the deeper one.
        let bob = Node::open(config("bob", &bob_db)).unwrap();
        let head = bob.head();
        assert_eq!(head.depth(), Some(2));
        assert_eq!(head.block().unwrap().hash(), winner);
        assert_eq!(head.get_balance("bob").get(BASE_ASSET), None);
        assert_eq!(bob.block_stats().unwrap().total_count, 4);
    })
    .await
    .expect("test timed out");
}
