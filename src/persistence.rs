//! Block repository for OrderChain
//!
//! Committed blocks are stored whole (JSON body) next to a few indexed
//! columns used for range replay and statistics. The chain itself never
//! calls the repository; the node persists each new head and feeds stored
//! blocks back in at startup.

use crate::blockchain::{Block, BlockStatus};
use crate::error::ChainError;
use crate::operation::now_millis;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

/// Window covered by `get_block_stats`.
pub const STATS_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Marker written after a block has been persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPersistInfo {
    pub block_hash: String,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub total_count: u64,
    pub first_block_time: Option<u64>,
    pub total_op_count: u64,
    pub deposits: u64,
    pub offers: u64,
    pub transactions: u64,
    pub withdrawals: u64,
}

impl BlockStats {
    fn add(&mut self, deposits: u64, offers: u64, transactions: u64, withdrawals: u64) {
        self.total_op_count += deposits + offers + transactions + withdrawals;
        self.deposits += deposits;
        self.offers += offers;
        self.transactions += transactions;
        self.withdrawals += withdrawals;
    }
}

/// Durable storage of committed blocks.
pub trait BlockRepository: Send + Sync {
    fn contains(&self, hash: &str) -> Result<bool, ChainError>;
    fn save(&self, block: &Block) -> Result<(), ChainError>;
    fn get(&self, hash: &str) -> Result<Option<Block>, ChainError>;
    /// Blocks with `from_depth <= depth <= to_depth` (open-ended when `to_depth`
    /// is `None`), in depth order. Blocks arrive as they are read; a read
    /// failure is delivered in place of the block and ends the stream.
    fn get_range(&self, from_depth: u64, to_depth: Option<u64>) -> Result<Receiver<Result<Block, ChainError>>, ChainError>;
    fn save_persist_info(&self, info: &BlockPersistInfo) -> Result<(), ChainError>;
    /// The most recent marker.
    fn get_persist_info(&self) -> Result<Option<BlockPersistInfo>, ChainError>;
    fn delete_persist_info(&self, block_hash: &str) -> Result<(), ChainError>;
    fn block_stats_since(&self, since: u64) -> Result<BlockStats, ChainError>;

    fn get_block_stats(&self) -> Result<BlockStats, ChainError> {
        self.block_stats_since(now_millis().saturating_sub(STATS_WINDOW_MS))
    }
}

/// Sends each block in range until the rows run out or the receiver is dropped.
fn stream_range(
    conn: &Connection,
    from_depth: i64,
    to_depth: i64,
    sender: &Sender<Result<Block, ChainError>>,
) -> Result<(), ChainError> {
    let mut stmt = conn
        .prepare("SELECT body FROM blocks WHERE depth >= ?1 AND depth <= ?2 ORDER BY depth ASC, timestamp ASC")
        .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
    let rows = stmt
        .query_map(params![from_depth, to_depth], |row| row.get::<_, String>(0))
        .map_err(|e| ChainError::DatabaseError(format!("Failed to query blocks: {}", e)))?;

    for row in rows {
        let body = row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
        let block: Block = serde_json::from_str(&body)?;
        if sender.send(Ok(block)).is_err() {
            debug!("block range reader dropped");
            break;
        }
    }
    Ok(())
}

fn persisted(block: &Block) -> Block {
    let mut block = block.clone();
    block.header.status = BlockStatus::Persisted;
    block
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                hash TEXT PRIMARY KEY,
                depth INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                deposits INTEGER NOT NULL,
                offers INTEGER NOT NULL,
                transactions INTEGER NOT NULL,
                withdrawals INTEGER NOT NULL,
                body TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute("CREATE INDEX IF NOT EXISTS blocks_by_depth ON blocks (depth)", [])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to create depth index: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS persist_info (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                block_hash TEXT NOT NULL,
                timestamp INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| {
            ChainError::DatabaseError(format!("Failed to create persist_info table: {}", e))
        })?;

        Ok(Database {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
    }
}

impl BlockRepository for Database {
    fn contains(&self, hash: &str) -> Result<bool, ChainError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM blocks WHERE hash = ?1", params![hash], |row| row.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    fn save(&self, block: &Block) -> Result<(), ChainError> {
        let body = serde_json::to_string(&persisted(block))?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO blocks (hash, depth, timestamp, deposits, offers, transactions, withdrawals, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                block.hash_str(),
                block.depth() as i64,
                block.timestamp() as i64,
                block.deposits().len() as i64,
                block.offers().len() as i64,
                block.transactions().len() as i64,
                block.withdrawals().len() as i64,
                body,
            ],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    fn get(&self, hash: &str) -> Result<Option<Block>, ChainError> {
        let conn = self.conn()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM blocks WHERE hash = ?1", params![hash], |row| row.get(0))
            .optional()?;
        body.map(|body| serde_json::from_str(&body).map_err(ChainError::from))
            .transpose()
    }

    fn get_range(&self, from_depth: u64, to_depth: Option<u64>) -> Result<Receiver<Result<Block, ChainError>>, ChainError> {
        let (sender, receiver) = unbounded();
        let conn = self.conn.clone();
        let upper = to_depth.map_or(i64::MAX, |d| d as i64);

        thread::Builder::new()
            .name("block-range".to_string())
            .spawn(move || {
                let result = conn
                    .lock()
                    .map_err(|_| ChainError::DatabaseError("Mutex poisoned".to_string()))
                    .and_then(|conn| stream_range(&conn, from_depth as i64, upper, &sender));
                if let Err(e) = result {
                    // Nothing to report to if the receiver is gone.
                    if sender.send(Err(e)).is_err() {
                        debug!("block range reader dropped");
                    }
                }
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to start range reader: {}", e)))?;
        Ok(receiver)
    }

    fn save_persist_info(&self, info: &BlockPersistInfo) -> Result<(), ChainError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO persist_info (block_hash, timestamp) VALUES (?1, ?2)",
            params![info.block_hash, info.timestamp as i64],
        )
        .map_err(|e| ChainError::DatabaseError(format!("Failed to save persist info: {}", e)))?;
        Ok(())
    }

    fn get_persist_info(&self) -> Result<Option<BlockPersistInfo>, ChainError> {
        let conn = self.conn()?;
        let info = conn
            .query_row(
                "SELECT block_hash, timestamp FROM persist_info ORDER BY timestamp DESC, id DESC LIMIT 1",
                [],
                |row| {
                    let timestamp: i64 = row.get(1)?;
                    Ok(BlockPersistInfo {
                        block_hash: row.get(0)?,
                        timestamp: timestamp as u64,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    fn delete_persist_info(&self, block_hash: &str) -> Result<(), ChainError> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM persist_info WHERE block_hash = ?1", params![block_hash])
            .map_err(|e| ChainError::DatabaseError(format!("Failed to delete persist info: {}", e)))?;
        Ok(())
    }

    fn block_stats_since(&self, since: u64) -> Result<BlockStats, ChainError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT timestamp, deposits, offers, transactions, withdrawals
                 FROM blocks WHERE timestamp >= ?1 ORDER BY timestamp ASC",
            )
            .map_err(|e| ChainError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params![since as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(|e| ChainError::DatabaseError(format!("Failed to query block stats: {}", e)))?;

        let mut stats = BlockStats::default();
        for row in rows {
            let (timestamp, deposits, offers, transactions, withdrawals) =
                row.map_err(|e| ChainError::DatabaseError(format!("Failed to read row: {}", e)))?;
            stats.total_count += 1;
            stats.first_block_time.get_or_insert(timestamp as u64);
            stats.add(deposits as u64, offers as u64, transactions as u64, withdrawals as u64);
        }
        Ok(stats)
    }
}

/// Repository kept entirely in memory, for tests and ephemeral nodes.
#[derive(Default)]
pub struct InMemoryRepository {
    blocks: RwLock<HashMap<String, Block>>,
    persist_info: RwLock<Vec<BlockPersistInfo>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockRepository for InMemoryRepository {
    fn contains(&self, hash: &str) -> Result<bool, ChainError> {
        Ok(self.blocks.read().contains_key(hash))
    }

    fn save(&self, block: &Block) -> Result<(), ChainError> {
        self.blocks.write().insert(block.hash_str(), persisted(block));
        Ok(())
    }

    fn get(&self, hash: &str) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.read().get(hash).cloned())
    }

    /// The matching blocks are snapshotted before the receiver is returned.
    fn get_range(&self, from_depth: u64, to_depth: Option<u64>) -> Result<Receiver<Result<Block, ChainError>>, ChainError> {
        let mut blocks: Vec<Block> = self
            .blocks
            .read()
            .values()
            .filter(|b| b.depth() >= from_depth && to_depth.map_or(true, |to| b.depth() <= to))
            .cloned()
            .collect();
        blocks.sort_by_key(|b| (b.depth(), b.timestamp()));

        let (sender, receiver) = unbounded();
        for block in blocks {
            sender
                .send(Ok(block))
                .map_err(|e| ChainError::DatabaseError(format!("Failed to queue block: {}", e)))?;
        }
        Ok(receiver)
    }

    fn save_persist_info(&self, info: &BlockPersistInfo) -> Result<(), ChainError> {
        self.persist_info.write().push(info.clone());
        Ok(())
    }

    fn get_persist_info(&self) -> Result<Option<BlockPersistInfo>, ChainError> {
        Ok(self
            .persist_info
            .read()
            .iter()
            .max_by_key(|info| info.timestamp)
            .cloned())
    }

    fn delete_persist_info(&self, block_hash: &str) -> Result<(), ChainError> {
        self.persist_info.write().retain(|info| info.block_hash != block_hash);
        Ok(())
    }

    fn block_stats_since(&self, since: u64) -> Result<BlockStats, ChainError> {
        let mut stats = BlockStats::default();
        let blocks = self.blocks.read();
        let mut recent: Vec<&Block> = blocks.values().filter(|b| b.timestamp() >= since).collect();
        recent.sort_by_key(|b| b.timestamp());
        for block in recent {
            stats.total_count += 1;
            stats.first_block_time.get_or_insert(block.timestamp());
            stats.add(
                block.deposits().len() as u64,
                block.offers().len() as u64,
                block.transactions().len() as u64,
                block.withdrawals().len() as u64,
            );
        }
        Ok(stats)
    }
}

/// Opens the repository named by `path`: SQLite on disk, or memory when the
/// path is empty or `:memory:`.
pub fn open_repository(path: &str) -> Result<Box<dyn BlockRepository>, ChainError> {
    if path.is_empty() || path == ":memory:" {
        return Ok(Box::new(InMemoryRepository::new()));
    }
    Ok(Box::new(Database::open(path)?))
}
