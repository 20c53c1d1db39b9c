//! OrderChain - a proof-of-work exchange ledger
//!
//! Blocks carry deposits, offers, offer cancellations, transfers and
//! withdrawals. Each committed block yields new versions of the wallet
//! balances and order books, shared structurally with the previous block.
//!
//! # Architecture
//!
//! ## Chain State
//! - [`blockchain`] - Chain nodes, validation, mining, forks and retargeting
//! - [`pool`] - Pending operations
//! - [`manager`] - Balance, deposit, withdrawal and order-book state
//!
//! ## Records
//! - [`operation`] - Operation types and their canonical encodings
//! - [`crypto`] - Hashing, proof-of-work predicate and secp256k1 signatures
//!
//! ## Node
//! - [`node`] - Orchestration of head, repository and miner
//! - [`persistence`] - Block repository (SQLite)
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Chain State
// ============================================================================
pub mod blockchain;
pub mod manager;
pub mod pool;

// ============================================================================
// Records
// ============================================================================
pub mod crypto;
pub mod operation;

// ============================================================================
// Node
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
pub mod persistence;
