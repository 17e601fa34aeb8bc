use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Block data structure
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Block {
    pub number: i64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64, // Unix seconds
    pub gas_limit: String,
    pub gas_used: String,
    pub miner: String,
    pub size_bytes: Option<i64>,
    pub transaction_count: i64, // Declared by the node, may exceed stored rows
    pub base_fee_per_gas: Option<String>,
}

impl Block {
    /// Block timestamp as RFC 3339 / ISO-8601
    pub fn timestamp_iso(&self) -> String {
        format_timestamp(self.timestamp)
    }
}

/// Transaction data structure
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_number: i64,
    pub transaction_index: i64,
    pub from_address: String,
    pub to_address: Option<String>,
    pub value: String,
    pub gas_limit: String,
    pub gas_used: Option<String>, // From the receipt
    pub gas_price: String,
    pub nonce: String,
    pub status: Option<i64>, // From the receipt
    pub contract_address: Option<String>,
}

/// Transaction joined with the timestamp of its block
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct TimedTransaction {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub transaction: Transaction,
    pub block_timestamp: i64,
}

/// A height skipped by the ingestion loop
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct IngestionGap {
    pub block_number: i64,
    pub reason: String,
    pub attempts: i64,
    pub recorded_at: i64,
}

/// Result of writing one block and its transactions as a single unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockWrite {
    /// Hash stored for this height before the write, if any
    pub previous_hash: Option<String>,
    /// Transaction rows that were written
    pub stored: Vec<Transaction>,
    /// Transaction rows rejected by the store
    pub rejected: usize,
}

impl BlockWrite {
    /// True when the height was already stored with the same hash
    pub fn is_replay_of(&self, hash: &str) -> bool {
        self.previous_hash.as_deref() == Some(hash)
    }
}

/// Inclusive time window over block timestamps (unix seconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }
}

/// Stats structure for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub latest_block: Option<i64>,
    pub total_blocks: i64,
    pub total_transactions_declared: i64,
    pub total_transactions_indexed: i64,
    pub ingestion_gaps: i64,
}

/// Format unix seconds as an ISO-8601 UTC timestamp
pub fn format_timestamp(seconds: i64) -> String {
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
