use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::database::TimeRange;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DetectionError {
    #[error("threshold multiplier must be positive, got {0}")]
    InvalidThreshold(Decimal),

    #[error("invalid time range: start {start} is after end {end}")]
    InvalidTimeRange { start: i64, end: i64 },

    #[error("detection query failed: {0}")]
    Query(String),
}

impl From<anyhow::Error> for DetectionError {
    fn from(e: anyhow::Error) -> Self {
        DetectionError::Query(format!("{:#}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    HighGas,
    Sandwich,
    RepeatedActor,
}

/// What a finding was computed over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingScope {
    Block(i64),
    TimeRange(TimeRange),
}

/// The transaction a per-block finding points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedTransaction {
    pub hash: String,
    pub transaction_index: i64,
    pub from_address: String,
    pub gas_price: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorPattern {
    /// More than half of the sender's transactions are high-gas
    FrequentHighGas,
    /// More than ten back-to-back transactions
    ConsecutiveTransactions,
    /// More than a thousand transactions in the window
    HighVolumeTrader,
}

/// Per-sender aggregate behind a repeated-actor finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorProfile {
    pub address: String,
    pub transaction_count: u64,
    pub high_gas_transactions: u64,
    pub consecutive_transactions: u64,
    pub high_gas_fraction: Decimal,
    pub consecutive_fraction: Decimal,
    pub average_gas_price: String,
    pub first_seen_block: i64,
    pub last_seen_block: i64,
    pub patterns: Vec<ActorPattern>,
}

/// A heuristic match; recomputed on every query and never stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MevFinding {
    pub kind: FindingKind,
    pub score: Decimal,
    /// Transaction hashes supporting the finding, in block order
    pub evidence: Vec<String>,
    pub scope: FindingScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<FlaggedTransaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<ActorProfile>,
}

/// Outcome of one detector inside a combined analysis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CategoryResult<T> {
    Ok { result: T },
    Error { error: String },
}

impl<T> CategoryResult<T> {
    pub fn ok(&self) -> Option<&T> {
        match self {
            CategoryResult::Ok { result } => Some(result),
            CategoryResult::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, CategoryResult::Error { .. })
    }
}

impl<T> From<Result<T, DetectionError>> for CategoryResult<T> {
    fn from(result: Result<T, DetectionError>) -> Self {
        match result {
            Ok(result) => CategoryResult::Ok { result },
            Err(e) => CategoryResult::Error {
                error: e.to_string(),
            },
        }
    }
}

/// Gas statistics over a block's positive-gas transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStats {
    pub transaction_count: u64,
    pub average_gas_price: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAnalysis {
    pub block_number: i64,
    pub stats: CategoryResult<BlockStats>,
    pub high_gas: CategoryResult<Vec<MevFinding>>,
    pub sandwich: CategoryResult<Vec<MevFinding>>,
    /// High-gas plus sandwich findings from the categories that succeeded
    pub flagged_transactions: u64,
    pub mev_percentage: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MevTrends {
    pub time_range: TimeRange,
    pub total_transactions: u64,
    pub average_gas_price: Option<String>,
    pub high_gas_transactions: u64,
    pub high_gas_percentage: Decimal,
    pub top_actors: CategoryResult<Vec<MevFinding>>,
}

/// Coarse label for how much of the window's traffic is high-gas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Low,
    Moderate,
    High,
}

impl ActivityLevel {
    /// Above 15% is high, above 5% moderate
    pub fn classify(mev_percentage: Decimal) -> Self {
        if mev_percentage > Decimal::from(15) {
            ActivityLevel::High
        } else if mev_percentage > Decimal::from(5) {
            ActivityLevel::Moderate
        } else {
            ActivityLevel::Low
        }
    }
}

/// Summary view of [`MevTrends`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MevStats {
    pub time_range: TimeRange,
    pub total_transactions: u64,
    pub mev_transactions: u64,
    pub mev_percentage: Decimal,
    pub average_gas_price: Option<String>,
    /// `None` when the actor analysis failed
    pub top_mev_bots_count: Option<usize>,
    pub mev_activity_level: ActivityLevel,
}

impl From<&MevTrends> for MevStats {
    fn from(trends: &MevTrends) -> Self {
        Self {
            time_range: trends.time_range,
            total_transactions: trends.total_transactions,
            mev_transactions: trends.high_gas_transactions,
            mev_percentage: trends.high_gas_percentage,
            average_gas_price: trends.average_gas_price.clone(),
            top_mev_bots_count: trends.top_actors.ok().map(Vec::len),
            mev_activity_level: ActivityLevel::classify(trends.high_gas_percentage),
        }
    }
}
