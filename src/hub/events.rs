use serde::{Deserialize, Serialize};

use crate::database::{format_timestamp, Block, Transaction};

/// Event pushed to subscribers, serialized as `{"type": ..., "data": ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BroadcastEvent {
    BlockUpdate(BlockEvent),
    TransactionUpdate(TransactionEvent),
    NetworkStats(StatsEvent),
}

impl BroadcastEvent {
    /// Topic name subscribers filter on; same as the `type` tag
    pub fn topic(&self) -> &'static str {
        match self {
            BroadcastEvent::BlockUpdate(_) => "block_update",
            BroadcastEvent::TransactionUpdate(_) => "transaction_update",
            BroadcastEvent::NetworkStats(_) => "network_stats",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEvent {
    pub number: i64,
    pub hash: String,
    pub transaction_count: i64,
    pub gas_used: String,
    pub gas_limit: String,
    pub timestamp: String,
    pub miner: String,
}

impl From<&Block> for BlockEvent {
    fn from(block: &Block) -> Self {
        Self {
            number: block.number,
            hash: block.hash.clone(),
            transaction_count: block.transaction_count,
            gas_used: block.gas_used.clone(),
            gas_limit: block.gas_limit.clone(),
            timestamp: block.timestamp_iso(),
            miner: block.miner.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub hash: String,
    pub block_number: i64,
    pub from_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_address: Option<String>,
    pub value: String,
    pub gas_price: String,
}

impl From<&Transaction> for TransactionEvent {
    fn from(tx: &Transaction) -> Self {
        Self {
            hash: tx.hash.clone(),
            block_number: tx.block_number,
            from_address: tx.from_address.clone(),
            to_address: tx.to_address.clone(),
            value: tx.value.clone(),
            gas_price: tx.gas_price.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsEvent {
    /// Chain head as last reported by the source
    pub latest_block: u64,
    /// Highest stored block
    pub indexed_block: Option<i64>,
    pub ingestion_gaps: i64,
    pub timestamp: String,
}

impl StatsEvent {
    pub fn now(latest_block: u64, indexed_block: Option<i64>, ingestion_gaps: i64) -> Self {
        Self {
            latest_block,
            indexed_block,
            ingestion_gaps,
            timestamp: format_timestamp(chrono::Utc::now().timestamp()),
        }
    }
}

/// Message a subscriber may send; anything else is ignored
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

impl ControlMessage {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
