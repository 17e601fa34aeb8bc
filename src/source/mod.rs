//! Block sources feeding the ingestion loop.
//!
//! A [`BlockSource`] answers three questions about a chain: how high it is,
//! what a block at a given height contains, and what a transaction's receipt
//! says. The live implementation talks JSON-RPC through [`crate::rpc::RpcClient`];
//! the replay implementation serves a recorded fixture file.

mod replay;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;

use crate::rpc::RpcClient;

pub use replay::{ReplayFixture, ReplaySource};

/// Errors reported by a block source. All of them are transient from the
/// ingestion loop's point of view and are retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("source call timed out after {0}ms")]
    Timeout(u64),

    #[error("{0} not found")]
    NotFound(String),
}

/// A block as reported by the node, before validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBlock {
    pub number: u64,
    pub hash: Option<String>,
    pub parent_hash: String,
    pub timestamp: u64,
    pub gas_limit: String,
    pub gas_used: String,
    pub miner: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub base_fee_per_gas: Option<String>,
    #[serde(default)]
    pub transactions: Vec<SourceTransaction>,
}

/// A transaction as embedded in a [`SourceBlock`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTransaction {
    pub hash: String,
    #[serde(default)]
    pub index: Option<u64>,
    /// Sender; `None` when the node did not report one and it could not be recovered
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub value: String,
    pub gas_limit: String,
    #[serde(default)]
    pub gas_price: Option<String>,
    pub nonce: String,
}

/// The receipt fields kept alongside a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReceipt {
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default)]
    pub status: Option<u64>,
    #[serde(default)]
    pub contract_address: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Latest block height known to the node
    async fn latest_height(&self) -> Result<u64, SourceError>;

    /// Block at `height` with full transaction bodies
    async fn block(&self, height: u64) -> Result<SourceBlock, SourceError>;

    /// Receipt for the transaction with hash `tx_hash`
    async fn receipt(&self, tx_hash: &str) -> Result<SourceReceipt, SourceError>;
}

/// Settings for the JSON-RPC source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSourceConfig {
    pub rpc_url: String,
    pub max_concurrent_requests: usize,
    pub min_interval_ms: u64,
}

/// Which source the application ingests from; picked once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    Live(LiveSourceConfig),
    Replay(PathBuf),
}

impl DataSource {
    /// Build the selected source
    pub fn connect(&self) -> anyhow::Result<Arc<dyn BlockSource>> {
        match self {
            DataSource::Live(config) => Ok(Arc::new(RpcClient::new(config)?)),
            DataSource::Replay(path) => Ok(Arc::new(ReplaySource::from_file(path)?)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DataSource::Live(config) => format!("live RPC at {}", config.rpc_url),
            DataSource::Replay(path) => format!("replay fixture {}", path.display()),
        }
    }
}
