use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};
use tracing::info;

use super::{BlockSource, SourceBlock, SourceError, SourceReceipt};

/// On-disk format of a replay fixture
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayFixture {
    pub blocks: Vec<SourceBlock>,
    /// Receipts keyed by transaction hash. A transaction without an entry
    /// behaves like a failed receipt fetch.
    #[serde(default)]
    pub receipts: HashMap<String, SourceReceipt>,
}

/// Serves blocks and receipts from a recorded fixture
pub struct ReplaySource {
    blocks: BTreeMap<u64, SourceBlock>,
    receipts: HashMap<String, SourceReceipt>,
}

impl ReplaySource {
    pub fn new(fixture: ReplayFixture) -> Self {
        let blocks = fixture
            .blocks
            .into_iter()
            .map(|block| (block.number, block))
            .collect();
        Self {
            blocks,
            receipts: fixture.receipts,
        }
    }

    /// Load a fixture from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay fixture {}", path.display()))?;
        let fixture: ReplayFixture = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse replay fixture {}", path.display()))?;

        info!(
            "Loaded replay fixture {}: {} blocks, {} receipts",
            path.display(),
            fixture.blocks.len(),
            fixture.receipts.len()
        );
        Ok(Self::new(fixture))
    }
}

#[async_trait]
impl BlockSource for ReplaySource {
    async fn latest_height(&self) -> Result<u64, SourceError> {
        self.blocks
            .keys()
            .next_back()
            .copied()
            .ok_or_else(|| SourceError::NotFound("latest block".to_string()))
    }

    async fn block(&self, height: u64) -> Result<SourceBlock, SourceError> {
        self.blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("block #{}", height)))
    }

    async fn receipt(&self, tx_hash: &str) -> Result<SourceReceipt, SourceError> {
        self.receipts
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(format!("receipt for {}", tx_hash)))
    }
}
