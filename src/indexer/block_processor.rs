use std::{sync::Arc, time::Instant};
use tracing::{debug, info};

use super::{
    decode, fetcher::Fetcher, transaction_processor::TransactionProcessor, IngestError,
};
use crate::database::{Block, BlockWrite, DatabaseService};

/// A block that made it into the store
#[derive(Debug)]
pub struct ProcessedBlock {
    pub block: Block,
    pub write: BlockWrite,
    pub skipped: usize,
}

/// Processor for handling block data
#[derive(Clone)]
pub struct BlockProcessor {
    db: Arc<DatabaseService>,
    fetcher: Fetcher,
    tx_processor: TransactionProcessor,
}

impl BlockProcessor {
    pub fn new(db: Arc<DatabaseService>, fetcher: Fetcher) -> Self {
        let tx_processor = TransactionProcessor::new(fetcher.clone());
        Self {
            db,
            fetcher,
            tx_processor,
        }
    }

    /// Fetch, decode and persist one height
    pub async fn process_block(&self, height: u64) -> Result<ProcessedBlock, IngestError> {
        let start_time = Instant::now();

        let source_block = self
            .fetcher
            .block(height)
            .await
            .map_err(|source| IngestError::FetchFailed { height, source })?;
        let block_fetch_time = start_time.elapsed();

        let block = decode::decode_block(&source_block)
            .map_err(|source| IngestError::DecodeFailed { height, source })?;

        let receipts_start = Instant::now();
        let collected = self
            .tx_processor
            .collect(block.number, &source_block.transactions)
            .await;
        let receipts_time = receipts_start.elapsed();

        let db_start = Instant::now();
        let write = self
            .db
            .write_block(&block, &collected.rows)
            .await
            .map_err(|e| IngestError::PersistFailed {
                height,
                message: format!("{:#}", e),
            })?;
        let db_time = db_start.elapsed();

        let skipped = collected.skipped + write.rejected;
        if skipped > 0 {
            info!(
                "Block #{} stored {} of {} transactions",
                height,
                write.stored.len(),
                block.transaction_count
            );
        }

        debug!(
            "Block #{} performance: block_fetch={}ms, receipts_fetch={}ms, db={}ms, total={}ms",
            height,
            block_fetch_time.as_millis(),
            receipts_time.as_millis(),
            db_time.as_millis(),
            start_time.elapsed().as_millis()
        );

        Ok(ProcessedBlock {
            block,
            write,
            skipped,
        })
    }
}
