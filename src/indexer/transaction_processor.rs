use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use super::{decode, fetcher::Fetcher};
use crate::{database::Transaction, source::SourceTransaction};

/// Rows ready to persist plus how many were dropped on the way
#[derive(Debug, Default)]
pub struct CollectedTransactions {
    pub rows: Vec<Transaction>,
    pub skipped: usize,
}

/// Processor for turning a block's transactions into stored rows
#[derive(Clone)]
pub struct TransactionProcessor {
    fetcher: Fetcher,
}

impl TransactionProcessor {
    pub fn new(fetcher: Fetcher) -> Self {
        Self { fetcher }
    }

    /// Fetch every receipt and decode every transaction of a block. A failed
    /// receipt or a malformed transaction drops that transaction only.
    ///
    /// At most [`Fetcher::max_in_flight`] receipts are requested at a time, so
    /// each receipt's timeout starts when its call does.
    pub async fn collect(
        &self,
        block_number: i64,
        transactions: &[SourceTransaction],
    ) -> CollectedTransactions {
        let calls: Vec<_> = transactions
            .iter()
            .map(|tx| self.process_transaction(block_number, tx))
            .collect();
        let results: Vec<Option<Transaction>> = stream::iter(calls)
            .buffered(self.fetcher.max_in_flight())
            .collect()
            .await;

        let mut collected = CollectedTransactions::default();
        for row in results {
            match row {
                Some(row) => collected.rows.push(row),
                None => collected.skipped += 1,
            }
        }
        collected.rows.sort_by_key(|row| row.transaction_index);

        debug!(
            "Block #{}: {} transactions decoded, {} skipped",
            block_number,
            collected.rows.len(),
            collected.skipped
        );
        collected
    }

    async fn process_transaction(
        &self,
        block_number: i64,
        tx: &SourceTransaction,
    ) -> Option<Transaction> {
        let receipt = match self.fetcher.receipt(&tx.hash).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    "Skipping transaction {} in block #{}: receipt unavailable: {}",
                    tx.hash, block_number, e
                );
                return None;
            }
        };

        match decode::decode_transaction(block_number, tx, &receipt) {
            Ok(row) => Some(row),
            Err(e) => {
                warn!(
                    "Skipping transaction {} in block #{}: {}",
                    tx.hash, block_number, e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        rpc::RpcExecutor,
        source::{BlockSource, SourceBlock, SourceError, SourceReceipt},
    };
    use async_trait::async_trait;
    use std::{sync::Arc, time::Duration};

    /// Receipts served through a rate-limited executor, like the live client
    struct PacedSource {
        receipts: RpcExecutor<String, SourceReceipt>,
    }

    impl PacedSource {
        fn new(max_concurrent: usize, latency: Duration) -> Self {
            let receipts = RpcExecutor::new("receipts", max_concurrent, 0, move |_: String| {
                async move {
                    tokio::time::sleep(latency).await;
                    Ok(SourceReceipt {
                        gas_used: Some("21000".to_string()),
                        status: Some(1),
                        contract_address: None,
                    })
                }
            });
            Self { receipts }
        }
    }

    #[async_trait]
    impl BlockSource for PacedSource {
        async fn latest_height(&self) -> Result<u64, SourceError> {
            Ok(0)
        }

        async fn block(&self, height: u64) -> Result<SourceBlock, SourceError> {
            Err(SourceError::NotFound(format!("block #{}", height)))
        }

        async fn receipt(&self, tx_hash: &str) -> Result<SourceReceipt, SourceError> {
            self.receipts
                .execute(tx_hash.to_string())
                .await
                .map_err(|e| SourceError::Unavailable(e.to_string()))
        }
    }

    fn transactions(count: u64) -> Vec<SourceTransaction> {
        (0..count)
            .map(|i| SourceTransaction {
                hash: format!("0x{:064x}", i + 1),
                index: Some(i),
                from: Some(format!("0x{:040x}", i + 1)),
                to: None,
                value: "0".to_string(),
                gas_limit: "21000".to_string(),
                gas_price: Some("10".to_string()),
                nonce: "0".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn queued_receipts_do_not_time_out() {
        // 20 receipts, 2 at a time, 40ms each: 400ms in total against a
        // 150ms per-call timeout
        let config = AppConfig {
            max_concurrent_requests: 2,
            source_timeout_ms: 150,
            ..AppConfig::default()
        };
        let source = Arc::new(PacedSource::new(2, Duration::from_millis(40)));
        let processor = TransactionProcessor::new(Fetcher::new(source, &config));

        let collected = processor.collect(7, &transactions(20)).await;

        assert_eq!(collected.skipped, 0);
        assert_eq!(collected.rows.len(), 20);
        let indexes: Vec<i64> = collected.rows.iter().map(|r| r.transaction_index).collect();
        assert_eq!(indexes, (0..20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn malformed_transaction_is_skipped_alone() {
        let config = AppConfig {
            max_concurrent_requests: 4,
            ..AppConfig::default()
        };
        let source = Arc::new(PacedSource::new(4, Duration::from_millis(1)));
        let processor = TransactionProcessor::new(Fetcher::new(source, &config));

        let mut txs = transactions(3);
        txs[1].gas_price = None;
        let collected = processor.collect(7, &txs).await;

        assert_eq!(collected.skipped, 1);
        let indexes: Vec<i64> = collected.rows.iter().map(|r| r.transaction_index).collect();
        assert_eq!(indexes, vec![0, 2]);
    }
}
