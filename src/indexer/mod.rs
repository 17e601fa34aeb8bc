mod block_processor;
mod decode;
mod fetcher;
mod transaction_processor;

use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use thiserror::Error;
use tokio::{sync::Mutex, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::AppConfig,
    database::DatabaseService,
    hub::{BlockEvent, BroadcastEvent, Hub, StatsEvent, TransactionEvent},
    source::{BlockSource, SourceError},
};

use block_processor::BlockProcessor;
pub use decode::DecodeError;
pub use fetcher::Fetcher;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to fetch block #{height}: {source}")]
    FetchFailed { height: u64, source: SourceError },

    #[error("failed to decode block #{height}: {source}")]
    DecodeFailed { height: u64, source: DecodeError },

    #[error("failed to persist block #{height}: {message}")]
    PersistFailed { height: u64, message: String },
}

impl IngestError {
    /// Fetch and decode failures skip the height; persistence failures end the pass
    pub fn skips_height(&self) -> bool {
        !matches!(self, IngestError::PersistFailed { .. })
    }
}

/// Result of ingesting one height
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub block_number: u64,
    pub transactions_stored: usize,
    pub transactions_skipped: usize,
    /// False when the stored block already had this hash
    pub broadcast: bool,
}

/// What one sync pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub latest_height: u64,
    pub blocks_ingested: usize,
    pub gaps_retried: usize,
    pub heights_skipped: usize,
}

#[derive(Default)]
struct IngestCounters {
    blocks_ingested: AtomicU64,
    transactions_stored: AtomicU64,
    transactions_skipped: AtomicU64,
    gaps_recorded: AtomicU64,
    broadcasts_suppressed: AtomicU64,
}

/// Counter snapshot for the stats endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub running: bool,
    pub blocks_ingested: u64,
    pub transactions_stored: u64,
    pub transactions_skipped: u64,
    pub gaps_recorded: u64,
    pub broadcasts_suppressed: u64,
}

/// Heights to ingest in the next pass, oldest first
pub fn plan_heights(
    latest_stored: Option<i64>,
    latest_chain: u64,
    start_block: Option<u64>,
    initial_backfill: u64,
    batch: usize,
) -> Vec<u64> {
    let next = match latest_stored {
        Some(stored) => u64::try_from(stored).map(|s| s + 1).unwrap_or(0),
        None => start_block.unwrap_or_else(|| (latest_chain + 1).saturating_sub(initial_backfill)),
    };
    if next > latest_chain || batch == 0 {
        return Vec::new();
    }
    let end = latest_chain.min(next + batch as u64 - 1);
    (next..=end).collect()
}

/// Service for indexing blockchain data
pub struct IndexerService {
    db: Arc<DatabaseService>,
    hub: Hub,
    fetcher: Fetcher,
    config: AppConfig,
    block_processor: BlockProcessor,
    is_running: AtomicBool,
    ingest_lock: Mutex<()>,
    counters: IngestCounters,
}

impl IndexerService {
    pub fn new(
        db: Arc<DatabaseService>,
        source: Arc<dyn BlockSource>,
        hub: Hub,
        config: AppConfig,
    ) -> Self {
        let fetcher = Fetcher::new(source, &config);
        let block_processor = BlockProcessor::new(db.clone(), fetcher.clone());

        Self {
            db,
            hub,
            fetcher,
            config,
            block_processor,
            is_running: AtomicBool::new(false),
            ingest_lock: Mutex::new(()),
            counters: IngestCounters::default(),
        }
    }

    /// Run sync passes until `shutdown` is cancelled
    pub async fn start_service(&self, shutdown: CancellationToken) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Indexer is already running");
            return;
        }
        info!("Starting indexer service");

        while !shutdown.is_cancelled() {
            match self.sync_blocks(&shutdown).await {
                Ok(summary) if summary.blocks_ingested > 0 => info!(
                    "Pass complete: {} blocks ingested, {} gaps retried, {} skipped (head #{})",
                    summary.blocks_ingested,
                    summary.gaps_retried,
                    summary.heights_skipped,
                    summary.latest_height
                ),
                Ok(_) => debug!("Already in sync, no new blocks to process"),
                Err(e) => error!("Error syncing blocks: {:#}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = time::sleep(self.config.poll_interval()) => {}
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("Indexer service stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            running: self.is_running(),
            blocks_ingested: self.counters.blocks_ingested.load(Ordering::Relaxed),
            transactions_stored: self.counters.transactions_stored.load(Ordering::Relaxed),
            transactions_skipped: self.counters.transactions_skipped.load(Ordering::Relaxed),
            gaps_recorded: self.counters.gaps_recorded.load(Ordering::Relaxed),
            broadcasts_suppressed: self.counters.broadcasts_suppressed.load(Ordering::Relaxed),
        }
    }

    /// One pass: retry recorded gaps, then ingest up to a batch of new
    /// heights. Stops early on shutdown or on a persistence failure.
    pub async fn sync_blocks(&self, shutdown: &CancellationToken) -> Result<PassSummary> {
        let latest_chain = self
            .fetcher
            .latest_height()
            .await
            .context("Failed to fetch latest block height")?;

        let mut summary = PassSummary {
            latest_height: latest_chain,
            ..Default::default()
        };

        let gaps = match self.db.get_gaps(self.config.blocks_per_batch as i64).await {
            Ok(gaps) => gaps,
            Err(e) => {
                warn!("Failed to load ingestion gaps: {:#}", e);
                Vec::new()
            }
        };
        let gap_heights: Vec<u64> = gaps
            .iter()
            .filter_map(|gap| u64::try_from(gap.block_number).ok())
            .collect();

        let latest_stored = self.db.get_latest_block_number().await?;
        let mut targets = plan_heights(
            latest_stored,
            latest_chain,
            self.config.start_block,
            self.config.initial_backfill,
            self.config.blocks_per_batch,
        );

        targets.retain(|height| !gap_heights.contains(height));
        if !targets.is_empty() {
            info!(
                "Syncing blocks #{}..=#{} (chain head #{})",
                targets[0],
                targets[targets.len() - 1],
                latest_chain
            );
        }

        let is_gap_retry = |height: u64| gap_heights.contains(&height);
        for height in gap_heights.iter().copied().chain(targets) {
            if shutdown.is_cancelled() {
                info!("Shutdown requested, ending pass before block #{}", height);
                break;
            }

            match self.ingest_block(height).await {
                Ok(_) => {
                    summary.blocks_ingested += 1;
                    if is_gap_retry(height) {
                        summary.gaps_retried += 1;
                    }
                }
                Err(e) if e.skips_height() => {
                    summary.heights_skipped += 1;
                }
                Err(e) => {
                    error!("{}", e);
                    self.publish_network_stats(latest_chain, &summary).await;
                    return Err(e.into());
                }
            }
        }

        self.publish_network_stats(latest_chain, &summary).await;
        Ok(summary)
    }

    /// Fetch, decode and persist one height, then broadcast it unless the
    /// stored block already had the same hash.
    pub async fn ingest_block(&self, height: u64) -> Result<IngestOutcome, IngestError> {
        let _guard = self.ingest_lock.lock().await;

        let processed = match self.block_processor.process_block(height).await {
            Ok(processed) => processed,
            Err(e) => {
                if e.skips_height() {
                    self.record_gap(height, &e).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.db.clear_gap(processed.block.number).await {
            warn!("Failed to clear gap for block #{}: {:#}", height, e);
        }

        let stored = processed.write.stored.len();
        self.counters.blocks_ingested.fetch_add(1, Ordering::Relaxed);
        self.counters
            .transactions_stored
            .fetch_add(stored as u64, Ordering::Relaxed);
        self.counters
            .transactions_skipped
            .fetch_add(processed.skipped as u64, Ordering::Relaxed);

        let broadcast = !processed.write.is_replay_of(&processed.block.hash);
        if broadcast {
            self.hub
                .broadcast(BroadcastEvent::BlockUpdate(BlockEvent::from(&processed.block)));
            for tx in &processed.write.stored {
                self.hub
                    .broadcast(BroadcastEvent::TransactionUpdate(TransactionEvent::from(tx)));
            }
        } else {
            debug!("Block #{} unchanged, not re-broadcasting", height);
            self.counters
                .broadcasts_suppressed
                .fetch_add(1, Ordering::Relaxed);
        }

        info!(
            "Processed block #{} ({} transactions stored, {} skipped)",
            height, stored, processed.skipped
        );

        Ok(IngestOutcome {
            block_number: height,
            transactions_stored: stored,
            transactions_skipped: processed.skipped,
            broadcast,
        })
    }

    async fn record_gap(&self, height: u64, err: &IngestError) {
        warn!("Skipping block #{}: {}", height, err);
        self.counters.gaps_recorded.fetch_add(1, Ordering::Relaxed);

        let Ok(number) = i64::try_from(height) else {
            return;
        };
        if let Err(e) = self.db.record_gap(number, &err.to_string()).await {
            error!("Failed to record gap for block #{}: {:#}", height, e);
        }
    }

    async fn publish_network_stats(&self, latest_chain: u64, summary: &PassSummary) {
        if summary.blocks_ingested == 0 {
            return;
        }
        match self.db.get_stats().await {
            Ok(stats) => self.hub.broadcast(BroadcastEvent::NetworkStats(StatsEvent::now(
                latest_chain,
                stats.latest_block,
                stats.ingestion_gaps,
            ))),
            Err(e) => warn!("Failed to load stats for network_stats event: {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        hub::Subscription,
        source::{MockBlockSource, SourceBlock, SourceReceipt, SourceTransaction},
    };

    fn h256(n: u64) -> String {
        format!("0x{:064x}", n)
    }

    fn addr(n: u64) -> String {
        format!("0x{:040x}", n)
    }

    fn source_block(number: u64, tx_count: u64) -> SourceBlock {
        SourceBlock {
            number,
            hash: Some(h256(number)),
            parent_hash: h256(number.saturating_sub(1)),
            timestamp: 1_700_000_000 + number * 12,
            gas_limit: "30000000".to_string(),
            gas_used: "105000".to_string(),
            miner: Some(addr(0xfee)),
            size: Some(1000),
            base_fee_per_gas: Some("7".to_string()),
            transactions: (0..tx_count)
                .map(|i| SourceTransaction {
                    hash: h256(number * 1000 + i),
                    index: Some(i),
                    from: Some(addr(i + 1)),
                    to: Some(addr(0xbeef)),
                    value: "1".to_string(),
                    gas_limit: "21000".to_string(),
                    gas_price: Some("20000000000".to_string()),
                    nonce: "0".to_string(),
                })
                .collect(),
        }
    }

    fn test_config() -> AppConfig {
        AppConfig {
            fetch_max_retries: 1,
            fetch_retry_min_delay_ms: 1,
            fetch_retry_max_delay_ms: 1,
            source_timeout_ms: 1_000,
            blocks_per_batch: 10,
            initial_backfill: 3,
            ..AppConfig::default()
        }
    }

    async fn service(source: MockBlockSource) -> (IndexerService, Arc<DatabaseService>, Hub) {
        let db = Arc::new(DatabaseService::in_memory().await.unwrap());
        let (hub, _handle) = Hub::start(1024);
        let indexer = IndexerService::new(db.clone(), Arc::new(source), hub.clone(), test_config());
        (indexer, db, hub)
    }

    async fn drain(hub: &Hub, subscription: &mut Subscription) -> Vec<BroadcastEvent> {
        // Commands are handled in order, so this returns after every earlier broadcast
        hub.client_count().await;
        let mut events = Vec::new();
        while let Ok(frame) = subscription.queue.try_recv() {
            events.push(serde_json::from_str(&frame).unwrap());
        }
        events
    }

    #[test]
    fn plans_resume_after_the_stored_head() {
        assert_eq!(plan_heights(Some(10), 14, None, 5, 10), vec![11, 12, 13, 14]);
        assert_eq!(plan_heights(Some(10), 30, None, 5, 3), vec![11, 12, 13]);
        assert!(plan_heights(Some(14), 14, None, 5, 10).is_empty());
    }

    #[test]
    fn plans_initial_backfill_or_start_block() {
        assert_eq!(plan_heights(None, 100, None, 5, 10), vec![96, 97, 98, 99, 100]);
        assert_eq!(plan_heights(None, 100, Some(98), 5, 10), vec![98, 99, 100]);
        assert_eq!(plan_heights(None, 2, None, 5, 10), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn receipt_failure_skips_only_that_transaction() {
        let bad_hash = h256(7 * 1000 + 2);
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|h| Ok(source_block(h, 5)));
        source.expect_receipt().returning(move |hash: &str| {
            if hash == bad_hash {
                Err(SourceError::Unavailable("receipt timeout".to_string()))
            } else {
                Ok(SourceReceipt {
                    gas_used: Some("21000".to_string()),
                    status: Some(1),
                    contract_address: None,
                })
            }
        });

        let (indexer, db, _hub) = service(source).await;
        let outcome = indexer.ingest_block(7).await.unwrap();

        assert_eq!(outcome.transactions_stored, 4);
        assert_eq!(outcome.transactions_skipped, 1);
        let block = db.get_block_by_number(7).await.unwrap().unwrap();
        assert_eq!(block.transaction_count, 5);
        assert_eq!(db.count_transactions(7).await.unwrap(), 4);
        assert_eq!(indexer.stats().transactions_skipped, 1);
    }

    #[tokio::test]
    async fn unchanged_block_is_not_broadcast_twice() {
        let mut source = MockBlockSource::new();
        source.expect_block().returning(|h| Ok(source_block(h, 2)));
        source
            .expect_receipt()
            .returning(|_| Ok(SourceReceipt::default()));

        let (indexer, _db, hub) = service(source).await;
        let mut subscription = hub.register().unwrap();

        let first = indexer.ingest_block(3).await.unwrap();
        assert!(first.broadcast);
        let events = drain(&hub, &mut subscription).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].topic(), "block_update");
        assert_eq!(events[1].topic(), "transaction_update");

        let second = indexer.ingest_block(3).await.unwrap();
        assert!(!second.broadcast);
        assert!(drain(&hub, &mut subscription).await.is_empty());
        assert_eq!(indexer.stats().broadcasts_suppressed, 1);
    }

    #[tokio::test]
    async fn exhausted_fetch_records_a_gap() {
        let mut source = MockBlockSource::new();
        source
            .expect_block()
            .returning(|_| Err(SourceError::Unavailable("node down".to_string())));

        let (indexer, db, _hub) = service(source).await;
        let err = indexer.ingest_block(9).await.unwrap_err();

        assert!(matches!(err, IngestError::FetchFailed { height: 9, .. }));
        let gaps = db.get_gaps(10).await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].block_number, 9);
        assert!(db.get_block_by_number(9).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pass_skips_bad_heights_and_publishes_stats() {
        let mut source = MockBlockSource::new();
        source.expect_latest_height().returning(|| Ok(12));
        source.expect_block().returning(|h| {
            if h == 11 {
                let mut block = source_block(h, 0);
                block.hash = None;
                Ok(block)
            } else {
                Ok(source_block(h, 0))
            }
        });

        let (indexer, db, hub) = service(source).await;
        let mut subscription = hub.register().unwrap();
        let summary = indexer.sync_blocks(&CancellationToken::new()).await.unwrap();

        // initial backfill of 3 ending at the head
        assert_eq!(summary.blocks_ingested, 2);
        assert_eq!(summary.heights_skipped, 1);
        assert_eq!(db.get_latest_block_number().await.unwrap(), Some(12));
        assert_eq!(db.get_gaps(10).await.unwrap()[0].block_number, 11);

        let events = drain(&hub, &mut subscription).await;
        let last = events.last().unwrap();
        match last {
            BroadcastEvent::NetworkStats(stats) => {
                assert_eq!(stats.latest_block, 12);
                assert_eq!(stats.indexed_block, Some(12));
                assert_eq!(stats.ingestion_gaps, 1);
            }
            other => panic!("expected network_stats, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_pass_ingests_nothing() {
        let mut source = MockBlockSource::new();
        source.expect_latest_height().returning(|| Ok(5));
        source.expect_block().never();

        let (indexer, _db, _hub) = service(source).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let summary = indexer.sync_blocks(&shutdown).await.unwrap();
        assert_eq!(summary.blocks_ingested, 0);
    }
}
