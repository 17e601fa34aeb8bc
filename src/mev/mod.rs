//! Heuristic MEV detection over stored transactions.
//!
//! Every query reads from the store and recomputes from scratch; nothing here
//! is cached or persisted.

mod detectors;
mod models;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, error};

use crate::{
    database::{DatabaseService, TimeRange, TimedTransaction, Transaction},
    numeric::{quantity_or_zero, ratio, GasMean},
};

pub use detectors::MAX_ACTORS;
pub use models::*;

/// Multiplier used for the high-gas category of a block analysis
pub const BLOCK_ANALYSIS_THRESHOLD: i64 = 2;
/// Minimum transactions for an actor to appear in trends
pub const TRENDS_MIN_TRANSACTIONS: u64 = 10;
pub const TRENDS_TOP_ACTORS: usize = 10;

/// Ordered reads the detectors run over
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Transactions of one block in index order
    async fn transactions_by_block(&self, block_number: i64) -> anyhow::Result<Vec<Transaction>>;

    /// Transactions whose block timestamp lies in `range`, in
    /// `(block_number, transaction_index)` order
    async fn transactions_in_range(
        &self,
        range: TimeRange,
    ) -> anyhow::Result<Vec<TimedTransaction>>;
}

#[async_trait]
impl TransactionStore for DatabaseService {
    async fn transactions_by_block(&self, block_number: i64) -> anyhow::Result<Vec<Transaction>> {
        self.get_transactions_by_block(block_number).await
    }

    async fn transactions_in_range(
        &self,
        range: TimeRange,
    ) -> anyhow::Result<Vec<TimedTransaction>> {
        self.get_transactions_in_range(range).await
    }
}

pub struct MevDetector {
    store: Arc<dyn TransactionStore>,
}

impl MevDetector {
    pub fn new(db: Arc<DatabaseService>) -> Self {
        Self::with_store(db)
    }

    pub fn with_store(store: Arc<dyn TransactionStore>) -> Self {
        Self { store }
    }

    /// Transactions priced above `threshold × block mean`
    pub async fn find_high_gas_outliers(
        &self,
        block_number: i64,
        threshold: Decimal,
    ) -> Result<Vec<MevFinding>, DetectionError> {
        if threshold <= Decimal::ZERO {
            return Err(DetectionError::InvalidThreshold(threshold));
        }
        let txs = self.store.transactions_by_block(block_number).await?;
        let findings = detectors::high_gas_outliers(block_number, &txs, threshold);
        debug!(
            "Block #{}: {} high-gas outliers at {}x",
            block_number,
            findings.len(),
            threshold
        );
        Ok(findings)
    }

    /// `{A, B, A}` sequences around a victim transaction
    pub async fn find_sandwich_patterns(
        &self,
        block_number: i64,
    ) -> Result<Vec<MevFinding>, DetectionError> {
        let txs = self.store.transactions_by_block(block_number).await?;
        let findings = detectors::sandwich_patterns(block_number, &txs);
        debug!("Block #{}: {} sandwich windows", block_number, findings.len());
        Ok(findings)
    }

    pub async fn identify_repeated_actors(
        &self,
        range: TimeRange,
        min_transactions: u64,
    ) -> Result<Vec<MevFinding>, DetectionError> {
        check_range(range)?;
        let txs = self.store.transactions_in_range(range).await?;
        let findings = detectors::repeated_actors(range, &txs, min_transactions);
        debug!(
            "{} repeated actors over {} transactions in [{}, {}]",
            findings.len(),
            txs.len(),
            range.start,
            range.end
        );
        Ok(findings)
    }

    async fn block_stats(&self, block_number: i64) -> Result<BlockStats, DetectionError> {
        let txs = self.store.transactions_by_block(block_number).await?;
        let prices: Vec<_> = txs.iter().map(|tx| quantity_or_zero(&tx.gas_price)).collect();
        let mean = GasMean::from_prices(&prices);
        Ok(BlockStats {
            transaction_count: mean.count(),
            average_gas_price: mean.mean_string(),
        })
    }

    /// Stats, high-gas and sandwich detection for one block. A failing
    /// category is reported in place; the others still run.
    pub async fn analyze_block(&self, block_number: i64) -> BlockAnalysis {
        self.analyze_block_at(block_number, Decimal::from(BLOCK_ANALYSIS_THRESHOLD))
            .await
    }

    /// [`Self::analyze_block`] with a caller-chosen high-gas multiplier
    pub async fn analyze_block_at(&self, block_number: i64, threshold: Decimal) -> BlockAnalysis {
        let (stats, high_gas, sandwich) = tokio::join!(
            self.block_stats(block_number),
            self.find_high_gas_outliers(block_number, threshold),
            self.find_sandwich_patterns(block_number),
        );

        for (category, err) in [
            ("stats", stats.as_ref().err()),
            ("high_gas", high_gas.as_ref().err()),
            ("sandwich", sandwich.as_ref().err()),
        ] {
            if let Some(e) = err {
                error!("Block #{} {} analysis failed: {}", block_number, category, e);
            }
        }

        let flagged = high_gas.as_ref().map(Vec::len).unwrap_or(0)
            + sandwich.as_ref().map(Vec::len).unwrap_or(0);
        let total = stats.as_ref().map(|s| s.transaction_count).unwrap_or(0);

        BlockAnalysis {
            block_number,
            stats: stats.into(),
            high_gas: high_gas.into(),
            sandwich: sandwich.into(),
            flagged_transactions: flagged as u64,
            mev_percentage: percentage(flagged as u64, total),
        }
    }

    /// Window-wide gas totals and the most suspicious senders
    pub async fn mev_trends(&self, range: TimeRange) -> Result<MevTrends, DetectionError> {
        check_range(range)?;
        let txs = self.store.transactions_in_range(range).await?;
        let (total, high_gas, mean) = detectors::high_gas_totals(&txs);

        let top_actors = self
            .identify_repeated_actors(range, TRENDS_MIN_TRANSACTIONS)
            .await
            .map(|mut actors| {
                actors.truncate(TRENDS_TOP_ACTORS);
                actors
            });
        if let Err(e) = &top_actors {
            error!("Failed to identify repeated actors for trends: {}", e);
        }

        Ok(MevTrends {
            time_range: range,
            total_transactions: total,
            average_gas_price: mean.mean_floor().map(|m| m.to_string()),
            high_gas_transactions: high_gas,
            high_gas_percentage: percentage(high_gas, total),
            top_actors: top_actors.into(),
        })
    }
}

impl MevDetector {
    /// Headline numbers and activity level for a window
    pub async fn mev_stats(&self, range: TimeRange) -> Result<MevStats, DetectionError> {
        let trends = self.mev_trends(range).await?;
        Ok(MevStats::from(&trends))
    }
}

fn check_range(range: TimeRange) -> Result<(), DetectionError> {
    if range.start > range.end {
        return Err(DetectionError::InvalidTimeRange {
            start: range.start,
            end: range.end,
        });
    }
    Ok(())
}

fn percentage(part: u64, total: u64) -> Decimal {
    ratio(
        &(num_bigint::BigUint::from(part) * 100u32),
        &num_bigint::BigUint::from(total),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Block;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(index: i64, from: &str, price: u64) -> Transaction {
        Transaction {
            hash: format!("0xt{}", index),
            block_number: 100,
            transaction_index: index,
            from_address: from.to_string(),
            to_address: Some("0xpool".to_string()),
            value: "0".to_string(),
            gas_limit: "21000".to_string(),
            gas_used: Some("21000".to_string()),
            gas_price: price.to_string(),
            nonce: "0".to_string(),
            status: Some(1),
            contract_address: None,
        }
    }

    async fn seeded(prices: &[(&str, u64)]) -> MevDetector {
        let db = Arc::new(DatabaseService::in_memory().await.unwrap());
        db.upsert_block(&Block {
            number: 100,
            hash: "0xb100".to_string(),
            parent_hash: "0xb99".to_string(),
            timestamp: 1_700_000_000,
            gas_limit: "30000000".to_string(),
            gas_used: "1000000".to_string(),
            miner: "0xminer".to_string(),
            size_bytes: None,
            transaction_count: prices.len() as i64,
            base_fee_per_gas: None,
        })
        .await
        .unwrap();

        // Inserted in reverse so only the ORDER BY gives index order
        for (index, (from, price)) in prices.iter().enumerate().rev() {
            db.upsert_transaction(&row(index as i64, from, *price))
                .await
                .unwrap();
        }
        MevDetector::new(db)
    }

    #[tokio::test]
    async fn high_gas_outlier_from_the_store() {
        let detector = seeded(&[("a", 10), ("b", 10), ("c", 10), ("d", 10), ("e", 100)]).await;
        let findings = detector
            .find_high_gas_outliers(100, Decimal::from(2))
            .await
            .unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].evidence, vec!["0xt4".to_string()]);
    }

    #[tokio::test]
    async fn rejects_non_positive_threshold() {
        let detector = seeded(&[("a", 10)]).await;
        assert!(matches!(
            detector.find_high_gas_outliers(100, Decimal::ZERO).await,
            Err(DetectionError::InvalidThreshold(_))
        ));
    }

    #[tokio::test]
    async fn sandwich_from_the_store_uses_index_order() {
        let detector =
            seeded(&[("A", 50), ("B", 10), ("A", 55), ("C", 2), ("D", 2), ("E", 1)]).await;
        let findings = detector.find_sandwich_patterns(100).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].evidence, vec!["0xt0", "0xt1", "0xt2"]);
    }

    #[tokio::test]
    async fn analyze_block_combines_categories() {
        let detector = seeded(&[("a", 10), ("b", 10), ("c", 10), ("d", 10), ("e", 100)]).await;
        let analysis = detector.analyze_block(100).await;

        let stats = analysis.stats.ok().unwrap();
        assert_eq!(stats.transaction_count, 5);
        assert_eq!(stats.average_gas_price.as_deref(), Some("28"));
        assert_eq!(analysis.high_gas.ok().unwrap().len(), 1);
        assert!(analysis.sandwich.ok().unwrap().is_empty());
        assert_eq!(analysis.flagged_transactions, 1);
        assert_eq!(analysis.mev_percentage, Decimal::from(20));
    }

    #[tokio::test]
    async fn failing_category_does_not_hide_the_others() {
        let detector =
            seeded(&[("A", 50), ("B", 10), ("A", 55), ("C", 2), ("D", 2), ("E", 1)]).await;

        let analysis = detector.analyze_block_at(100, Decimal::ZERO).await;

        assert!(analysis.high_gas.is_error());
        assert_eq!(analysis.stats.ok().unwrap().transaction_count, 6);
        assert_eq!(analysis.sandwich.ok().unwrap().len(), 1);
        assert_eq!(analysis.flagged_transactions, 1);
        assert_eq!(analysis.mev_percentage, Decimal::new(16_666_666, 6));

        let json = serde_json::to_value(&analysis).unwrap();
        assert_eq!(json["high_gas"]["status"], "error");
        assert_eq!(json["stats"]["status"], "ok");
        assert_eq!(json["sandwich"]["status"], "ok");
    }

    #[tokio::test]
    async fn unreachable_store_fails_every_category() {
        let mut store = MockTransactionStore::new();
        store
            .expect_transactions_by_block()
            .returning(|_| Err(anyhow::anyhow!("database is locked")));
        let detector = MevDetector::with_store(Arc::new(store));

        let analysis = detector.analyze_block(100).await;
        assert!(analysis.stats.is_error());
        assert!(analysis.high_gas.is_error());
        assert!(analysis.sandwich.is_error());
        assert_eq!(analysis.flagged_transactions, 0);
    }

    #[tokio::test]
    async fn failed_actor_analysis_keeps_trend_totals() {
        let rows: Vec<TimedTransaction> = [("a", 10), ("b", 10), ("c", 10), ("d", 10), ("e", 100)]
            .iter()
            .enumerate()
            .map(|(i, (from, price))| TimedTransaction {
                transaction: row(i as i64, from, *price),
                block_timestamp: 1_700_000_000,
            })
            .collect();

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut store = MockTransactionStore::new();
        store.expect_transactions_in_range().returning(move |_| {
            // Totals are read first, the actor analysis second
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(rows.clone())
            } else {
                Err(anyhow::anyhow!("database is locked"))
            }
        });
        let detector = MevDetector::with_store(Arc::new(store));

        let trends = detector
            .mev_trends(TimeRange::new(1_699_999_999, 1_700_000_001))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(trends.total_transactions, 5);
        assert_eq!(trends.high_gas_transactions, 1);
        assert_eq!(trends.high_gas_percentage, Decimal::from(20));
        assert!(trends.top_actors.is_error());

        let stats = MevStats::from(&trends);
        assert_eq!(stats.top_mev_bots_count, None);
        assert_eq!(stats.mev_activity_level, ActivityLevel::High);
    }

    #[tokio::test]
    async fn trends_summarise_the_window() {
        let detector = seeded(&[("a", 10), ("b", 10), ("c", 10), ("d", 10), ("e", 100)]).await;
        let trends = detector
            .mev_trends(TimeRange::new(1_699_999_999, 1_700_000_001))
            .await
            .unwrap();

        assert_eq!(trends.total_transactions, 5);
        assert_eq!(trends.high_gas_transactions, 1);
        assert_eq!(trends.average_gas_price.as_deref(), Some("28"));
        assert!(trends.top_actors.ok().unwrap().is_empty());

        let outside = detector
            .mev_trends(TimeRange::new(0, 10))
            .await
            .unwrap();
        assert_eq!(outside.total_transactions, 0);
        assert!(matches!(
            detector.mev_trends(TimeRange::new(10, 0)).await,
            Err(DetectionError::InvalidTimeRange { .. })
        ));
    }
}
