mod models;

use anyhow::{Context, Result};
use sqlx::{
    migrate::MigrateDatabase,
    pool::PoolOptions,
    sqlite::{SqliteConnectOptions, SqliteConnection},
    Acquire, Pool, Sqlite,
};
use std::{path::Path, str::FromStr};
use tracing::{debug, info, warn};

pub use models::*;

/// Service for database operations
pub struct DatabaseService {
    pub pool: Pool<Sqlite>,
}

impl DatabaseService {
    /// Create a new database service
    pub async fn new(database_url: &str) -> Result<Self> {
        if database_url.contains(":memory:") {
            return Self::in_memory().await;
        }

        let clean_url = sqlite_path(database_url).to_string();

        // Create database directory if needed
        if let Some(db_path) = Path::new(&clean_url).parent() {
            if !db_path.as_os_str().is_empty() && !db_path.exists() {
                std::fs::create_dir_all(db_path).context("Failed to create database directory")?;
                info!("Created database directory: {:?}", db_path);
            }
        }

        // Check if database exists, create if not
        if !Sqlite::database_exists(&clean_url).await.unwrap_or(false) {
            info!("Database does not exist, creating...");
            Sqlite::create_database(&clean_url)
                .await
                .context("Failed to create database")?;
        }

        let options = SqliteConnectOptions::from_str(&clean_url)
            .context("Invalid database URL")?
            .foreign_keys(true);

        // Connect to the database
        let pool = PoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database, used by replay runs and tests.
    ///
    /// Every SQLite connection gets its own memory database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("Invalid in-memory database URL")?
            .foreign_keys(true);

        let pool = PoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: Pool<Sqlite>) -> Result<Self> {
        // Run migrations
        info!("Running database migrations...");
        sqlx::migrate!("./src/database/migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database initialized successfully");
        Ok(Self { pool })
    }

    /// Insert or update a block by number
    pub async fn upsert_block(&self, block: &Block) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        upsert_block_on(&mut conn, block)
            .await
            .context("Failed to upsert block")
    }

    /// Insert or update a transaction by hash
    pub async fn upsert_transaction(&self, tx: &Transaction) -> Result<()> {
        let mut conn = self.pool.acquire().await.context("Failed to acquire connection")?;
        upsert_transaction_on(&mut conn, tx)
            .await
            .context("Failed to upsert transaction")
    }

    /// Write a block and its transactions as one atomic unit.
    ///
    /// The block row must succeed or nothing is committed. Each transaction row
    /// runs inside its own savepoint; a rejected row is rolled back alone and
    /// counted in [`BlockWrite::rejected`].
    pub async fn write_block(&self, block: &Block, transactions: &[Transaction]) -> Result<BlockWrite> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin block transaction")?;

        let previous_hash: Option<String> =
            sqlx::query_scalar("SELECT hash FROM blocks WHERE number = ?")
                .bind(block.number)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to read stored block hash")?;

        upsert_block_on(&mut tx, block)
            .await
            .context("Failed to upsert block")?;

        let mut stored = Vec::with_capacity(transactions.len());
        let mut rejected = 0;
        for row in transactions {
            let mut savepoint = (&mut tx)
                .begin()
                .await
                .context("Failed to open transaction savepoint")?;

            match upsert_transaction_on(&mut savepoint, row).await {
                Ok(()) => {
                    savepoint
                        .commit()
                        .await
                        .context("Failed to release transaction savepoint")?;
                    stored.push(row.clone());
                }
                Err(e) => {
                    warn!(
                        "Rejected transaction {} in block #{}: {}",
                        row.hash, block.number, e
                    );
                    savepoint
                        .rollback()
                        .await
                        .context("Failed to roll back transaction savepoint")?;
                    rejected += 1;
                }
            }
        }

        tx.commit().await.context("Failed to commit block")?;

        debug!(
            "Block #{} written: {} transactions stored, {} rejected",
            block.number,
            stored.len(),
            rejected
        );

        Ok(BlockWrite {
            previous_hash,
            stored,
            rejected,
        })
    }

    /// Number of stored transaction rows for a block
    pub async fn count_transactions(&self, block_number: i64) -> Result<i64> {
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE block_number = ?")
            .bind(block_number)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count transactions")?;

        Ok(result.0)
    }

    /// Get the latest block number
    pub async fn get_latest_block_number(&self) -> Result<Option<i64>> {
        let result: (Option<i64>,) = sqlx::query_as("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .context("Failed to query latest block number")?;

        Ok(result.0)
    }

    /// Get block by number
    pub async fn get_block_by_number(&self, number: i64) -> Result<Option<Block>> {
        let result = sqlx::query_as::<_, Block>(
            r#"
            SELECT number, hash, parent_hash, timestamp, gas_limit, gas_used, miner,
                   size_bytes, transaction_count, base_fee_per_gas
            FROM blocks
            WHERE number = ?
            "#,
        )
        .bind(number)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query block by number")?;

        Ok(result)
    }

    /// Transactions of one block in canonical in-block order
    pub async fn get_transactions_by_block(&self, block_number: i64) -> Result<Vec<Transaction>> {
        let result = sqlx::query_as::<_, Transaction>(
            r#"
            SELECT hash, block_number, transaction_index, from_address, to_address, value,
                   gas_limit, gas_used, gas_price, nonce, status, contract_address
            FROM transactions
            WHERE block_number = ?
            ORDER BY transaction_index ASC
            "#,
        )
        .bind(block_number)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query transactions by block")?;

        Ok(result)
    }

    /// Transactions whose block timestamp falls in `range`, ordered by
    /// `(block_number, transaction_index)`
    pub async fn get_transactions_in_range(&self, range: TimeRange) -> Result<Vec<TimedTransaction>> {
        let result = sqlx::query_as::<_, TimedTransaction>(
            r#"
            SELECT t.hash, t.block_number, t.transaction_index, t.from_address, t.to_address,
                   t.value, t.gas_limit, t.gas_used, t.gas_price, t.nonce, t.status,
                   t.contract_address, b.timestamp AS block_timestamp
            FROM transactions t
            JOIN blocks b ON t.block_number = b.number
            WHERE b.timestamp BETWEEN ? AND ?
            ORDER BY t.block_number ASC, t.transaction_index ASC
            "#,
        )
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query transactions in time range")?;

        Ok(result)
    }

    /// Record (or bump) an ingestion gap for a skipped height
    pub async fn record_gap(&self, block_number: i64, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingestion_gaps (block_number, reason, attempts, recorded_at)
            VALUES (?, ?, 1, ?)
            ON CONFLICT(block_number) DO UPDATE SET
                reason = excluded.reason,
                attempts = ingestion_gaps.attempts + 1,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(block_number)
        .bind(reason)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to record ingestion gap")?;

        Ok(())
    }

    /// Forget a gap once its height has been ingested
    pub async fn clear_gap(&self, block_number: i64) -> Result<()> {
        sqlx::query("DELETE FROM ingestion_gaps WHERE block_number = ?")
            .bind(block_number)
            .execute(&self.pool)
            .await
            .context("Failed to clear ingestion gap")?;

        Ok(())
    }

    /// Oldest gaps first
    pub async fn get_gaps(&self, limit: i64) -> Result<Vec<IngestionGap>> {
        let gaps = sqlx::query_as::<_, IngestionGap>(
            r#"
            SELECT block_number, reason, attempts, recorded_at
            FROM ingestion_gaps
            ORDER BY block_number ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query ingestion gaps")?;

        Ok(gaps)
    }

    /// Totals for the stats endpoint and the network_stats event
    pub async fn get_stats(&self) -> Result<StoreStats> {
        let (total_blocks, declared): (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), SUM(transaction_count) FROM blocks")
                .fetch_one(&self.pool)
                .await
                .context("Failed to query block totals")?;

        let (indexed,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions")
            .fetch_one(&self.pool)
            .await
            .context("Failed to query transaction count")?;

        let (gaps,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ingestion_gaps")
            .fetch_one(&self.pool)
            .await
            .context("Failed to query gap count")?;

        Ok(StoreStats {
            latest_block: self.get_latest_block_number().await?,
            total_blocks,
            total_transactions_declared: declared.unwrap_or(0),
            total_transactions_indexed: indexed,
            ingestion_gaps: gaps,
        })
    }

    /// Administrative reset: drop every stored row
    pub async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("Failed to begin reset")?;
        for table in ["transactions", "blocks", "ingestion_gaps"] {
            sqlx::query(&format!("DELETE FROM {}", table))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("Failed to clear {}", table))?;
        }
        tx.commit().await.context("Failed to commit reset")?;
        warn!("Database reset: all blocks, transactions and gaps removed");
        Ok(())
    }
}

/// File path part of a `sqlite:` or `sqlite://` URL
pub fn sqlite_path(database_url: &str) -> &str {
    database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url)
}

async fn upsert_block_on(conn: &mut SqliteConnection, block: &Block) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO blocks (
            number, hash, parent_hash, timestamp, gas_limit, gas_used, miner,
            size_bytes, transaction_count, base_fee_per_gas
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(number) DO UPDATE SET
            hash = excluded.hash,
            parent_hash = excluded.parent_hash,
            timestamp = excluded.timestamp,
            gas_limit = excluded.gas_limit,
            gas_used = excluded.gas_used,
            miner = excluded.miner,
            size_bytes = excluded.size_bytes,
            transaction_count = excluded.transaction_count,
            base_fee_per_gas = excluded.base_fee_per_gas,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(block.number)
    .bind(&block.hash)
    .bind(&block.parent_hash)
    .bind(block.timestamp)
    .bind(&block.gas_limit)
    .bind(&block.gas_used)
    .bind(&block.miner)
    .bind(block.size_bytes)
    .bind(block.transaction_count)
    .bind(&block.base_fee_per_gas)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn upsert_transaction_on(conn: &mut SqliteConnection, tx: &Transaction) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            hash, block_number, transaction_index, from_address, to_address, value,
            gas_limit, gas_used, gas_price, nonce, status, contract_address
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(hash) DO UPDATE SET
            block_number = excluded.block_number,
            transaction_index = excluded.transaction_index,
            from_address = excluded.from_address,
            to_address = excluded.to_address,
            value = excluded.value,
            gas_limit = excluded.gas_limit,
            gas_used = excluded.gas_used,
            gas_price = excluded.gas_price,
            nonce = excluded.nonce,
            status = excluded.status,
            contract_address = excluded.contract_address,
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&tx.hash)
    .bind(tx.block_number)
    .bind(tx.transaction_index)
    .bind(&tx.from_address)
    .bind(&tx.to_address)
    .bind(&tx.value)
    .bind(&tx.gas_limit)
    .bind(&tx.gas_used)
    .bind(&tx.gas_price)
    .bind(&tx.nonce)
    .bind(tx.status)
    .bind(&tx.contract_address)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: i64, hash: &str, declared: i64) -> Block {
        Block {
            number,
            hash: hash.to_string(),
            parent_hash: format!("0xparent{}", number),
            timestamp: 1_700_000_000 + number * 12,
            gas_limit: "30000000".to_string(),
            gas_used: "12000000".to_string(),
            miner: "0x0000000000000000000000000000000000000001".to_string(),
            size_bytes: Some(1024),
            transaction_count: declared,
            base_fee_per_gas: Some("7000000000".to_string()),
        }
    }

    fn transaction(block_number: i64, index: i64, gas_price: &str) -> Transaction {
        Transaction {
            hash: format!("0xtx{}_{}", block_number, index),
            block_number,
            transaction_index: index,
            from_address: format!("0xsender{}", index % 3),
            to_address: Some("0xrecipient".to_string()),
            value: "1000000000000000000000000".to_string(),
            gas_limit: "21000".to_string(),
            gas_used: Some("21000".to_string()),
            gas_price: gas_price.to_string(),
            nonce: index.to_string(),
            status: Some(1),
            contract_address: None,
        }
    }

    #[tokio::test]
    async fn upserts_are_idempotent() {
        let db = DatabaseService::in_memory().await.unwrap();
        let b = block(100, "0xaaa", 1);
        let t = transaction(100, 0, "20000000000");

        db.upsert_block(&b).await.unwrap();
        db.upsert_transaction(&t).await.unwrap();
        let once_block = db.get_block_by_number(100).await.unwrap();
        let once_txs = db.get_transactions_by_block(100).await.unwrap();

        db.upsert_block(&b).await.unwrap();
        db.upsert_transaction(&t).await.unwrap();
        let twice_block = db.get_block_by_number(100).await.unwrap();
        let twice_txs = db.get_transactions_by_block(100).await.unwrap();

        assert_eq!(once_block, twice_block);
        assert_eq!(once_txs, twice_txs);
        assert_eq!(db.count_transactions(100).await.unwrap(), 1);
        assert_eq!(once_block.unwrap(), b);
    }

    #[tokio::test]
    async fn transactions_come_back_in_index_order() {
        let db = DatabaseService::in_memory().await.unwrap();
        db.upsert_block(&block(7, "0xb7", 5)).await.unwrap();
        for index in [4, 1, 3, 0, 2] {
            db.upsert_transaction(&transaction(7, index, "1")).await.unwrap();
        }

        let indexes: Vec<i64> = db
            .get_transactions_by_block(7)
            .await
            .unwrap()
            .iter()
            .map(|t| t.transaction_index)
            .collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn range_query_orders_by_block_then_index() {
        let db = DatabaseService::in_memory().await.unwrap();
        db.upsert_block(&block(2, "0xb2", 2)).await.unwrap();
        db.upsert_block(&block(1, "0xb1", 2)).await.unwrap();
        db.upsert_transaction(&transaction(2, 1, "1")).await.unwrap();
        db.upsert_transaction(&transaction(1, 1, "1")).await.unwrap();
        db.upsert_transaction(&transaction(2, 0, "1")).await.unwrap();
        db.upsert_transaction(&transaction(1, 0, "1")).await.unwrap();

        let range = TimeRange::new(0, i64::MAX);
        let order: Vec<(i64, i64)> = db
            .get_transactions_in_range(range)
            .await
            .unwrap()
            .iter()
            .map(|t| (t.transaction.block_number, t.transaction.transaction_index))
            .collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0), (2, 1)]);
    }

    #[tokio::test]
    async fn write_block_reports_previous_hash() {
        let db = DatabaseService::in_memory().await.unwrap();
        let b = block(9, "0xb9", 2);
        let txs = vec![transaction(9, 0, "5"), transaction(9, 1, "6")];

        let first = db.write_block(&b, &txs).await.unwrap();
        assert_eq!(first.previous_hash, None);
        assert_eq!(first.stored.len(), 2);
        assert_eq!(first.rejected, 0);

        let second = db.write_block(&b, &txs).await.unwrap();
        assert!(second.is_replay_of("0xb9"));
        assert_eq!(db.count_transactions(9).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rejected_row_does_not_abort_the_block() {
        let db = DatabaseService::in_memory().await.unwrap();
        let b = block(11, "0xb11", 2);
        let good = transaction(11, 0, "5");
        // References a block that does not exist, so the foreign key rejects it
        let orphan = transaction(12, 1, "5");

        let write = db.write_block(&b, &[good, orphan]).await.unwrap();
        assert_eq!(write.stored.len(), 1);
        assert_eq!(write.rejected, 1);
        assert!(db.get_block_by_number(11).await.unwrap().is_some());
        assert_eq!(db.count_transactions(11).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn gaps_are_recorded_and_cleared() {
        let db = DatabaseService::in_memory().await.unwrap();
        db.record_gap(42, "timeout").await.unwrap();
        db.record_gap(42, "timeout").await.unwrap();

        let gaps = db.get_gaps(10).await.unwrap();
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].attempts, 2);

        db.clear_gap(42).await.unwrap();
        assert!(db.get_gaps(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_empties_every_table() {
        let db = DatabaseService::in_memory().await.unwrap();
        db.write_block(&block(3, "0xb3", 1), &[transaction(3, 0, "9")])
            .await
            .unwrap();
        db.record_gap(4, "not found").await.unwrap();

        db.reset().await.unwrap();

        let stats = db.get_stats().await.unwrap();
        assert_eq!(stats.total_blocks, 0);
        assert_eq!(stats.total_transactions_indexed, 0);
        assert_eq!(stats.ingestion_gaps, 0);
        assert_eq!(db.get_latest_block_number().await.unwrap(), None);
    }

    #[test]
    fn sqlite_urls_resolve_to_relative_paths() {
        assert_eq!(sqlite_path("sqlite://./data/x.db"), "./data/x.db");
        assert_eq!(sqlite_path("sqlite:./data/x.db"), "./data/x.db");
        assert_eq!(sqlite_path("data/x.db"), "data/x.db");
    }

    #[tokio::test]
    async fn double_slash_url_creates_the_database_directory() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/nested/store.db", dir.path().display());

        let db = DatabaseService::new(&url).await.unwrap();
        db.upsert_block(&block(1, "0xb1", 0)).await.unwrap();

        assert!(dir.path().join("nested").join("store.db").exists());
    }
}
