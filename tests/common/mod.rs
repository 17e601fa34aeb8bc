#![allow(dead_code)]

use eth_analytics_rs::{
    config::AppConfig,
    database::DatabaseService,
    source::{ReplayFixture, ReplaySource, SourceBlock, SourceReceipt, SourceTransaction},
    App,
};
use std::sync::Arc;

pub const BASE_TIMESTAMP: u64 = 1_700_000_000;

pub fn h256(n: u64) -> String {
    format!("0x{:064x}", n)
}

pub fn addr(n: u64) -> String {
    format!("0x{:040x}", n)
}

pub fn tx_hash(block: u64, index: u64) -> String {
    h256(block * 1000 + index)
}

pub fn block_timestamp(number: u64) -> u64 {
    BASE_TIMESTAMP + number * 12
}

/// A block whose transactions are `(sender, gas price)` pairs in order
pub fn block(number: u64, txs: &[(u64, u64)]) -> SourceBlock {
    SourceBlock {
        number,
        hash: Some(h256(number)),
        parent_hash: h256(number - 1),
        timestamp: block_timestamp(number),
        gas_limit: "30000000".to_string(),
        gas_used: "126000".to_string(),
        miner: Some(addr(0xfee)),
        size: Some(1_200),
        base_fee_per_gas: Some("1".to_string()),
        transactions: txs
            .iter()
            .enumerate()
            .map(|(i, (sender, price))| SourceTransaction {
                hash: tx_hash(number, i as u64),
                index: Some(i as u64),
                from: Some(addr(*sender)),
                to: Some(addr(0xd0d0)),
                value: "1000".to_string(),
                gas_limit: "21000".to_string(),
                gas_price: Some(price.to_string()),
                nonce: i.to_string(),
            })
            .collect(),
    }
}

/// Receipts for every transaction except the hashes in `missing`
pub fn fixture(blocks: Vec<SourceBlock>, missing: &[String]) -> ReplayFixture {
    let receipts = blocks
        .iter()
        .flat_map(|b| b.transactions.iter())
        .filter(|tx| !missing.contains(&tx.hash))
        .map(|tx| {
            (
                tx.hash.clone(),
                SourceReceipt {
                    gas_used: Some("21000".to_string()),
                    status: Some(1),
                    contract_address: None,
                },
            )
        })
        .collect();
    ReplayFixture { blocks, receipts }
}

/// Block 100: five equal-price transactions, the third without a receipt.
/// Block 101: sender 0xa sandwiches sender 0xb (prices 50, 10, 55 against a mean of 20).
pub fn standard_fixture() -> ReplayFixture {
    fixture(
        vec![
            block(100, &[(1, 20), (2, 20), (3, 20), (4, 20), (5, 20)]),
            block(101, &[(0xa, 50), (0xb, 10), (0xa, 55), (0xc, 2), (0xd, 2), (0xe, 1)]),
        ],
        &[tx_hash(100, 2)],
    )
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        start_block: Some(100),
        blocks_per_batch: 10,
        fetch_max_retries: 1,
        fetch_retry_min_delay_ms: 1,
        fetch_retry_max_delay_ms: 1,
        source_timeout_ms: 1_000,
        poll_interval_ms: 10,
        ..AppConfig::default()
    }
}

pub async fn replay_app(fixture: ReplayFixture) -> Arc<App> {
    let db = Arc::new(DatabaseService::in_memory().await.unwrap());
    let source = Arc::new(ReplaySource::new(fixture));
    Arc::new(App::with_source(test_config(), db, source).unwrap())
}
