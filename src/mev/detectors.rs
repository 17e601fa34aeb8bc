//! Pure MEV heuristics over transactions already ordered by
//! `(block_number, transaction_index)`.

use num_bigint::BigUint;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

use super::models::{
    ActorPattern, ActorProfile, FindingKind, FindingScope, FlaggedTransaction, MevFinding,
};
use crate::{
    database::{TimeRange, TimedTransaction, Transaction},
    numeric::{quantity_or_zero, ratio, GasMean},
};

/// Front- and back-run legs must exceed this multiple of the block mean
const SANDWICH_MULTIPLIER: Decimal = Decimal::from_parts(15, 0, 0, false, 1);
const SANDWICH_SCORE: i64 = 8;

/// A transaction counts as high-gas above this multiple of its block mean
const ACTOR_HIGH_GAS_MULTIPLIER: i64 = 2;
const ACTOR_CONSECUTIVE_LIMIT: u64 = 10;
const ACTOR_HIGH_VOLUME: u64 = 1000;
pub const MAX_ACTORS: usize = 50;

fn flagged(tx: &Transaction) -> FlaggedTransaction {
    FlaggedTransaction {
        hash: tx.hash.clone(),
        transaction_index: tx.transaction_index,
        from_address: tx.from_address.clone(),
        gas_price: tx.gas_price.clone(),
    }
}

/// Transactions of one block whose gas price exceeds `multiplier × mean`,
/// ordered by gas price (highest first) and then by index.
pub fn high_gas_outliers(
    block_number: i64,
    txs: &[Transaction],
    multiplier: Decimal,
) -> Vec<MevFinding> {
    let prices: Vec<BigUint> = txs.iter().map(|tx| quantity_or_zero(&tx.gas_price)).collect();
    let mean = GasMean::from_prices(&prices);
    if mean.is_empty() {
        return Vec::new();
    }

    let mut outliers: Vec<(&Transaction, &BigUint)> = txs
        .iter()
        .zip(&prices)
        .filter(|(_, price)| mean.exceeded_by(price, multiplier))
        .collect();
    outliers.sort_by(|(a, pa), (b, pb)| {
        pb.cmp(pa)
            .then(a.transaction_index.cmp(&b.transaction_index))
    });

    outliers
        .into_iter()
        .map(|(tx, price)| MevFinding {
            kind: FindingKind::HighGas,
            score: mean.premium(price),
            evidence: vec![tx.hash.clone()],
            scope: FindingScope::Block(block_number),
            transaction: Some(flagged(tx)),
            actor: None,
        })
        .collect()
}

/// Every `{A, B, A}` window where both A legs are priced above 1.5× the
/// block mean. Overlapping windows are each reported.
pub fn sandwich_patterns(block_number: i64, txs: &[Transaction]) -> Vec<MevFinding> {
    let prices: Vec<BigUint> = txs.iter().map(|tx| quantity_or_zero(&tx.gas_price)).collect();
    let mean = GasMean::from_prices(&prices);
    if mean.is_empty() {
        return Vec::new();
    }

    let mut findings = Vec::new();
    for start in 0..txs.len().saturating_sub(2) {
        let (front, victim, back) = (&txs[start], &txs[start + 1], &txs[start + 2]);
        if front.from_address != back.from_address || victim.from_address == front.from_address {
            continue;
        }
        if !mean.exceeded_by(&prices[start], SANDWICH_MULTIPLIER)
            || !mean.exceeded_by(&prices[start + 2], SANDWICH_MULTIPLIER)
        {
            continue;
        }

        findings.push(MevFinding {
            kind: FindingKind::Sandwich,
            score: Decimal::from(SANDWICH_SCORE),
            evidence: vec![front.hash.clone(), victim.hash.clone(), back.hash.clone()],
            scope: FindingScope::Block(block_number),
            transaction: Some(flagged(back)),
            actor: None,
        });
    }
    findings
}

#[derive(Default)]
struct ActorTally {
    transactions: u64,
    high_gas: u64,
    consecutive: u64,
    price_sum: BigUint,
    first_block: i64,
    last_block: i64,
    evidence: Vec<String>,
}

/// Per-block gas means over positive prices
fn block_means(txs: &[TimedTransaction]) -> HashMap<i64, GasMean> {
    let mut means: HashMap<i64, GasMean> = HashMap::new();
    for timed in txs {
        let tx = &timed.transaction;
        means
            .entry(tx.block_number)
            .or_default()
            .push(&quantity_or_zero(&tx.gas_price));
    }
    means
}

/// Count of positive-gas transactions and how many of them exceed twice
/// their own block's mean
pub fn high_gas_totals(txs: &[TimedTransaction]) -> (u64, u64, GasMean) {
    let means = block_means(txs);
    let mut overall = GasMean::default();
    let mut high = 0;
    for timed in txs {
        let tx = &timed.transaction;
        let price = quantity_or_zero(&tx.gas_price);
        overall.push(&price);
        let exceeded = means.get(&tx.block_number).is_some_and(|mean| {
            mean.exceeded_by(&price, Decimal::from(ACTOR_HIGH_GAS_MULTIPLIER))
        });
        if exceeded {
            high += 1;
        }
    }
    (overall.count(), high, overall)
}

/// Senders with repeated suspicious behaviour across the window.
///
/// Only positive-gas transactions are attributed to a sender. A transaction
/// is consecutive when the next index of the same block was sent by the same
/// address, whatever that successor's gas price.
pub fn repeated_actors(
    range: TimeRange,
    txs: &[TimedTransaction],
    min_transactions: u64,
) -> Vec<MevFinding> {
    let means = block_means(txs);
    let senders: HashMap<(i64, i64), &str> = txs
        .iter()
        .map(|timed| {
            let tx = &timed.transaction;
            ((tx.block_number, tx.transaction_index), tx.from_address.as_str())
        })
        .collect();

    let mut tallies: BTreeMap<&str, ActorTally> = BTreeMap::new();
    for timed in txs {
        let tx = &timed.transaction;
        let price = quantity_or_zero(&tx.gas_price);
        if price == BigUint::default() {
            continue;
        }

        let tally = tallies.entry(tx.from_address.as_str()).or_insert_with(|| ActorTally {
            first_block: tx.block_number,
            last_block: tx.block_number,
            ..Default::default()
        });
        tally.transactions += 1;
        tally.first_block = tally.first_block.min(tx.block_number);
        tally.last_block = tally.last_block.max(tx.block_number);

        let high = means.get(&tx.block_number).is_some_and(|mean| {
            mean.exceeded_by(&price, Decimal::from(ACTOR_HIGH_GAS_MULTIPLIER))
        });
        if high {
            tally.high_gas += 1;
            tally.evidence.push(tx.hash.clone());
        }
        tally.price_sum += &price;

        let next = (tx.block_number, tx.transaction_index + 1);
        if senders.get(&next) == Some(&tx.from_address.as_str()) {
            tally.consecutive += 1;
        }
    }

    let mut profiles: Vec<(ActorProfile, Vec<String>)> = tallies
        .into_iter()
        .filter(|(_, t)| t.transactions >= min_transactions.max(1))
        // high / n > 0.3, compared exactly
        .filter(|(_, t)| t.high_gas * 10 > t.transactions * 3 || t.consecutive > ACTOR_CONSECUTIVE_LIMIT)
        .map(|(address, t)| {
            let count = BigUint::from(t.transactions);
            let mut patterns = Vec::new();
            if t.high_gas * 2 > t.transactions {
                patterns.push(ActorPattern::FrequentHighGas);
            }
            if t.consecutive > ACTOR_CONSECUTIVE_LIMIT {
                patterns.push(ActorPattern::ConsecutiveTransactions);
            }
            if t.transactions > ACTOR_HIGH_VOLUME {
                patterns.push(ActorPattern::HighVolumeTrader);
            }

            let profile = ActorProfile {
                address: address.to_string(),
                transaction_count: t.transactions,
                high_gas_transactions: t.high_gas,
                consecutive_transactions: t.consecutive,
                high_gas_fraction: ratio(&BigUint::from(t.high_gas), &count),
                consecutive_fraction: ratio(&BigUint::from(t.consecutive), &count),
                average_gas_price: (&t.price_sum / &count).to_string(),
                first_seen_block: t.first_block,
                last_seen_block: t.last_block,
                patterns,
            };
            (profile, t.evidence)
        })
        .collect();

    profiles.sort_by(|(a, _), (b, _)| {
        b.high_gas_fraction
            .cmp(&a.high_gas_fraction)
            .then(b.transaction_count.cmp(&a.transaction_count))
            .then(a.address.cmp(&b.address))
    });
    profiles.truncate(MAX_ACTORS);

    profiles
        .into_iter()
        .map(|(profile, evidence)| MevFinding {
            kind: FindingKind::RepeatedActor,
            score: profile.high_gas_fraction * Decimal::from(5)
                + profile.consecutive_fraction * Decimal::from(3),
            evidence,
            scope: FindingScope::TimeRange(range),
            transaction: None,
            actor: Some(profile),
        })
        .collect()
}
