use thiserror::Error;

use crate::{
    database::{Block, Transaction},
    numeric::{parse_quantity, QuantityError},
    source::{SourceBlock, SourceReceipt, SourceTransaction},
};

/// A node payload that cannot be turned into a stored row
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid hash '{0}'")]
    InvalidHash(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error(transparent)]
    InvalidQuantity(#[from] QuantityError),

    #[error("'{0}' is out of range")]
    OutOfRange(&'static str),
}

/// Lower-case `0x` hex string of exactly `len` bytes
fn fixed_hex(raw: &str, len: usize) -> Option<String> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    match hex::decode(digits) {
        Ok(bytes) if bytes.len() == len => Some(format!("0x{}", hex::encode(bytes))),
        _ => None,
    }
}

pub fn hash(raw: &str) -> Result<String, DecodeError> {
    fixed_hex(raw, 32).ok_or_else(|| DecodeError::InvalidHash(raw.to_string()))
}

pub fn address(raw: &str) -> Result<String, DecodeError> {
    fixed_hex(raw, 20).ok_or_else(|| DecodeError::InvalidAddress(raw.to_string()))
}

/// Normalize a quantity to its decimal string form
pub fn quantity(raw: &str) -> Result<String, DecodeError> {
    Ok(parse_quantity(raw)?.to_string())
}

fn signed(value: u64, field: &'static str) -> Result<i64, DecodeError> {
    i64::try_from(value).map_err(|_| DecodeError::OutOfRange(field))
}

pub fn decode_block(block: &SourceBlock) -> Result<Block, DecodeError> {
    let block_hash = block.hash.as_deref().ok_or(DecodeError::MissingField("hash"))?;
    let miner = block.miner.as_deref().ok_or(DecodeError::MissingField("miner"))?;

    Ok(Block {
        number: signed(block.number, "number")?,
        hash: hash(block_hash)?,
        parent_hash: hash(&block.parent_hash)?,
        timestamp: signed(block.timestamp, "timestamp")?,
        gas_limit: quantity(&block.gas_limit)?,
        gas_used: quantity(&block.gas_used)?,
        miner: address(miner)?,
        size_bytes: block.size.map(|s| signed(s, "size")).transpose()?,
        transaction_count: signed(block.transactions.len() as u64, "transaction_count")?,
        base_fee_per_gas: block.base_fee_per_gas.as_deref().map(quantity).transpose()?,
    })
}

pub fn decode_transaction(
    block_number: i64,
    tx: &SourceTransaction,
    receipt: &SourceReceipt,
) -> Result<Transaction, DecodeError> {
    let index = tx.index.ok_or(DecodeError::MissingField("transaction_index"))?;
    let from = tx.from.as_deref().ok_or(DecodeError::MissingField("from"))?;
    let gas_price = tx
        .gas_price
        .as_deref()
        .ok_or(DecodeError::MissingField("gas_price"))?;

    Ok(Transaction {
        hash: hash(&tx.hash)?,
        block_number,
        transaction_index: signed(index, "transaction_index")?,
        from_address: address(from)?,
        to_address: tx.to.as_deref().map(address).transpose()?,
        value: quantity(&tx.value)?,
        gas_limit: quantity(&tx.gas_limit)?,
        gas_used: receipt.gas_used.as_deref().map(quantity).transpose()?,
        gas_price: quantity(gas_price)?,
        nonce: quantity(&tx.nonce)?,
        status: receipt.status.map(|s| signed(s, "status")).transpose()?,
        contract_address: receipt.contract_address.as_deref().map(address).transpose()?,
    })
}
