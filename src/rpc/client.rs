use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::{
    core::types::{
        Block as EthBlock, BlockNumber, Transaction as EthTransaction, TransactionReceipt, H256,
        U64,
    },
    providers::{Http, Middleware, Provider},
};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, trace};

use super::executor::RpcExecutor;
use crate::source::{
    BlockSource, LiveSourceConfig, SourceBlock, SourceError, SourceReceipt, SourceTransaction,
};

/// Operations the ingestion loop needs from a node
#[derive(Debug)]
pub enum EthRpcOperation {
    GetLatestBlockNumber,
    GetBlockWithTransactions(u64),
    GetTransactionReceipt(H256),
}

/// Response types for ETH RPC operations
#[derive(Debug)]
pub enum EthRpcResponse {
    LatestBlockNumber(u64),
    Block(Option<EthBlock<EthTransaction>>),
    TransactionReceipt(Option<TransactionReceipt>),
}

/// Client for interacting with Ethereum RPC
pub struct RpcClient {
    executor: RpcExecutor<EthRpcOperation, EthRpcResponse>,
}

impl RpcClient {
    /// Create a new RPC client
    pub fn new(config: &LiveSourceConfig) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .with_context(|| format!("Invalid RPC URL: {}", config.rpc_url))?;
        let provider = Arc::new(provider);

        let executor = RpcExecutor::new(
            "ETH",
            config.max_concurrent_requests,
            config.min_interval_ms,
            move |operation| {
                let provider = provider.clone();
                async move {
                    match operation {
                        EthRpcOperation::GetLatestBlockNumber => {
                            let number = provider.get_block_number().await?;
                            Ok(EthRpcResponse::LatestBlockNumber(number.as_u64()))
                        }
                        EthRpcOperation::GetBlockWithTransactions(number) => {
                            let block = provider
                                .get_block_with_txs(BlockNumber::Number(U64::from(number)))
                                .await?;
                            Ok(EthRpcResponse::Block(block))
                        }
                        EthRpcOperation::GetTransactionReceipt(hash) => {
                            let receipt = provider.get_transaction_receipt(hash).await?;
                            Ok(EthRpcResponse::TransactionReceipt(receipt))
                        }
                    }
                }
            },
        );

        Ok(Self { executor })
    }

    async fn call(&self, operation: EthRpcOperation) -> Result<EthRpcResponse, SourceError> {
        self.executor
            .execute(operation)
            .await
            .map_err(|e| SourceError::Unavailable(format!("{:#}", e)))
    }
}

#[async_trait]
impl BlockSource for RpcClient {
    async fn latest_height(&self) -> Result<u64, SourceError> {
        match self.call(EthRpcOperation::GetLatestBlockNumber).await? {
            EthRpcResponse::LatestBlockNumber(number) => Ok(number),
            other => Err(unexpected(other)),
        }
    }

    async fn block(&self, height: u64) -> Result<SourceBlock, SourceError> {
        match self
            .call(EthRpcOperation::GetBlockWithTransactions(height))
            .await?
        {
            EthRpcResponse::Block(Some(block)) => {
                let block = convert_block(height, &block);
                debug!(
                    "Fetched block #{} with {} transactions",
                    height,
                    block.transactions.len()
                );
                Ok(block)
            }
            EthRpcResponse::Block(None) => Err(SourceError::NotFound(format!("block #{}", height))),
            other => Err(unexpected(other)),
        }
    }

    async fn receipt(&self, tx_hash: &str) -> Result<SourceReceipt, SourceError> {
        let hash = H256::from_str(tx_hash)
            .map_err(|_| SourceError::NotFound(format!("receipt for malformed hash {}", tx_hash)))?;

        match self.call(EthRpcOperation::GetTransactionReceipt(hash)).await? {
            EthRpcResponse::TransactionReceipt(Some(receipt)) => {
                trace!("Fetched receipt for {}", tx_hash);
                Ok(convert_receipt(&receipt))
            }
            EthRpcResponse::TransactionReceipt(None) => {
                Err(SourceError::NotFound(format!("receipt for {}", tx_hash)))
            }
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: EthRpcResponse) -> SourceError {
    SourceError::Unavailable(format!("unexpected response type: {:?}", response))
}

/// Convert an ethers block into the source-neutral shape
fn convert_block(height: u64, eth_block: &EthBlock<EthTransaction>) -> SourceBlock {
    let transactions = eth_block
        .transactions
        .iter()
        .enumerate()
        .map(|(position, tx)| convert_transaction(position as u64, tx))
        .collect();

    SourceBlock {
        number: eth_block.number.map(|n| n.as_u64()).unwrap_or(height),
        hash: eth_block.hash.map(|h| format!("{:#x}", h)),
        parent_hash: format!("{:#x}", eth_block.parent_hash),
        timestamp: eth_block.timestamp.low_u64(),
        gas_limit: eth_block.gas_limit.to_string(),
        gas_used: eth_block.gas_used.to_string(),
        miner: eth_block.author.map(|a| format!("{:#x}", a)),
        size: eth_block.size.map(|s| s.low_u64()),
        base_fee_per_gas: eth_block.base_fee_per_gas.map(|fee| fee.to_string()),
        transactions,
    }
}

fn convert_transaction(position: u64, tx: &EthTransaction) -> SourceTransaction {
    // Some nodes omit the sender; recover it from the signature
    let from = if tx.from.is_zero() {
        tx.recover_from().ok()
    } else {
        Some(tx.from)
    };

    SourceTransaction {
        hash: format!("{:#x}", tx.hash),
        index: Some(tx.transaction_index.map(|i| i.as_u64()).unwrap_or(position)),
        from: from.map(|a| format!("{:#x}", a)),
        to: tx.to.map(|a| format!("{:#x}", a)),
        value: tx.value.to_string(),
        gas_limit: tx.gas.to_string(),
        gas_price: tx.gas_price.map(|p| p.to_string()),
        nonce: tx.nonce.to_string(),
    }
}

fn convert_receipt(receipt: &TransactionReceipt) -> SourceReceipt {
    SourceReceipt {
        gas_used: receipt.gas_used.map(|g| g.to_string()),
        status: receipt.status.map(|s| s.as_u64()),
        contract_address: receipt.contract_address.map(|a| format!("{:#x}", a)),
    }
}
