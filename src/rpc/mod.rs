mod client;
mod executor;

pub use client::{EthRpcOperation, EthRpcResponse, RpcClient};
pub use executor::RpcExecutor;
