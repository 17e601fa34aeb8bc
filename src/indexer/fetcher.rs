use backon::{ExponentialBuilder, Retryable};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time;
use tracing::warn;

use crate::{
    config::AppConfig,
    source::{BlockSource, SourceBlock, SourceError, SourceReceipt},
};

/// Wraps a [`BlockSource`] with a per-call timeout and, for block-level
/// calls, bounded exponential retry.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn BlockSource>,
    timeout: Duration,
    retry: ExponentialBuilder,
    max_in_flight: usize,
}

impl Fetcher {
    pub fn new(source: Arc<dyn BlockSource>, config: &AppConfig) -> Self {
        let retry = ExponentialBuilder::default()
            .with_max_times(config.fetch_max_retries)
            .with_min_delay(Duration::from_millis(config.fetch_retry_min_delay_ms))
            .with_max_delay(Duration::from_millis(config.fetch_retry_max_delay_ms));

        Self {
            source,
            timeout: config.source_timeout(),
            retry,
            max_in_flight: config.max_concurrent_requests.max(1),
        }
    }

    /// How many calls callers should keep outstanding at once. Calls queued
    /// beyond this would spend their timeout waiting rather than running.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, SourceError>>,
    ) -> Result<T, SourceError> {
        match time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    pub async fn latest_height(&self) -> Result<u64, SourceError> {
        let mut attempt = 1;
        (|| self.bounded(self.source.latest_height()))
            .retry(&self.retry)
            .notify(|err, dur| {
                warn!(
                    "Latest height attempt {} failed, retrying in {:?}: {}",
                    attempt, dur, err
                );
                attempt += 1;
            })
            .await
    }

    pub async fn block(&self, height: u64) -> Result<SourceBlock, SourceError> {
        let mut attempt = 1;
        (|| self.bounded(self.source.block(height)))
            .retry(&self.retry)
            .notify(|err, dur| {
                warn!(
                    "Block #{} attempt {} failed, retrying in {:?}: {}",
                    height, attempt, dur, err
                );
                attempt += 1;
            })
            .await
    }

    /// Receipts are best effort: one attempt, bounded by the timeout
    pub async fn receipt(&self, tx_hash: &str) -> Result<SourceReceipt, SourceError> {
        self.bounded(self.source.receipt(tx_hash)).await
    }
}
