use axum::{
    extract::{Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::{
    database::TimeRange,
    mev::{DetectionError, BLOCK_ANALYSIS_THRESHOLD},
    App,
};

const DEFAULT_WINDOW_HOURS: i64 = 24;
const SECS_PER_HOUR: i64 = 60 * 60;
const DEFAULT_MIN_TRANSACTIONS: u64 = 10;

/// Maps detector errors onto HTTP responses
pub struct MevApiError(DetectionError);

impl From<DetectionError> for MevApiError {
    fn from(e: DetectionError) -> Self {
        Self(e)
    }
}

impl IntoResponse for MevApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DetectionError::InvalidThreshold(_) | DetectionError::InvalidTimeRange { .. } => {
                StatusCode::BAD_REQUEST
            }
            DetectionError::Query(_) => {
                error!("MEV query failed: {}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct HighGasParams {
    pub threshold: Option<Decimal>,
}

/// Window over block timestamps; defaults to the last 24 hours
#[derive(Debug, Deserialize)]
pub struct WindowParams {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub min_tx: Option<u64>,
}

impl WindowParams {
    fn range(&self) -> TimeRange {
        let end = self.end.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let start = self
            .start
            .unwrap_or_else(|| end.saturating_sub(DEFAULT_WINDOW_HOURS * SECS_PER_HOUR));
        TimeRange::new(start, end)
    }
}

/// Window of the last `hours` hours; missing or non-positive means 24
#[derive(Debug, Deserialize)]
pub struct HoursParams {
    pub hours: Option<i64>,
}

impl HoursParams {
    fn hours(&self) -> i64 {
        self.hours.filter(|h| *h > 0).unwrap_or(DEFAULT_WINDOW_HOURS)
    }

    fn range(&self) -> TimeRange {
        let end = chrono::Utc::now().timestamp();
        let start = end.saturating_sub(self.hours().saturating_mul(SECS_PER_HOUR));
        TimeRange::new(start, end)
    }
}

/// Combined stats, high-gas and sandwich analysis for one block. A bad
/// threshold shows up as an error in the high-gas category only.
pub async fn get_block_analysis(
    Path(number): Path<i64>,
    Query(params): Query<HighGasParams>,
    Extension(app): Extension<Arc<App>>,
) -> impl IntoResponse {
    let analysis = match params.threshold {
        Some(threshold) => app.mev.analyze_block_at(number, threshold).await,
        None => app.mev.analyze_block(number).await,
    };
    Json(analysis)
}

pub async fn get_high_gas_outliers(
    Path(number): Path<i64>,
    Query(params): Query<HighGasParams>,
    Extension(app): Extension<Arc<App>>,
) -> Result<impl IntoResponse, MevApiError> {
    let threshold = params
        .threshold
        .unwrap_or_else(|| Decimal::from(BLOCK_ANALYSIS_THRESHOLD));
    let findings = app.mev.find_high_gas_outliers(number, threshold).await?;

    Ok(Json(json!({
        "block_number": number,
        "threshold_multiplier": threshold,
        "total_count": findings.len(),
        "findings": findings,
    })))
}

pub async fn get_sandwich_patterns(
    Path(number): Path<i64>,
    Extension(app): Extension<Arc<App>>,
) -> Result<impl IntoResponse, MevApiError> {
    let findings = app.mev.find_sandwich_patterns(number).await?;

    Ok(Json(json!({
        "block_number": number,
        "total_count": findings.len(),
        "findings": findings,
    })))
}

pub async fn get_repeated_actors(
    Query(params): Query<WindowParams>,
    Extension(app): Extension<Arc<App>>,
) -> Result<impl IntoResponse, MevApiError> {
    let range = params.range();
    let min_transactions = params.min_tx.unwrap_or(DEFAULT_MIN_TRANSACTIONS);
    let findings = app
        .mev
        .identify_repeated_actors(range, min_transactions)
        .await?;

    Ok(Json(json!({
        "time_range": range,
        "min_transactions": min_transactions,
        "total_count": findings.len(),
        "findings": findings,
    })))
}

pub async fn get_mev_trends(
    Query(params): Query<WindowParams>,
    Extension(app): Extension<Arc<App>>,
) -> Result<impl IntoResponse, MevApiError> {
    let trends = app.mev.mev_trends(params.range()).await?;
    Ok(Json(trends))
}

pub async fn get_mev_stats(
    Query(params): Query<HoursParams>,
    Extension(app): Extension<Arc<App>>,
) -> Result<impl IntoResponse, MevApiError> {
    let stats = app.mev.mev_stats(params.range()).await?;

    Ok(Json(json!({
        "hours": params.hours(),
        "stats": stats,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_do_not_overflow() {
        let params = WindowParams {
            start: None,
            end: Some(i64::MIN + 5),
            min_tx: None,
        };
        assert_eq!(params.range(), TimeRange::new(i64::MIN, i64::MIN + 5));

        let params = WindowParams {
            start: None,
            end: Some(100_000),
            min_tx: None,
        };
        assert_eq!(params.range(), TimeRange::new(100_000 - 86_400, 100_000));
    }

    #[test]
    fn hours_fall_back_to_a_day() {
        assert_eq!(HoursParams { hours: None }.hours(), 24);
        assert_eq!(HoursParams { hours: Some(-3) }.hours(), 24);
        assert_eq!(HoursParams { hours: Some(6) }.hours(), 6);

        let range = HoursParams { hours: Some(i64::MAX) }.range();
        assert!(range.start < range.end);
    }
}
