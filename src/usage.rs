//! Usage accounting and analytics.
//!
//! Every request produces one [`UsageRecord`]. Records are buffered in
//! memory and flushed to the analytics sink in batches; the buffer is
//! bounded, dropping the oldest entries under pressure. The bundled
//! [`MemoryAnalytics`] sink retains records for usage-report queries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::budget::BudgetAlert;
use crate::GatewayResult;

/// Default flush batch size; override with `USAGE_FLUSH_BATCH`.
pub const DEFAULT_FLUSH_BATCH: usize = 100;
/// Bound on the in-memory record buffer.
pub const MAX_BUFFERED_RECORDS: usize = 10_000;

/// Per-request accounting row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub model_used: String,
    pub provider: String,
    pub tokens_used: u32,
    pub cost: f64,
    pub latency_ms: u64,
    pub cached: bool,
    pub success: bool,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Destination for usage records and budget alerts.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    async fn write_usage(&self, records: &[UsageRecord]) -> GatewayResult<()>;

    async fn write_alert(&self, alert: &BudgetAlert) -> GatewayResult<()>;
}

/// Buffers usage records and flushes them to the sink in batches.
pub struct UsageLogger {
    sink: Arc<dyn AnalyticsSink>,
    buffer: Mutex<VecDeque<UsageRecord>>,
    batch_size: usize,
    max_buffered: usize,
    dropped: AtomicU64,
}

impl UsageLogger {
    pub fn new(sink: Arc<dyn AnalyticsSink>, batch_size: usize) -> Self {
        Self {
            sink,
            buffer: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            max_buffered: MAX_BUFFERED_RECORDS,
            dropped: AtomicU64::new(0),
        }
    }

    /// Appends a record, flushing when the batch threshold is reached.
    /// Sink failures are recovered locally; the request still succeeds.
    pub async fn log(&self, record: UsageRecord) {
        let should_flush = {
            let mut buffer = self.buffer.lock().await;
            if buffer.len() >= self.max_buffered {
                buffer.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buffer.push_back(record);
            buffer.len() >= self.batch_size
        };

        if should_flush {
            self.flush().await;
        }
    }

    /// Drains the buffer into the sink. Failed batches are dropped after a
    /// warning; usage logging never fails a request.
    pub async fn flush(&self) {
        let batch: Vec<UsageRecord> = {
            let mut buffer = self.buffer.lock().await;
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        debug!(count = batch.len(), "flushing usage records");
        if let Err(e) = self.sink.write_usage(&batch).await {
            warn!(error = %e, lost = batch.len(), "usage flush failed");
            self.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
    }

    pub async fn emit_alert(&self, alert: &BudgetAlert) {
        if let Err(e) = self.sink.write_alert(alert).await {
            warn!(error = %e, budget_id = %alert.budget_id, "alert emission failed");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Summary of usage over a time window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_latency_ms: f64,
    pub cache_hit_rate: f64,
    pub top_models: Vec<ModelUsage>,
}

/// Per-model rollup inside a usage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model: String,
    pub requests: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// In-memory analytics sink that retains records for querying. Suitable as
/// the default collaborator; production deployments plug in their own sink.
pub struct MemoryAnalytics {
    records: RwLock<Vec<UsageRecord>>,
    alerts: RwLock<Vec<BudgetAlert>>,
}

impl MemoryAnalytics {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub async fn records(&self) -> Vec<UsageRecord> {
        self.records.read().await.clone()
    }

    pub async fn alerts(&self) -> Vec<BudgetAlert> {
        self.alerts.read().await.clone()
    }

    /// Usage summary over `[start, end]`, optionally filtered to one user.
    pub async fn usage_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_id: Option<&str>,
    ) -> UsageReport {
        let records = self.records.read().await;
        let in_window: Vec<&UsageRecord> = records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .filter(|r| user_id.map(|u| r.user_id == u).unwrap_or(true))
            .collect();

        let total_requests = in_window.len() as u64;
        let successful_requests = in_window.iter().filter(|r| r.success).count() as u64;
        let total_tokens: u64 = in_window.iter().map(|r| r.tokens_used as u64).sum();
        let total_cost: f64 = in_window.iter().map(|r| r.cost).sum();
        let cached = in_window.iter().filter(|r| r.cached).count() as u64;

        let avg_latency_ms = if total_requests > 0 {
            in_window.iter().map(|r| r.latency_ms as f64).sum::<f64>() / total_requests as f64
        } else {
            0.0
        };
        let cache_hit_rate = if total_requests > 0 {
            cached as f64 / total_requests as f64
        } else {
            0.0
        };

        let mut by_model: HashMap<&str, ModelUsage> = HashMap::new();
        for record in &in_window {
            let entry = by_model
                .entry(record.model_used.as_str())
                .or_insert_with(|| ModelUsage {
                    model: record.model_used.clone(),
                    requests: 0,
                    tokens: 0,
                    cost: 0.0,
                });
            entry.requests += 1;
            entry.tokens += record.tokens_used as u64;
            entry.cost += record.cost;
        }
        let mut top_models: Vec<ModelUsage> = by_model.into_values().collect();
        top_models.sort_by(|a, b| b.requests.cmp(&a.requests).then(a.model.cmp(&b.model)));
        top_models.truncate(5);

        UsageReport {
            window_start: start,
            window_end: end,
            total_requests,
            successful_requests,
            total_tokens,
            total_cost,
            avg_latency_ms,
            cache_hit_rate,
            top_models,
        }
    }
}

impl Default for MemoryAnalytics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AnalyticsSink for MemoryAnalytics {
    async fn write_usage(&self, records: &[UsageRecord]) -> GatewayResult<()> {
        self.records.write().await.extend_from_slice(records);
        Ok(())
    }

    async fn write_alert(&self, alert: &BudgetAlert) -> GatewayResult<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str, user: &str, model: &str, cached: bool) -> UsageRecord {
        UsageRecord {
            request_id: request_id.into(),
            user_id: user.into(),
            model_used: model.into(),
            provider: "openai".into(),
            tokens_used: 100,
            cost: 0.01,
            latency_ms: 200,
            cached,
            success: true,
            task_type: None,
            session_id: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn flushes_at_batch_size() {
        let sink = Arc::new(MemoryAnalytics::new());
        let logger = UsageLogger::new(sink.clone(), 3);

        logger.log(record("r1", "u1", "m1", false)).await;
        logger.log(record("r2", "u1", "m1", false)).await;
        assert!(sink.records().await.is_empty());

        logger.log(record("r3", "u1", "m1", false)).await;
        assert_eq!(sink.records().await.len(), 3);
    }

    #[tokio::test]
    async fn explicit_flush_drains_partial_batches() {
        let sink = Arc::new(MemoryAnalytics::new());
        let logger = UsageLogger::new(sink.clone(), 100);
        logger.log(record("r1", "u1", "m1", false)).await;
        logger.flush().await;
        assert_eq!(sink.records().await.len(), 1);
    }

    #[tokio::test]
    async fn report_aggregates_window() {
        let sink = MemoryAnalytics::new();
        let mut records = vec![
            record("r1", "u1", "m1", false),
            record("r2", "u1", "m1", true),
            record("r3", "u2", "m2", false),
        ];
        records[2].cost = 0.05;
        sink.write_usage(&records).await.unwrap();

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);

        let report = sink.usage_report(start, end, None).await;
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.total_tokens, 300);
        assert!((report.total_cost - 0.07).abs() < 1e-9);
        assert!((report.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.top_models[0].model, "m1");
        assert_eq!(report.top_models[0].requests, 2);

        let filtered = sink.usage_report(start, end, Some("u2")).await;
        assert_eq!(filtered.total_requests, 1);
        assert!((filtered.total_cost - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let sink = Arc::new(MemoryAnalytics::new());
        let mut logger = UsageLogger::new(sink.clone(), usize::MAX);
        logger.max_buffered = 2;

        logger.log(record("r1", "u1", "m1", false)).await;
        logger.log(record("r2", "u1", "m1", false)).await;
        logger.log(record("r3", "u1", "m1", false)).await;
        assert_eq!(logger.dropped_count(), 1);

        logger.flush().await;
        let flushed = sink.records().await;
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].request_id, "r2");
    }
}
