//! Request metrics storage.
//!
//! One record per completed (or failed) request, behind a single trait with
//! two interchangeable backends: a bounded in-memory ring buffer and a
//! durable SQLite table. The builder picks the backend at construction time
//! and callers only ever hold the trait handle.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use error_stack::Report;
use serde::{Deserialize, Serialize};

use crate::Error;

pub mod memory;
pub mod sqlite;

/// The outcome of a proxied request.
#[derive(Serialize, Deserialize, sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted summary of a request. Written exactly once by the stream
/// translator; the credential is referenced by index only.
#[derive(Serialize, Deserialize, sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct MetricsRecord {
    pub id: String,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub status: RequestStatus,
    pub error_message: Option<String>,
    pub credential_index: Option<i64>,
    pub client_ip: Option<String>,
}

/// Filter on inclusive completion-time bounds and exact model match.
#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub model: Option<String>,
}

impl MetricsFilter {
    /// Records without a completion time never match a time-bounded filter.
    pub(crate) fn matches(&self, record: &MetricsRecord) -> bool {
        if self.start.is_some() || self.end.is_some() {
            let Some(completed_at) = record.completed_at else {
                return false;
            };
            if self.start.is_some_and(|start| completed_at < start) {
                return false;
            }
            if self.end.is_some_and(|end| completed_at > end) {
                return false;
            }
        }

        match self.model.as_deref() {
            Some(model) => record.model == model,
            None => true,
        }
    }
}

/// Pagination and ordering for record listings.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub newest_first: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: None,
            offset: 0,
            newest_first: true,
        }
    }
}

/// Aggregate metrics over a filtered set of records.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub request_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub average_latency_ms: f64,
}

/// Usage aggregated for a single credential index.
#[derive(Serialize, Debug, Clone, Default, PartialEq)]
pub struct CredentialUsage {
    pub usage_count: u64,
    pub total_tokens: i64,
    pub last_completed_at: Option<DateTime<Utc>>,
}

#[async_trait::async_trait]
pub trait MetricsStore: std::fmt::Debug + Send + Sync {
    /// Insert-or-replace keyed by record id. Records without an id are
    /// logged and dropped, not stored and not errored.
    async fn add_record(&self, record: MetricsRecord) -> Result<(), Report<Error>>;

    /// List records matching the filter, sorted by completion time with
    /// nulls last regardless of direction, then offset/limit applied.
    async fn list_records(
        &self,
        filter: &MetricsFilter,
        options: &ListOptions,
    ) -> Result<Vec<MetricsRecord>, Report<Error>>;

    async fn count_records(&self, filter: &MetricsFilter) -> Result<u64, Report<Error>>;

    async fn summarize(&self, filter: &MetricsFilter) -> Result<MetricsSummary, Report<Error>>;

    /// The same filters, grouped by credential index. Records without a
    /// credential index are skipped.
    async fn summarize_by_credential(
        &self,
        filter: &MetricsFilter,
    ) -> Result<BTreeMap<i64, CredentialUsage>, Report<Error>>;
}

pub type SharedMetricsStore = Arc<dyn MetricsStore>;

/// Compute the aggregate summary for a set of records. The in-memory
/// backend uses this directly; SQLite does the equivalent in SQL.
pub(crate) fn summarize_records(records: &[MetricsRecord]) -> MetricsSummary {
    let mut summary = MetricsSummary::default();
    let mut latency_total = 0.0;
    let mut latency_count = 0u64;

    for record in records {
        summary.prompt_tokens += record.prompt_tokens;
        summary.completion_tokens += record.completion_tokens;
        summary.request_count += 1;
        if record.status == RequestStatus::Success {
            summary.success_count += 1;
        }
        if let Some(duration) = record.duration_ms {
            latency_total += duration;
            latency_count += 1;
        }
    }

    summary.total_tokens = summary.prompt_tokens + summary.completion_tokens;
    summary.error_count = summary.request_count - summary.success_count;
    if latency_count > 0 {
        summary.average_latency_ms = latency_total / latency_count as f64;
    }

    summary
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A record with sensible defaults for store tests.
    pub fn record(id: &str, completed_offset_secs: i64) -> MetricsRecord {
        let started_at = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let completed_at = started_at + chrono::Duration::seconds(completed_offset_secs);
        MetricsRecord {
            id: id.to_string(),
            model: "claude-haiku-4.5".to_string(),
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
            started_at,
            completed_at: Some(completed_at),
            duration_ms: Some(120.0),
            status: RequestStatus::Success,
            error_message: None,
            credential_index: Some(0),
            client_ip: Some("10.0.0.1".to_string()),
        }
    }
}
