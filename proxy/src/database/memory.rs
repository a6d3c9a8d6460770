//! Bounded in-memory metrics backend.
//!
//! A fixed-capacity ring buffer; the oldest record is evicted on overflow.
//! Reads copy the buffer under the lock and do all filtering and sorting on
//! the snapshot, so they never block writers for the filtering duration.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, VecDeque},
    sync::Mutex,
};

use error_stack::Report;

use super::{
    summarize_records, CredentialUsage, ListOptions, MetricsFilter, MetricsRecord, MetricsStore,
    MetricsSummary,
};
use crate::Error;

#[derive(Debug)]
pub struct InMemoryMetricsStore {
    records: Mutex<VecDeque<MetricsRecord>>,
    capacity: usize,
}

impl InMemoryMetricsStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn snapshot(&self, filter: &MetricsFilter) -> Vec<MetricsRecord> {
        let snapshot: Vec<MetricsRecord> = {
            let records = self.records.lock().unwrap();
            records.iter().cloned().collect()
        };

        snapshot
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect()
    }
}

#[async_trait::async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn add_record(&self, record: MetricsRecord) -> Result<(), Report<Error>> {
        if record.id.is_empty() {
            tracing::warn!(model = %record.model, "Skipping metrics record without an id");
            return Ok(());
        }

        let mut records = self.records.lock().unwrap();
        if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
            *existing = record;
            return Ok(());
        }

        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
        Ok(())
    }

    async fn list_records(
        &self,
        filter: &MetricsFilter,
        options: &ListOptions,
    ) -> Result<Vec<MetricsRecord>, Report<Error>> {
        let mut filtered = self.snapshot(filter);

        filtered.sort_by(|a, b| match (a.completed_at, b.completed_at) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => {
                if options.newest_first {
                    b.cmp(&a)
                } else {
                    a.cmp(&b)
                }
            }
        });

        Ok(filtered
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect())
    }

    async fn count_records(&self, filter: &MetricsFilter) -> Result<u64, Report<Error>> {
        Ok(self.snapshot(filter).len() as u64)
    }

    async fn summarize(&self, filter: &MetricsFilter) -> Result<MetricsSummary, Report<Error>> {
        Ok(summarize_records(&self.snapshot(filter)))
    }

    async fn summarize_by_credential(
        &self,
        filter: &MetricsFilter,
    ) -> Result<BTreeMap<i64, CredentialUsage>, Report<Error>> {
        let mut summary: BTreeMap<i64, CredentialUsage> = BTreeMap::new();

        for record in self.snapshot(filter) {
            let Some(index) = record.credential_index else {
                continue;
            };

            let usage = summary.entry(index).or_default();
            usage.usage_count += 1;
            usage.total_tokens += record.total_tokens;
            if record.completed_at > usage.last_completed_at {
                usage.last_completed_at = record.completed_at;
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::record;
    use super::*;
    use crate::database::RequestStatus;

    #[tokio::test]
    async fn add_and_list_round_trip() {
        let store = InMemoryMetricsStore::new(10);
        let original = record("chatcmpl-1", 0);
        store.add_record(original.clone()).await.unwrap();

        let listed = store
            .list_records(&MetricsFilter::default(), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(listed, vec![original]);
    }

    #[tokio::test]
    async fn upsert_by_id_replaces() {
        let store = InMemoryMetricsStore::new(10);
        store.add_record(record("chatcmpl-1", 0)).await.unwrap();

        let mut updated = record("chatcmpl-1", 0);
        updated.completion_tokens = 99;
        store.add_record(updated).await.unwrap();

        assert_eq!(store.count_records(&MetricsFilter::default()).await.unwrap(), 1);
        let listed = store
            .list_records(&MetricsFilter::default(), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(listed[0].completion_tokens, 99);
    }

    #[tokio::test]
    async fn missing_id_is_dropped() {
        let store = InMemoryMetricsStore::new(10);
        let mut bad = record("", 0);
        bad.id = String::new();
        store.add_record(bad).await.unwrap();
        assert_eq!(store.count_records(&MetricsFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let store = InMemoryMetricsStore::new(3);
        for i in 0..5 {
            store.add_record(record(&format!("chatcmpl-{i}"), i)).await.unwrap();
        }

        let listed = store
            .list_records(
                &MetricsFilter::default(),
                &ListOptions {
                    newest_first: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["chatcmpl-2", "chatcmpl-3", "chatcmpl-4"]);
    }

    #[tokio::test]
    async fn filters_by_time_and_model() {
        let store = InMemoryMetricsStore::new(10);
        for i in 0..4 {
            store.add_record(record(&format!("chatcmpl-{i}"), i * 10)).await.unwrap();
        }
        let mut other = record("chatcmpl-other", 5);
        other.model = "gpt-5".to_string();
        store.add_record(other).await.unwrap();

        let base = record("chatcmpl-0", 0).completed_at.unwrap();
        let filter = MetricsFilter {
            start: Some(base + chrono::Duration::seconds(10)),
            end: Some(base + chrono::Duration::seconds(20)),
            model: Some("claude-haiku-4.5".to_string()),
        };

        let listed = store
            .list_records(&filter, &ListOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        // Newest first, bounds inclusive.
        assert_eq!(ids, vec!["chatcmpl-2", "chatcmpl-1"]);
    }

    #[tokio::test]
    async fn records_without_completion_sort_last() {
        let store = InMemoryMetricsStore::new(10);
        store.add_record(record("chatcmpl-0", 0)).await.unwrap();
        let mut pending = record("chatcmpl-pending", 0);
        pending.completed_at = None;
        store.add_record(pending).await.unwrap();
        store.add_record(record("chatcmpl-1", 10)).await.unwrap();

        for newest_first in [true, false] {
            let listed = store
                .list_records(
                    &MetricsFilter::default(),
                    &ListOptions {
                        newest_first,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(listed.last().unwrap().id, "chatcmpl-pending");
        }
    }

    #[tokio::test]
    async fn pagination() {
        let store = InMemoryMetricsStore::new(200);
        for i in 0..120 {
            store.add_record(record(&format!("chatcmpl-{i:03}"), i)).await.unwrap();
        }

        let total = store.count_records(&MetricsFilter::default()).await.unwrap();
        assert_eq!(total, 120);

        // Page 3 of 50 holds the last 20 records.
        let page = store
            .list_records(
                &MetricsFilter::default(),
                &ListOptions {
                    limit: Some(50),
                    offset: 100,
                    newest_first: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 20);
        assert_eq!(page[0].id, "chatcmpl-019");
        assert_eq!(page.last().unwrap().id, "chatcmpl-000");
    }

    #[tokio::test]
    async fn summaries() {
        let store = InMemoryMetricsStore::new(10);
        store.add_record(record("chatcmpl-0", 0)).await.unwrap();

        let mut failed = record("chatcmpl-1", 10);
        failed.status = RequestStatus::Error;
        failed.error_message = Some("boom".to_string());
        failed.credential_index = Some(1);
        failed.duration_ms = Some(240.0);
        store.add_record(failed).await.unwrap();

        let summary = store.summarize(&MetricsFilter::default()).await.unwrap();
        assert_eq!(summary.request_count, 2);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.prompt_tokens, 20);
        assert_eq!(summary.completion_tokens, 10);
        assert_eq!(summary.total_tokens, 30);
        assert!((summary.average_latency_ms - 180.0).abs() < f64::EPSILON);

        let by_credential = store
            .summarize_by_credential(&MetricsFilter::default())
            .await
            .unwrap();
        assert_eq!(by_credential.len(), 2);
        assert_eq!(by_credential[&0].usage_count, 1);
        assert_eq!(by_credential[&1].total_tokens, 15);
        assert_eq!(
            by_credential[&1].last_completed_at,
            record("chatcmpl-1", 10).completed_at
        );
    }
}
