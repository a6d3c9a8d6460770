//! Durable SQLite metrics backend.

use std::{collections::BTreeMap, path::Path, str::FromStr};

use error_stack::{Report, ResultExt};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};

use super::{CredentialUsage, ListOptions, MetricsFilter, MetricsRecord, MetricsStore, MetricsSummary};
use crate::Error;

const SQLITE_MIGRATIONS: &[&str] = &[include_str!(
    "../../migrations/20250601_smithery_proxy_init_sqlite.sql"
)];

#[derive(Debug)]
pub struct SqliteMetricsStore {
    pool: SqlitePool,
}

impl SqliteMetricsStore {
    /// Open (creating if needed) the metrics database at `path` and bring the
    /// schema up to date.
    pub async fn new(path: &str) -> Result<Self, Report<Error>> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .change_context(Error::InitDatabase)?;
            }
        }

        let options = SqliteConnectOptions::from_str(path)
            .change_context(Error::InitDatabase)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        Self::with_options(options).await
    }

    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self, Report<Error>> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .change_context(Error::InitDatabase)?;
        Self::with_options(options).await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, Report<Error>> {
        // A single connection gives SQLite one writer lane and sidesteps
        // busy errors under concurrent request teardown.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .change_context(Error::InitDatabase)?;

        run_migrations(&pool).await?;

        Ok(Self { pool })
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<(), Report<Error>> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS smithery_meta (
            key text PRIMARY KEY,
            value text
        )",
    )
    .execute(pool)
    .await
    .change_context(Error::InitDatabase)?;

    let version: i32 = sqlx::query_scalar(
        "SELECT CAST(COALESCE(value, '0') AS INTEGER) FROM smithery_meta WHERE key = 'migration_version'",
    )
    .fetch_optional(pool)
    .await
    .change_context(Error::InitDatabase)?
    .unwrap_or(0);

    let start = version as usize;
    if start >= SQLITE_MIGRATIONS.len() {
        return Ok(());
    }

    let mut tx = pool.begin().await.change_context(Error::InitDatabase)?;
    for migration in &SQLITE_MIGRATIONS[start..] {
        sqlx::raw_sql(migration)
            .execute(&mut *tx)
            .await
            .change_context(Error::InitDatabase)?;
    }

    sqlx::query(
        "INSERT INTO smithery_meta (key, value) VALUES ('migration_version', $1)
        ON CONFLICT (key) DO UPDATE SET value = $1",
    )
    .bind(SQLITE_MIGRATIONS.len() as i32)
    .execute(&mut *tx)
    .await
    .change_context(Error::InitDatabase)?;

    tx.commit().await.change_context(Error::InitDatabase)?;
    Ok(())
}

/// Append the filter's WHERE clause to `sql` and remember the values to bind,
/// in clause order.
fn push_filter_clauses<'a>(
    sql: &mut String,
    filter: &'a MetricsFilter,
    extra: Option<&str>,
) -> Vec<FilterBind<'a>> {
    let mut clauses: Vec<String> = Vec::new();
    let mut binds = Vec::new();

    if let Some(start) = &filter.start {
        clauses.push("completed_at >= ?".to_string());
        binds.push(FilterBind::Time(start));
    }
    if let Some(end) = &filter.end {
        clauses.push("completed_at <= ?".to_string());
        binds.push(FilterBind::Time(end));
    }
    if (filter.start.is_some() || filter.end.is_some()) && !clauses.is_empty() {
        clauses.push("completed_at IS NOT NULL".to_string());
    }
    if let Some(model) = &filter.model {
        clauses.push("model = ?".to_string());
        binds.push(FilterBind::Text(model));
    }
    if let Some(extra) = extra {
        clauses.push(extra.to_string());
    }

    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }

    binds
}

enum FilterBind<'a> {
    Time(&'a chrono::DateTime<chrono::Utc>),
    Text(&'a str),
}

macro_rules! bind_filter {
    ($query:expr, $binds:expr) => {{
        let mut query = $query;
        for bind in $binds {
            query = match bind {
                FilterBind::Time(value) => query.bind(value),
                FilterBind::Text(value) => query.bind(value),
            };
        }
        query
    }};
}

#[async_trait::async_trait]
impl MetricsStore for SqliteMetricsStore {
    async fn add_record(&self, record: MetricsRecord) -> Result<(), Report<Error>> {
        if record.id.is_empty() {
            tracing::warn!(model = %record.model, "Skipping metrics record without an id");
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO request_metrics
                (id, model, prompt_tokens, completion_tokens, total_tokens,
                 started_at, completed_at, duration_ms, status, error_message,
                 credential_index, client_ip)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                model = excluded.model,
                prompt_tokens = excluded.prompt_tokens,
                completion_tokens = excluded.completion_tokens,
                total_tokens = excluded.total_tokens,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                duration_ms = excluded.duration_ms,
                status = excluded.status,
                error_message = excluded.error_message,
                credential_index = excluded.credential_index,
                client_ip = excluded.client_ip",
        )
        .bind(&record.id)
        .bind(&record.model)
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.total_tokens)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.duration_ms)
        .bind(record.status)
        .bind(&record.error_message)
        .bind(record.credential_index)
        .bind(&record.client_ip)
        .execute(&self.pool)
        .await
        .change_context(Error::WritingMetrics)?;

        Ok(())
    }

    async fn list_records(
        &self,
        filter: &MetricsFilter,
        options: &ListOptions,
    ) -> Result<Vec<MetricsRecord>, Report<Error>> {
        let mut sql = "SELECT id, model, prompt_tokens, completion_tokens, total_tokens,
                started_at, completed_at, duration_ms, status, error_message,
                credential_index, client_ip
            FROM request_metrics"
            .to_string();
        let binds = push_filter_clauses(&mut sql, filter, None);

        let direction = if options.newest_first { "DESC" } else { "ASC" };
        sql.push_str(&format!(
            " ORDER BY (completed_at IS NULL), completed_at {direction} LIMIT ? OFFSET ?"
        ));

        let query = bind_filter!(sqlx::query_as::<_, MetricsRecord>(&sql), binds)
            .bind(options.limit.map(|l| l as i64).unwrap_or(-1))
            .bind(options.offset as i64);

        query
            .fetch_all(&self.pool)
            .await
            .change_context(Error::ReadingMetrics)
    }

    async fn count_records(&self, filter: &MetricsFilter) -> Result<u64, Report<Error>> {
        let mut sql = "SELECT COUNT(*) FROM request_metrics".to_string();
        let binds = push_filter_clauses(&mut sql, filter, None);

        let count: i64 = bind_filter!(sqlx::query_scalar(&sql), binds)
            .fetch_one(&self.pool)
            .await
            .change_context(Error::ReadingMetrics)?;

        Ok(count as u64)
    }

    async fn summarize(&self, filter: &MetricsFilter) -> Result<MetricsSummary, Report<Error>> {
        let mut sql = "SELECT
                COALESCE(SUM(prompt_tokens), 0),
                COALESCE(SUM(completion_tokens), 0),
                COALESCE(SUM(total_tokens), 0),
                COUNT(*),
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0),
                COALESCE(AVG(CASE WHEN duration_ms IS NOT NULL THEN duration_ms END), 0.0)
            FROM request_metrics"
            .to_string();
        let binds = push_filter_clauses(&mut sql, filter, None);

        let row: (i64, i64, i64, i64, i64, f64) = bind_filter!(sqlx::query_as(&sql), binds)
            .fetch_one(&self.pool)
            .await
            .change_context(Error::ReadingMetrics)?;

        let (prompt_tokens, completion_tokens, total_tokens, request_count, success_count, avg) =
            row;
        Ok(MetricsSummary {
            prompt_tokens,
            completion_tokens,
            total_tokens,
            request_count: request_count as u64,
            success_count: success_count as u64,
            error_count: (request_count - success_count) as u64,
            average_latency_ms: avg,
        })
    }

    async fn summarize_by_credential(
        &self,
        filter: &MetricsFilter,
    ) -> Result<BTreeMap<i64, CredentialUsage>, Report<Error>> {
        let mut sql = "SELECT
                credential_index,
                COUNT(*),
                COALESCE(SUM(total_tokens), 0),
                MAX(completed_at)
            FROM request_metrics"
            .to_string();
        let binds = push_filter_clauses(&mut sql, filter, Some("credential_index IS NOT NULL"));
        sql.push_str(" GROUP BY credential_index");

        let rows: Vec<(i64, i64, i64, Option<chrono::DateTime<chrono::Utc>>)> =
            bind_filter!(sqlx::query_as(&sql), binds)
                .fetch_all(&self.pool)
                .await
                .change_context(Error::ReadingMetrics)?;

        Ok(rows
            .into_iter()
            .map(|(index, usage_count, total_tokens, last_completed_at)| {
                (
                    index,
                    CredentialUsage {
                        usage_count: usage_count as u64,
                        total_tokens,
                        last_completed_at,
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::record;
    use super::*;
    use crate::database::RequestStatus;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = SqliteMetricsStore::new_in_memory().await.unwrap();
        run_migrations(&store.pool).await.unwrap();

        let version: i64 = sqlx::query_scalar(
            "SELECT CAST(value AS INTEGER) FROM smithery_meta WHERE key = 'migration_version'",
        )
        .fetch_one(&store.pool)
        .await
        .unwrap();
        assert_eq!(version as usize, SQLITE_MIGRATIONS.len());
    }

    #[tokio::test]
    async fn add_and_list_round_trip() {
        let store = SqliteMetricsStore::new_in_memory().await.unwrap();
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
        let store = SqliteMetricsStore::new_in_memory().await.unwrap();
        store.add_record(record("chatcmpl-1", 0)).await.unwrap();

        let mut updated = record("chatcmpl-1", 0);
        updated.completion_tokens = 99;
        store.add_record(updated).await.unwrap();

        assert_eq!(
            store.count_records(&MetricsFilter::default()).await.unwrap(),
            1
        );
        let listed = store
            .list_records(&MetricsFilter::default(), &ListOptions::default())
            .await
            .unwrap();
        assert_eq!(listed[0].completion_tokens, 99);
    }

    #[tokio::test]
    async fn missing_id_is_dropped() {
        let store = SqliteMetricsStore::new_in_memory().await.unwrap();
        let mut bad = record("", 0);
        bad.id = String::new();
        store.add_record(bad).await.unwrap();
        assert_eq!(
            store.count_records(&MetricsFilter::default()).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn filters_and_ordering() {
        let store = SqliteMetricsStore::new_in_memory().await.unwrap();
        for i in 0..4 {
            store
                .add_record(record(&format!("chatcmpl-{i}"), i * 10))
                .await
                .unwrap();
        }
        let mut pending = record("chatcmpl-pending", 0);
        pending.completed_at = None;
        pending.duration_ms = None;
        store.add_record(pending).await.unwrap();

        let listed = store
            .list_records(&MetricsFilter::default(), &ListOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "chatcmpl-3",
                "chatcmpl-2",
                "chatcmpl-1",
                "chatcmpl-0",
                "chatcmpl-pending"
            ]
        );

        let base = record("chatcmpl-0", 0).completed_at.unwrap();
        let filter = MetricsFilter {
            start: Some(base + chrono::Duration::seconds(10)),
            end: Some(base + chrono::Duration::seconds(20)),
            model: None,
        };
        let listed = store.list_records(&filter, &ListOptions::default()).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["chatcmpl-2", "chatcmpl-1"]);

        let page = store
            .list_records(
                &MetricsFilter::default(),
                &ListOptions {
                    limit: Some(2),
                    offset: 2,
                    newest_first: false,
                },
            )
            .await
            .unwrap();
        let ids: Vec<&str> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["chatcmpl-2", "chatcmpl-3"]);
    }

    #[tokio::test]
    async fn summaries() {
        let store = SqliteMetricsStore::new_in_memory().await.unwrap();
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
        assert_eq!(summary.total_tokens, 30);
        assert!((summary.average_latency_ms - 180.0).abs() < 1e-9);

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

    #[tokio::test]
    async fn model_filter_in_summary() {
        let store = SqliteMetricsStore::new_in_memory().await.unwrap();
        store.add_record(record("chatcmpl-0", 0)).await.unwrap();
        let mut other = record("chatcmpl-1", 5);
        other.model = "gpt-5".to_string();
        store.add_record(other).await.unwrap();

        let filter = MetricsFilter {
            model: Some("gpt-5".to_string()),
            ..Default::default()
        };
        let summary = store.summarize(&filter).await.unwrap();
        assert_eq!(summary.request_count, 1);
        assert_eq!(store.count_records(&filter).await.unwrap(), 1);
    }
}
