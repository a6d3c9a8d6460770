//! Operator endpoints: request metrics and model visibility.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use error_stack::ResultExt;
use serde::{Deserialize, Serialize};
use smithery_proxy::{
    database::{ListOptions, MetricsFilter},
    visibility::VisibilityInfo,
};

use crate::{
    error::{Error, WrapReport},
    proxy::ServerState,
};

#[derive(Deserialize, Debug, Default)]
pub struct MetricsQuery {
    start: Option<String>,
    end: Option<String>,
    model: Option<String>,
    limit: Option<usize>,
    page: Option<usize>,
}

#[derive(Serialize, Debug, PartialEq)]
struct Pagination {
    page: usize,
    page_size: usize,
    total_records: u64,
    total_pages: usize,
}

/// Accepts RFC 3339 timestamps, naive timestamps (treated as UTC), and
/// fractional Unix epoch seconds.
fn parse_time_param(
    value: Option<&str>,
    name: &'static str,
) -> Result<Option<DateTime<Utc>>, Error> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }

    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Some(parsed.and_utc()));
    }

    if let Ok(epoch) = value.parse::<f64>() {
        let millis = (epoch * 1000.0) as i64;
        if let Some(parsed) = DateTime::from_timestamp_millis(millis) {
            return Ok(Some(parsed));
        }
    }

    Err(Error::InvalidTimeParam(name))
}

fn filter_from_query(query: &MetricsQuery) -> Result<MetricsFilter, Error> {
    let start = parse_time_param(query.start.as_deref(), "start")?;
    let end = parse_time_param(query.end.as_deref(), "end")?;

    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(Error::InvalidTimeRange);
        }
    }

    Ok(MetricsFilter {
        start,
        end,
        model: query
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(str::to_string),
    })
}

/// The requested page clamped into the valid range, so a page past the end
/// returns the last page instead of an empty list.
fn paginate(total_records: u64, page_size: usize, requested_page: usize) -> Pagination {
    let total_pages = ((total_records as usize) + page_size - 1) / page_size;
    let page = requested_page.max(1).min(total_pages.max(1));
    Pagination {
        page,
        page_size,
        total_records,
        total_pages,
    }
}

async fn list_request_metrics(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<serde_json::Value>, WrapReport> {
    let filter = filter_from_query(&query)?;
    let page_size = query.limit.unwrap_or(50).clamp(1, 1000);

    let metrics = state.proxy.metrics();
    let total_records = metrics
        .count_records(&filter)
        .await
        .change_context(Error::Metrics)?;

    let pagination = paginate(total_records, page_size, query.page.unwrap_or(1));
    let records = metrics
        .list_records(
            &filter,
            &ListOptions {
                limit: Some(page_size),
                offset: (pagination.page - 1) * page_size,
                newest_first: true,
            },
        )
        .await
        .change_context(Error::Metrics)?;

    Ok(Json(serde_json::json!({
        "data": records,
        "pagination": pagination,
    })))
}

#[derive(Serialize, Debug)]
struct CredentialSummary {
    index: usize,
    name: String,
    masked_email: Option<String>,
    usage_count: u64,
    total_tokens: i64,
    last_completed_at: Option<DateTime<Utc>>,
}

async fn metrics_summary(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<serde_json::Value>, WrapReport> {
    let filter = filter_from_query(&query)?;
    let metrics = state.proxy.metrics();

    let summary = metrics
        .summarize(&filter)
        .await
        .change_context(Error::Metrics)?;
    let usage = metrics
        .summarize_by_credential(&filter)
        .await
        .change_context(Error::Metrics)?;

    // Every configured credential appears in the breakdown, used or not.
    let credentials: Vec<CredentialSummary> = state
        .proxy
        .credentials()
        .iter()
        .enumerate()
        .map(|(index, credential)| {
            let used = usage.get(&(index as i64));
            CredentialSummary {
                index,
                name: credential.name().to_string(),
                masked_email: credential.masked_email().map(str::to_string),
                usage_count: used.map(|u| u.usage_count).unwrap_or(0),
                total_tokens: used.map(|u| u.total_tokens).unwrap_or(0),
                last_completed_at: used.and_then(|u| u.last_completed_at),
            }
        })
        .collect();

    Ok(Json(serde_json::json!({
        "summary": summary,
        "credentials": credentials,
        "window_start": filter.start,
        "window_end": filter.end,
    })))
}

async fn get_visibility(State(state): State<Arc<ServerState>>) -> Json<VisibilityInfo> {
    Json(state.proxy.visibility().describe())
}

#[derive(Deserialize, Debug)]
struct VisibilityUpdate {
    #[serde(default)]
    hidden_models: Vec<String>,
}

async fn set_visibility(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<VisibilityUpdate>,
) -> Json<VisibilityInfo> {
    let applied = state.proxy.visibility().set_hidden(&body.hidden_models).await;
    tracing::info!(hidden = ?applied, "Updated hidden model set");
    Json(state.proxy.visibility().describe())
}

pub fn create_routes() -> axum::Router<Arc<ServerState>> {
    axum::Router::new()
        .route("/metrics/requests", axum::routing::get(list_request_metrics))
        .route("/metrics/summary", axum::routing::get(metrics_summary))
        .route(
            "/settings/models/visibility",
            axum::routing::get(get_visibility).put(set_visibility),
        )
}
