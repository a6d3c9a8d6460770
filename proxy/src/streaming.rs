//! Upstream stream consumption and translation.
//!
//! Each request spawns one translator task that talks to the upstream chat
//! endpoint, converts its SSE frames into OpenAI-style chunks, and writes a
//! single metrics record when the stream ends, however it ends.

use std::sync::Arc;

use chrono::Utc;
use error_stack::{Report, ResultExt};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::{
    credentials::Credential,
    database::{MetricsRecord, RequestStatus, SharedMetricsStore},
    format::{
        ChatCompletionChunk, StreamEvent, StreamEventSender, UpstreamChatBody, UpstreamEvent,
        UpstreamMessage,
    },
    tokens::estimate_text,
};

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Failed to send the upstream request")]
    Sending,
    #[error("Upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },
    #[error("Failed while reading the upstream stream")]
    ReadingStream,
}

/// Everything the translator task needs, captured before it is spawned.
pub(crate) struct StreamContext {
    pub client: reqwest::Client,
    pub chat_url: String,
    pub system_prompt: String,
    pub metrics: SharedMetricsStore,
    pub credential: Arc<Credential>,
    pub credential_index: usize,
    pub request_id: String,
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub prompt_tokens: i64,
    pub client_ip: Option<String>,
}

enum StreamOutcome {
    Completed,
    /// The receiving side went away mid-stream. Whatever text arrived before
    /// the disconnect is still accounted as a successful partial response.
    Disconnected,
}

pub(crate) fn spawn_translation(ctx: StreamContext, tx: StreamEventSender) -> JoinHandle<()> {
    tokio::task::spawn(run(ctx, tx))
}

async fn run(ctx: StreamContext, tx: StreamEventSender) {
    let started_at = Utc::now();
    let start = tokio::time::Instant::now();
    let mut collected = String::new();

    let result = forward_upstream(&ctx, &tx, &mut collected).await;

    let status = match &result {
        Ok(_) => RequestStatus::Success,
        Err(e) => {
            tracing::error!(
                request_id = %ctx.request_id,
                credential = %ctx.credential.name(),
                error = ?e,
                "Upstream request failed"
            );

            let message = error_detail(e);
            let _ = tx
                .send_async(StreamEvent::Chunk(ChatCompletionChunk::error(
                    &ctx.request_id,
                    &ctx.model,
                    format!("Proxy error: {message}"),
                )))
                .await;
            let _ = tx.send_async(StreamEvent::Done).await;

            RequestStatus::Error
        }
    };

    let completed_at = Utc::now();
    let completion_tokens = estimate_text(&collected, &ctx.model) as i64;
    let record = MetricsRecord {
        id: ctx.request_id.clone(),
        model: ctx.model.clone(),
        prompt_tokens: ctx.prompt_tokens,
        completion_tokens,
        total_tokens: ctx.prompt_tokens + completion_tokens,
        started_at,
        completed_at: Some(completed_at),
        duration_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
        status,
        error_message: result.err().map(|e| error_detail(&e)),
        credential_index: Some(ctx.credential_index as i64),
        client_ip: ctx.client_ip.clone(),
    };

    // Metrics failures never affect the response the client already saw.
    if let Err(e) = ctx.metrics.add_record(record).await {
        tracing::error!(request_id = %ctx.request_id, error = ?e, "Failed to record request metrics");
    }
}

async fn forward_upstream(
    ctx: &StreamContext,
    tx: &StreamEventSender,
    collected: &mut String,
) -> Result<StreamOutcome, Report<StreamError>> {
    let body = UpstreamChatBody {
        messages: &ctx.messages,
        tools: [],
        model: &ctx.model,
        system_prompt: &ctx.system_prompt,
    };

    let response = ctx
        .client
        .post(&ctx.chat_url)
        .headers(upstream_headers(ctx.credential.cookie_header()))
        .json(&body)
        .send()
        .await
        .change_context(StreamError::Sending)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Report::new(StreamError::UpstreamStatus {
            status: status.as_u16(),
            body,
        }));
    }

    let mut stream = response.bytes_stream().eventsource();
    while let Some(event) = stream.next().await {
        let event = event.change_context(StreamError::ReadingStream)?;
        if event.data == "[DONE]" {
            break;
        }

        let parsed: UpstreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(request_id = %ctx.request_id, error = %e, "Skipping unparseable upstream frame");
                continue;
            }
        };

        if parsed.typ != "text-delta" {
            continue;
        }

        // Every text-delta frame yields a chunk, even an empty one, so the
        // outbound sequence mirrors the upstream frame-for-frame.
        let text = parsed
            .delta
            .map(|delta| delta.into_text())
            .unwrap_or_default();

        collected.push_str(&text);
        let chunk = ChatCompletionChunk::delta(&ctx.request_id, &ctx.model, text);
        if tx.send_async(StreamEvent::Chunk(chunk)).await.is_err() {
            tracing::warn!(request_id = %ctx.request_id, "Client disconnected mid-stream");
            return Ok(StreamOutcome::Disconnected);
        }

        // Let the receiving side drain between frames.
        tokio::task::yield_now().await;
    }

    let _ = tx
        .send_async(StreamEvent::Chunk(ChatCompletionChunk::finish(
            &ctx.request_id,
            &ctx.model,
        )))
        .await;
    let _ = tx.send_async(StreamEvent::Done).await;

    Ok(StreamOutcome::Completed)
}

/// Render a stream failure as a short client-facing detail line.
fn error_detail(report: &Report<StreamError>) -> String {
    if let StreamError::UpstreamStatus { .. } = report.current_context() {
        return report.current_context().to_string();
    }

    match report.downcast_ref::<reqwest::Error>() {
        Some(cause) => format!("{}: {cause}", report.current_context()),
        None => report.current_context().to_string(),
    }
}

/// The full browser header set for an upstream request. The upstream runs
/// bot-challenge checks against anything that does not look like its own web
/// client, so every header the browser sends goes along.
fn upstream_headers(cookie: &str) -> reqwest::header::HeaderMap {
    use reqwest::header::{HeaderMap, HeaderValue};

    let mut headers = HeaderMap::new();
    headers.insert("accept", HeaderValue::from_static("*/*"));
    headers.insert(
        "accept-language",
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(cookie) {
        headers.insert("cookie", value);
    }
    headers.insert("origin", HeaderValue::from_static("https://smithery.ai"));
    headers.insert(
        "referer",
        HeaderValue::from_static("https://smithery.ai/playground"),
    );
    headers.insert("priority", HeaderValue::from_static("u=1, i"));
    headers.insert(
        "sec-ch-ua",
        HeaderValue::from_static(
            "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"120\", \"Google Chrome\";v=\"120\"",
        ),
    );
    headers.insert("sec-ch-ua-mobile", HeaderValue::from_static("?0"));
    headers.insert("sec-ch-ua-platform", HeaderValue::from_static("\"Windows\""));
    headers.insert("sec-fetch-dest", HeaderValue::from_static("empty"));
    headers.insert("sec-fetch-mode", HeaderValue::from_static("cors"));
    headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));
    headers
}
