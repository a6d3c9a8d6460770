use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{sse::Event, IntoResponse, Response, Sse},
    Json,
};
use futures::StreamExt;
use smithery_proxy::{
    format::{ChatRequest, ModelList, StreamEvent},
    Proxy,
};

use crate::error::Error;

pub struct ServerState {
    pub proxy: Proxy,
    /// `None` disables authentication.
    pub api_key: Option<String>,
}

/// Reject requests without the configured bearer token. `/healthz` and the
/// root stay open so load balancers can probe without credentials.
pub async fn require_api_key(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let Some(expected) = &state.api_key else {
        return Ok(next.run(request).await);
    };

    if matches!(request.uri().path(), "/" | "/healthz") {
        return Ok(next.run(request).await);
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(Error::Unauthorized)?;

    if token != expected {
        return Err(Error::InvalidApiKey);
    }

    Ok(next.run(request).await)
}

/// The client address, preferring proxy-set headers over the socket peer.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<&SocketAddr>) -> Option<String> {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return Some(first.to_string());
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|value| value.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return Some(real_ip.to_string());
        }
    }

    peer.map(|addr| addr.ip().to_string())
}

async fn chat_completions(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ChatRequest>,
) -> Result<Response, Error> {
    if let Some(model) = body.model.as_deref() {
        if state.proxy.visibility().is_hidden(model) {
            return Err(Error::ModelHidden(model.to_string()));
        }
    }

    let client_ip = extract_client_ip(&headers, Some(&peer));
    let stream = state.proxy.send_chat(body, client_ip);

    let events = stream.events.into_stream().map(|event| match event {
        StreamEvent::Chunk(chunk) => Event::default().json_data(&chunk),
        StreamEvent::Done => Ok(Event::default().data("[DONE]")),
    });

    Ok(Sse::new(events)
        .keep_alive(axum::response::sse::KeepAlive::default())
        .into_response())
}

async fn list_models(State(state): State<Arc<ServerState>>) -> Json<ModelList> {
    Json(ModelList::from_visible(state.proxy.visibility().visible_models()))
}

pub fn create_routes() -> axum::Router<Arc<ServerState>> {
    axum::Router::new()
        .route("/v1/chat/completions", axum::routing::post(chat_completions))
        .route("/v1/models", axum::routing::get(list_models))
        .merge(crate::admin::create_routes())
        .route("/healthz", axum::routing::get(|| async { "OK" }))
        .route(
            "/",
            axum::routing::get(|| async {
                Json(serde_json::json!({"service": "smithery-proxy", "status": "ok"}))
            }),
        )
}
