//! An OpenAI-compatible streaming front for the Smithery chat backend.
//!
//! The proxy rotates through a pool of preauthenticated session credentials,
//! translates the upstream SSE protocol into OpenAI chat completion chunks,
//! records per-request token metrics, and keeps a runtime-editable registry
//! of which models clients may see.
//!
//! ```ignore
//! let proxy = Proxy::builder()
//!     .with_credentials_from_env()
//!     .build()
//!     .await?;
//!
//! let stream = proxy.send_chat(request, Some(client_ip));
//! while let Ok(event) = stream.events.recv_async().await { /* ... */ }
//! ```

use std::sync::Arc;

use uuid::Uuid;

pub mod builder;
pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod format;
pub mod streaming;
pub mod tokens;
pub mod visibility;

pub use builder::ProxyBuilder;
pub use error::Error;

use credentials::{Credential, CredentialPool};
use database::SharedMetricsStore;
use format::{ChatRequest, StreamEventReceiver, UpstreamMessage, DEFAULT_MODEL};
use streaming::{spawn_translation, StreamContext};
use visibility::ModelVisibility;

pub struct Proxy {
    pub(crate) pool: CredentialPool,
    pub(crate) client: reqwest::Client,
    pub(crate) metrics: SharedMetricsStore,
    pub(crate) visibility: ModelVisibility,
    pub(crate) chat_url: String,
    pub(crate) system_prompt: String,
}

/// A running translated stream. Dropping the receiver cancels delivery; the
/// translator still finishes its metrics record in the background.
pub struct ChatStream {
    pub request_id: String,
    pub events: StreamEventReceiver,
    pub task: tokio::task::JoinHandle<()>,
}

impl Proxy {
    pub fn builder() -> ProxyBuilder {
        ProxyBuilder::new()
    }

    /// Start a chat completion. The next credential is checked out
    /// round-robin and a translator task is spawned; events arrive on the
    /// returned channel, ending with [format::StreamEvent::Done].
    pub fn send_chat(&self, request: ChatRequest, client_ip: Option<String>) -> ChatStream {
        let model = request
            .model
            .as_deref()
            .filter(|model| !model.trim().is_empty())
            .unwrap_or(DEFAULT_MODEL)
            .to_string();
        let request_id = format!("chatcmpl-{}", Uuid::new_v4());

        let prompt_tokens = tokens::estimate_messages(&request.messages, &model) as i64;
        let messages: Vec<UpstreamMessage> = request
            .messages
            .iter()
            .filter_map(UpstreamMessage::from_chat)
            .collect();

        let (credential, credential_index) = self.pool.checkout();
        tracing::info!(
            request_id = %request_id,
            model = %model,
            credential = %credential.name(),
            credential_index,
            messages = messages.len(),
            "Starting chat completion"
        );

        let (tx, rx) = flume::bounded(32);
        let task = spawn_translation(
            StreamContext {
                client: self.client.clone(),
                chat_url: self.chat_url.clone(),
                system_prompt: self.system_prompt.clone(),
                metrics: self.metrics.clone(),
                credential,
                credential_index,
                request_id: request_id.clone(),
                model,
                messages,
                prompt_tokens,
                client_ip,
            },
            tx,
        );

        ChatStream {
            request_id,
            events: rx,
            task,
        }
    }

    pub fn visibility(&self) -> &ModelVisibility {
        &self.visibility
    }

    pub fn metrics(&self) -> &SharedMetricsStore {
        &self.metrics
    }

    /// The configured credentials, in checkout order.
    pub fn credentials(&self) -> &[Arc<Credential>] {
        self.pool.credentials()
    }
}

#[cfg(test)]
mod tests {
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::format::{ChatMessage, StreamEvent};

    async fn proxy_for(server: &MockServer) -> Proxy {
        let config = config::ProxyConfig {
            chat_url: format!("{}/api/chat", server.uri()),
            visibility_path: None,
            ..Default::default()
        };
        Proxy::builder()
            .with_config(config)
            .with_credential("COOKIE_1", r#"{"access_token": "tok", "expires_at": 1}"#)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn send_chat_defaults_the_model_and_streams() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(
                        "data: {\"type\": \"text-delta\", \"delta\": \"ok\"}\n\ndata: [DONE]\n\n",
                    ),
            )
            .mount(&server)
            .await;

        let proxy = proxy_for(&server).await;
        let stream = proxy.send_chat(
            ChatRequest {
                model: None,
                messages: vec![ChatMessage {
                    role: Some("user".to_string()),
                    content: Some(serde_json::json!("hi")),
                }],
            },
            None,
        );

        assert!(stream.request_id.starts_with("chatcmpl-"));

        let mut text = String::new();
        let mut model = String::new();
        while let Ok(event) = stream.events.recv_async().await {
            match event {
                StreamEvent::Chunk(chunk) => {
                    text.push_str(&chunk.content());
                    model = chunk.model.clone();
                }
                StreamEvent::Done => break,
            }
        }
        stream.task.await.unwrap();

        assert_eq!(text, "ok");
        assert_eq!(model, DEFAULT_MODEL);

        let summary = proxy
            .metrics()
            .summarize(&database::MetricsFilter::default())
            .await
            .unwrap();
        assert_eq!(summary.request_count, 1);
        assert_eq!(summary.success_count, 1);
    }
}
