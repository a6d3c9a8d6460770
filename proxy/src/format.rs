//! Wire formats on both sides of the proxy: the OpenAI-compatible surface
//! presented to clients, and the Smithery chat API spoken upstream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The model used when a request does not name one.
pub const DEFAULT_MODEL: &str = "claude-haiku-4.5";

/// An inbound chat completion request. Requests are stateless; the full
/// message history arrives with every call.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ChatRequest {
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

/// A single inbound message. `content` is kept as a raw value so that
/// non-string content can be detected and dropped instead of failing the
/// whole request.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<serde_json::Value>,
}

impl ChatMessage {
    /// The message content, if it is a plain string. Anything else is
    /// ignored by the translator.
    pub fn content_str(&self) -> Option<&str> {
        self.content.as_ref().and_then(|content| content.as_str())
    }
}

/// One streamed chunk in the OpenAI chat completion format.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    /// Unix timestamp in seconds
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl ChatCompletionChunk {
    fn new(request_id: &str, model: &str, content: Option<String>, finish_reason: Option<&str>) -> Self {
        Self {
            id: request_id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { content },
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    /// A chunk carrying one content delta.
    pub fn delta(request_id: &str, model: &str, content: impl Into<String>) -> Self {
        Self::new(request_id, model, Some(content.into()), None)
    }

    /// The finishing chunk: empty delta with the stop reason set.
    pub fn finish(request_id: &str, model: &str) -> Self {
        Self::new(request_id, model, None, Some("stop"))
    }

    /// A terminal chunk embedding an error description as content, so the
    /// caller-visible stream still ends cleanly.
    pub fn error(request_id: &str, model: &str, message: impl Into<String>) -> Self {
        Self::new(request_id, model, Some(message.into()), Some("stop"))
    }

    /// Concatenated content across all choices, for tests and collection.
    pub fn content(&self) -> String {
        self.choices
            .iter()
            .filter_map(|choice| choice.delta.content.as_deref())
            .collect()
    }
}

/// One event in the translated output stream. `Done` maps to the literal
/// `[DONE]` sentinel on the wire and is always the final event.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(ChatCompletionChunk),
    Done,
}

/// A channel on which translated stream events are sent
pub type StreamEventSender = flume::Sender<StreamEvent>;
/// A channel from which translated stream events are received
pub type StreamEventReceiver = flume::Receiver<StreamEvent>;

/// The upstream chat request body.
#[derive(Serialize, Debug)]
pub struct UpstreamChatBody<'a> {
    pub messages: &'a [UpstreamMessage],
    /// Always empty; tool calling is not part of the translation pipeline.
    pub tools: [(); 0],
    pub model: &'a str,
    #[serde(rename = "systemPrompt")]
    pub system_prompt: &'a str,
}

/// A message in the upstream wire representation: the role is preserved and
/// the content is wrapped as a single typed text part.
#[derive(Serialize, Debug, Clone)]
pub struct UpstreamMessage {
    pub role: String,
    pub parts: Vec<UpstreamPart>,
    pub id: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct UpstreamPart {
    #[serde(rename = "type")]
    pub typ: &'static str,
    pub text: String,
}

impl UpstreamMessage {
    /// Convert an inbound message. Messages without a role or without plain
    /// string content are dropped, not errored.
    pub fn from_chat(message: &ChatMessage) -> Option<Self> {
        let role = message.role.as_deref().filter(|role| !role.is_empty())?;
        let content = message.content_str()?;

        let id = Uuid::new_v4().simple().to_string();
        Some(Self {
            role: role.to_string(),
            parts: vec![UpstreamPart {
                typ: "text",
                text: content.to_string(),
            }],
            id: format!("msg-{}", &id[..16]),
        })
    }
}

/// One parsed upstream SSE payload. Only `text-delta` frames matter; other
/// types are skipped.
#[derive(Deserialize, Debug)]
pub struct UpstreamEvent {
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(default)]
    pub delta: Option<UpstreamDelta>,
}

/// The delta field is a string, or an object carrying a text field.
#[derive(Deserialize, Debug)]
#[serde(untagged)]
pub enum UpstreamDelta {
    Text(String),
    Part {
        #[serde(default)]
        text: String,
    },
    Other(serde_json::Value),
}

impl UpstreamDelta {
    /// Normalize the delta to a plain string.
    pub fn into_text(self) -> String {
        match self {
            UpstreamDelta::Text(text) => text,
            UpstreamDelta::Part { text } => text,
            UpstreamDelta::Other(value) => value.to_string(),
        }
    }
}

/// The `/v1/models` listing, restricted to currently visible models.
#[derive(Serialize, Debug)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Serialize, Debug)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

impl ModelList {
    pub fn from_visible(models: Vec<String>) -> Self {
        let created = chrono::Utc::now().timestamp();
        Self {
            object: "list",
            data: models
                .into_iter()
                .map(|id| ModelInfo {
                    id,
                    object: "model",
                    created,
                    owned_by: "lzA6",
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn chunk_shapes() {
        let chunk = ChatCompletionChunk::delta("chatcmpl-x", "gpt-5", "hi");
        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["choices"][0]["delta"]["content"], "hi");
        assert!(value["choices"][0].get("finish_reason").is_none());

        let finish = ChatCompletionChunk::finish("chatcmpl-x", "gpt-5");
        let value = serde_json::to_value(&finish).unwrap();
        assert_eq!(value["choices"][0]["finish_reason"], "stop");
        assert!(value["choices"][0]["delta"].get("content").is_none());
    }

    #[test]
    fn upstream_message_conversion() {
        let message = ChatMessage {
            role: Some("user".to_string()),
            content: Some(json!("hello")),
        };
        let upstream = UpstreamMessage::from_chat(&message).unwrap();
        assert_eq!(upstream.role, "user");
        assert_eq!(upstream.parts.len(), 1);
        assert_eq!(upstream.parts[0].text, "hello");
        assert!(upstream.id.starts_with("msg-"));
        assert_eq!(upstream.id.len(), "msg-".len() + 16);

        // Non-string content and missing roles are dropped silently.
        assert!(UpstreamMessage::from_chat(&ChatMessage {
            role: Some("user".to_string()),
            content: Some(json!(["parts"])),
        })
        .is_none());
        assert!(UpstreamMessage::from_chat(&ChatMessage {
            role: None,
            content: Some(json!("hello")),
        })
        .is_none());
        assert!(UpstreamMessage::from_chat(&ChatMessage {
            role: Some(String::new()),
            content: Some(json!("hello")),
        })
        .is_none());
    }

    #[test]
    fn upstream_body_serialization() {
        let messages = vec![UpstreamMessage {
            role: "user".to_string(),
            parts: vec![UpstreamPart {
                typ: "text",
                text: "hi".to_string(),
            }],
            id: "msg-0123456789abcdef".to_string(),
        }];
        let body = UpstreamChatBody {
            messages: &messages,
            tools: [],
            model: "claude-haiku-4.5",
            system_prompt: "You are a helpful assistant.",
        };

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["tools"], json!([]));
        assert_eq!(value["systemPrompt"], "You are a helpful assistant.");
        assert_eq!(value["messages"][0]["parts"][0]["type"], "text");
    }

    #[test]
    fn delta_normalization() {
        let event: UpstreamEvent =
            serde_json::from_str(r#"{"type": "text-delta", "delta": "abc"}"#).unwrap();
        assert_eq!(event.delta.unwrap().into_text(), "abc");

        let event: UpstreamEvent =
            serde_json::from_str(r#"{"type": "text-delta", "delta": {"text": "abc"}}"#).unwrap();
        assert_eq!(event.delta.unwrap().into_text(), "abc");

        let event: UpstreamEvent =
            serde_json::from_str(r#"{"type": "text-delta", "delta": 42}"#).unwrap();
        assert_eq!(event.delta.unwrap().into_text(), "42");
    }
}
