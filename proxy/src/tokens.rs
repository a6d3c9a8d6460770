//! Token estimation for prompt and completion accounting.
//!
//! The upstream stream carries no usage block, so counts are estimated
//! locally with tiktoken. The encodings take a moment to build and are
//! cached process-wide by the singletons.

use crate::format::ChatMessage;

/// Estimate the token count for a block of text. Empty or whitespace-only
/// text counts as zero.
pub fn estimate_text(text: &str, model: &str) -> usize {
    let text = text.trim();
    if text.is_empty() {
        return 0;
    }

    encoded_len(text, model)
}

/// Estimate token usage for a list of inbound chat messages. Only string
/// content participates, matching what the translator will forward.
pub fn estimate_messages(messages: &[ChatMessage], model: &str) -> usize {
    messages
        .iter()
        .filter_map(|message| message.content_str())
        .map(|content| estimate_text(content, model))
        .sum()
}

/// Load the encodings outside the request path. First use otherwise pays the
/// construction cost.
pub fn preload_encodings() {
    let _ = tiktoken_rs::o200k_base_singleton();
    let _ = tiktoken_rs::cl100k_base_singleton();
}

fn encoded_len(text: &str, model: &str) -> usize {
    // The upstream model catalog is mixed-vendor; o200k for the GPT entries,
    // cl100k for everything else is close enough for accounting purposes.
    if model.starts_with("gpt-") {
        tiktoken_rs::o200k_base_singleton()
            .encode_with_special_tokens(text)
            .len()
    } else {
        tiktoken_rs::cl100k_base_singleton()
            .encode_with_special_tokens(text)
            .len()
    }
}
