//! Deterministic context truncation.
//!
//! Two stages: a per-message character cap (head-preserving, with an
//! explicit marker) and an aggregate cap that walks from the newest message
//! backward. Dropped history is not summarized here; the rolling summary
//! service compacts it out-of-band.

use companion_chat::{Content, ContentPart};

use crate::message::Message;

pub const MAX_SINGLE_MESSAGE_CHARS: usize = 50_000;
pub const MAX_MESSAGE_CHARS: usize = 400_000;

const TRUNCATION_MARKER: &str = "\n\n[... truncated ...]";

#[derive(Debug, Clone, Copy)]
pub struct TruncationLimits {
    pub max_single_message_chars: usize,
    pub max_message_chars: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        Self {
            max_single_message_chars: MAX_SINGLE_MESSAGE_CHARS,
            max_message_chars: MAX_MESSAGE_CHARS,
        }
    }
}

/// Cap a single content to `max_chars`, preserving the head and appending
/// a marker. Image parts are kept verbatim and count zero.
pub fn truncate_message(content: &Content, max_chars: usize) -> Content {
    if content.len_chars() <= max_chars {
        return content.clone();
    }

    match content {
        Content::Text(text) => Content::Text(truncate_text(text, max_chars)),
        Content::Multipart(parts) => {
            // Budget is spent left to right across the text parts; images
            // pass through untouched.
            let mut remaining = max_chars;
            let mut truncated = Vec::with_capacity(parts.len());
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        let length = text.chars().count();
                        if length <= remaining {
                            remaining -= length;
                            truncated.push(part.clone());
                        } else {
                            truncated.push(ContentPart::text(truncate_text(text, remaining)));
                            remaining = 0;
                        }
                    }
                    ContentPart::ImageUrl { .. } => truncated.push(part.clone()),
                }
            }
            Content::Multipart(truncated)
        }
    }
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}{TRUNCATION_MARKER}")
}

/// Apply both stages to a message history. Returns the kept window,
/// oldest-first. Always keeps at least the newest message.
pub fn truncate_history(messages: &[Message], limits: TruncationLimits) -> Vec<Message> {
    let capped: Vec<Message> = messages
        .iter()
        .map(|m| {
            let mut message = m.clone();
            message.content = truncate_message(&message.content, limits.max_single_message_chars);
            message
        })
        .collect();

    let total: usize = capped.iter().map(|m| m.content.len_chars()).sum();
    if total <= limits.max_message_chars {
        return capped;
    }

    // Walk newest backward, accumulating until the next message would
    // exceed the budget.
    let mut kept = Vec::new();
    let mut used = 0usize;
    for message in capped.into_iter().rev() {
        let length = message.content.len_chars();
        if !kept.is_empty() && used + length > limits.max_message_chars {
            break;
        }
        used += length;
        kept.push(message);
    }
    kept.reverse();
    kept
}
