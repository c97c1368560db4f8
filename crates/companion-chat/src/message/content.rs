//! Polymorphic message content.
//!
//! Content is either plain markdown text or an ordered list of parts.
//! Truncation and length measurement dispatch on the variant; images are
//! carried by reference and never count toward character budgets.

use serde::{Deserialize, Serialize};

/// A part of multipart message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Text content.
    Text { text: String },

    /// An image carried by URL.
    ImageUrl { url: String },
}

impl ContentPart {
    /// Create a text content part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an image part from a URL.
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl { url: url.into() }
    }

    /// Get text content if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Self::ImageUrl { .. })
    }
}

/// Message content: plain text or an ordered list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Multipart(Vec<ContentPart>),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// All text concatenated, images elided.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Multipart(parts) => parts
                .iter()
                .filter_map(|p| p.as_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Character length of the textual content. Images count zero.
    pub fn len_chars(&self) -> usize {
        match self {
            Self::Text(text) => text.chars().count(),
            Self::Multipart(parts) => parts
                .iter()
                .filter_map(|p| p.as_text())
                .map(|t| t.chars().count())
                .sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Multipart(parts) => parts.is_empty(),
        }
    }

    pub fn has_images(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Multipart(parts) => parts.iter().any(|p| p.is_image()),
        }
    }
}

impl Default for Content {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for Content {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Content {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}
