//! Stream chunk model: the wire-level unit of a streamed response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque side-channel data attached to a chunk (model name, usage, finish reason).
pub type Metadata = Map<String, Value>;

/// Kind of a chunk, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Text,
    Error,
    Done,
}

impl ChunkKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Error => "error",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of a streamed response.
///
/// Serialized as `{ "type": "text"|"error"|"done", "content"?, "error"?, "metadata"? }`.
/// `content` exists only on text chunks and `error` only on error chunks, so the
/// shape is enforced by the enum rather than by optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamChunk {
    /// Incremental text fragment. Not aligned to any token or word boundary.
    Text {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    /// Terminal failure.
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
    /// Terminal success.
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Metadata>,
    },
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
            metadata: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
            metadata: None,
        }
    }

    pub const fn done() -> Self {
        Self::Done { metadata: None }
    }

    /// Attach metadata, replacing any already present.
    #[must_use]
    pub fn with_metadata(mut self, value: Metadata) -> Self {
        match &mut self {
            Self::Text { metadata, .. } | Self::Error { metadata, .. } | Self::Done { metadata } => {
                *metadata = Some(value);
            }
        }
        self
    }

    pub const fn kind(&self) -> ChunkKind {
        match self {
            Self::Text { .. } => ChunkKind::Text,
            Self::Error { .. } => ChunkKind::Error,
            Self::Done { .. } => ChunkKind::Done,
        }
    }

    /// Whether this chunk ends an exchange.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }

    /// Text content, for text chunks.
    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Text { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Failure description, for error chunks.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub const fn metadata(&self) -> Option<&Metadata> {
        match self {
            Self::Text { metadata, .. } | Self::Error { metadata, .. } | Self::Done { metadata } => {
                metadata.as_ref()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_without_metadata_has_no_extra_fields() {
        let json = serde_json::to_string(&StreamChunk::text("Hi")).unwrap();
        assert_eq!(json, r#"{"type":"text","content":"Hi"}"#);
    }

    #[test]
    fn done_serializes_bare() {
        let json = serde_json::to_string(&StreamChunk::done()).unwrap();
        assert_eq!(json, r#"{"type":"done"}"#);
    }

    #[test]
    fn error_keeps_metadata() {
        let mut meta = Metadata::new();
        meta.insert("model".into(), json!("gpt-4o"));
        let chunk = StreamChunk::error("upstream failed").with_metadata(meta);

        let value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "error": "upstream failed", "metadata": {"model": "gpt-4o"}})
        );

        let back: StreamChunk = serde_json::from_value(value).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn text_requires_content() {
        let parsed = serde_json::from_str::<StreamChunk>(r#"{"type":"text"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parsed = serde_json::from_str::<StreamChunk>(r#"{"type":"progress"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn terminal_kinds() {
        assert!(!StreamChunk::text("x").is_terminal());
        assert!(StreamChunk::error("x").is_terminal());
        assert!(StreamChunk::done().is_terminal());
        assert_eq!(StreamChunk::text("abc").content(), Some("abc"));
        assert_eq!(StreamChunk::error("bad").error_message(), Some("bad"));
    }
}
