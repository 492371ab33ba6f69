//! Offline producer that streams the last user message back word by word.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use super::{ChunkProducer, ChunkStream, KeyCheck, ModelCatalog, ProducerError};
use crate::models::{ChatRequest, Metadata, ModelInfo, StreamChunk};

/// Name the echo producer reports as its model.
const ECHO_MODEL: &str = "echo";

#[derive(Debug, Clone, Default)]
pub struct EchoProducer {
    delay: Option<Duration>,
}

impl EchoProducer {
    pub const fn new() -> Self {
        Self { delay: None }
    }

    /// Pause between words, to make streaming visible.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        // Keep trailing whitespace attached so the pieces concatenate back.
        let word_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let tail = &rest[word_end..];
        let gap = tail.len() - tail.trim_start().len();
        words.push(rest[..word_end + gap].to_string());
        rest = &rest[word_end + gap..];
    }
    words
}

impl ChunkProducer for EchoProducer {
    fn stream(&self, request: ChatRequest) -> ChunkStream {
        let Some(last) = request.last_user_message() else {
            return Box::pin(stream::once(async {
                Err(ProducerError::EmptyConversation)
            }));
        };

        let mut metadata = Metadata::new();
        metadata.insert("model".into(), Value::String(ECHO_MODEL.into()));

        let chunks: Vec<StreamChunk> = split_words(&last.content)
            .into_iter()
            .map(|word| StreamChunk::text(word).with_metadata(metadata.clone()))
            .chain(std::iter::once(StreamChunk::done()))
            .collect();

        let delay = self.delay;
        Box::pin(stream::iter(chunks).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(chunk)
        }))
    }
}

#[async_trait]
impl KeyCheck for EchoProducer {
    async fn key_is_valid(&self) -> bool {
        true
    }
}

#[async_trait]
impl ModelCatalog for EchoProducer {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProducerError> {
        Ok(vec![ModelInfo {
            owned_by: Some("chatrelay".into()),
            ..ModelInfo::new(ECHO_MODEL)
        }])
    }
}
