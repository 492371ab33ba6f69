//! Chunk producers: the upstream side of an exchange.
//!
//! The relay treats a producer as an opaque, lazy sequence of chunks. Dropping
//! the stream abandons the producer; implementations stop their upstream work
//! when that happens.

mod echo;
mod openai;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::models::{ChatRequest, ModelInfo, StreamChunk};

pub use echo::EchoProducer;
pub use openai::{OpenAiProducer, DEFAULT_API_BASE, DEFAULT_MODEL};

/// A producer's output: text chunks, then one terminal chunk.
///
/// An `Err` item means the producer failed mid-iteration; the relay converts it
/// into a terminal error chunk.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProducerError>> + Send>>;

/// Failures raised by a producer while streaming.
#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("failed to decode upstream event: {0}")]
    Decode(String),

    #[error("conversation has no messages")]
    EmptyConversation,
}

/// Turns a chat request into a chunk stream.
pub trait ChunkProducer: Send + Sync {
    fn stream(&self, request: ChatRequest) -> ChunkStream;
}

/// Boolean capability check on the provider credentials.
#[async_trait]
pub trait KeyCheck: Send + Sync {
    async fn key_is_valid(&self) -> bool;
}

/// Lists the models the provider can serve.
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProducerError>;
}

/// The capabilities the server needs from one upstream.
#[derive(Clone)]
pub struct Provider {
    pub producer: Arc<dyn ChunkProducer>,
    pub key_check: Arc<dyn KeyCheck>,
    pub catalog: Arc<dyn ModelCatalog>,
}

impl Provider {
    pub fn new<P>(provider: P) -> Self
    where
        P: ChunkProducer + KeyCheck + ModelCatalog + 'static,
    {
        let provider = Arc::new(provider);
        Self {
            producer: provider.clone(),
            key_check: provider.clone(),
            catalog: provider,
        }
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").finish_non_exhaustive()
    }
}
