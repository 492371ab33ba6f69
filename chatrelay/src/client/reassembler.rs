//! Turns a raw frame stream back into chunks and exchanges.

use std::collections::VecDeque;
use std::fmt::Display;

use axum::body::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

use super::ClientError;
use crate::codec::FrameDecoder;
use crate::models::{Metadata, StreamChunk};

/// Reads chunks off a byte stream, regardless of how reads split frames.
pub struct ChunkReader<S> {
    bytes: S,
    decoder: FrameDecoder,
    ready: VecDeque<StreamChunk>,
    ended: bool,
}

impl<S, E> ChunkReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(bytes: S) -> Self {
        Self {
            bytes,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            ended: false,
        }
    }

    /// Next decoded chunk; `None` once the transport has ended.
    ///
    /// Heartbeats and malformed frames are consumed silently.
    pub async fn next_chunk(&mut self) -> Option<Result<StreamChunk, ClientError>> {
        loop {
            if let Some(chunk) = self.ready.pop_front() {
                return Some(Ok(chunk));
            }
            if self.ended {
                return None;
            }

            match self.bytes.next().await {
                Some(Ok(read)) => self.ready.extend(self.decoder.push(&read)),
                Some(Err(e)) => {
                    self.ended = true;
                    return Some(Err(ClientError::Transport(e.to_string())));
                }
                None => {
                    self.ended = true;
                    self.decoder.finish();
                }
            }
        }
    }

    /// Heartbeats consumed so far.
    pub const fn heartbeats(&self) -> usize {
        self.decoder.heartbeats()
    }

    /// Malformed frames skipped so far.
    pub const fn skipped(&self) -> usize {
        self.decoder.skipped()
    }
}

/// How an exchange ended, from the client's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeEnd {
    /// A `done` chunk arrived.
    Completed,
    /// An `error` chunk arrived.
    Failed(String),
    /// The transport ended or broke before any terminal chunk.
    Abnormal,
}

/// Text reassembled from one exchange.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub content: String,
    pub end: ExchangeEnd,
    /// Metadata of the last chunk that carried any.
    pub metadata: Option<Metadata>,
}

impl Transcript {
    /// Convert an unsuccessful end into an error.
    pub fn into_result(self) -> Result<String, ClientError> {
        match self.end {
            ExchangeEnd::Completed => Ok(self.content),
            ExchangeEnd::Failed(message) => Err(ClientError::Exchange(message)),
            ExchangeEnd::Abnormal => Err(ClientError::AbnormalEnd),
        }
    }
}

/// Read chunks until one exchange ends, calling `on_text` for each text piece.
pub async fn read_exchange<S, E, F>(reader: &mut ChunkReader<S>, mut on_text: F) -> Transcript
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
    F: FnMut(&str),
{
    let mut content = String::new();
    let mut metadata = None;

    let end = loop {
        let chunk = match reader.next_chunk().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                debug!(error = %e, "transport failed mid-exchange");
                break ExchangeEnd::Abnormal;
            }
            None => break ExchangeEnd::Abnormal,
        };

        if let Some(meta) = chunk.metadata() {
            metadata = Some(meta.clone());
        }

        match chunk {
            StreamChunk::Text { content: piece, .. } => {
                on_text(&piece);
                content.push_str(&piece);
            }
            StreamChunk::Error { error, .. } => break ExchangeEnd::Failed(error),
            StreamChunk::Done { .. } => break ExchangeEnd::Completed,
        }
    };

    debug!(
        end = ?end,
        heartbeats = reader.heartbeats(),
        skipped = reader.skipped(),
        "exchange read"
    );
    Transcript {
        content,
        end,
        metadata,
    }
}
