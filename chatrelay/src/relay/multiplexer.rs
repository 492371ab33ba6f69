//! Stream multiplexer: drains a producer onto a frame target.
//!
//! One [`Exchange`] moves through `Idle -> Streaming -> {Completed, Failed}`.
//! Both protocol variants share this core; they differ only in the
//! [`FrameTarget`] they write to:
//!
//! - [`SessionTarget`] resolves the session's sink through the registry for
//!   every write, so a reconnect mid-exchange is honored on the next frame
//! - [`InlineTarget`] writes to the submitting call's own response body

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::registry::{ConnectionId, ExchangeSlot, SessionRegistry};
use crate::codec::encode_chunk;
use crate::error::RelayError;
use crate::models::StreamChunk;
use crate::provider::ChunkStream;

/// Message sent when a producer stops without a terminal chunk.
const TRUNCATED_MESSAGE: &str = "response stream ended unexpectedly";

/// Where an exchange writes its frames.
#[async_trait]
pub trait FrameTarget: Send + Sync {
    /// Short label for logs.
    fn label(&self) -> &str;

    /// Checked once before streaming starts.
    async fn ready(&self) -> Result<(), RelayError> {
        Ok(())
    }

    /// Write one encoded frame.
    async fn deliver(&mut self, frame: Bytes) -> Result<(), RelayError>;

    /// Resolves once nobody is listening any more.
    async fn disconnected(&self);
}

/// Writes to whichever sink is registered for a session at write time.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl SessionTarget {
    pub fn new(registry: Arc<SessionRegistry>, session_id: impl Into<String>) -> Self {
        Self {
            registry,
            session_id: session_id.into(),
        }
    }
}

#[async_trait]
impl FrameTarget for SessionTarget {
    fn label(&self) -> &str {
        &self.session_id
    }

    async fn ready(&self) -> Result<(), RelayError> {
        self.registry.lookup(&self.session_id).map(|_| ())
    }

    async fn deliver(&mut self, frame: Bytes) -> Result<(), RelayError> {
        let sink = self.registry.lookup(&self.session_id)?;
        if let Err(e) = sink.write(frame).await {
            self.registry.release(&self.session_id, sink.connection());
            return Err(e);
        }
        Ok(())
    }

    async fn disconnected(&self) {
        loop {
            // Armed before the lookup so a replacement in between is not missed.
            let changed = self.registry.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let Ok(sink) = self.registry.lookup(&self.session_id) else {
                return;
            };
            tokio::select! {
                () = sink.closed() => match self.registry.lookup(&self.session_id) {
                    Ok(current) if current.connection() != sink.connection() => {}
                    _ => return,
                },
                () = &mut changed => {}
            }
            debug!(session_id = %self.session_id, "session sink changed, following current connection");
        }
    }
}

/// Writes to the response body of the call that submitted the request.
#[derive(Debug)]
pub struct InlineTarget {
    tx: mpsc::Sender<Bytes>,
    connection: ConnectionId,
    label: String,
}

impl InlineTarget {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        let connection = ConnectionId::new();
        Self {
            tx,
            connection,
            label: format!("inline/{connection}"),
        }
    }
}

#[async_trait]
impl FrameTarget for InlineTarget {
    fn label(&self) -> &str {
        &self.label
    }

    async fn deliver(&mut self, frame: Bytes) -> Result<(), RelayError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::TransportWrite(self.connection))
    }

    async fn disconnected(&self) {
        self.tx.closed().await;
    }
}

/// Lifecycle of one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Accepted, not yet draining.
    Idle,
    /// Pulling chunks and writing frames.
    Streaming,
    /// A `done` chunk was written.
    Completed,
    /// Ended by an error chunk, a write failure, a missing sink, or a disconnect.
    Failed,
}

/// Why an exchange failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeFailure {
    /// The producer sent an error chunk or failed mid-iteration.
    Producer(String),
    /// The producer stopped without a terminal chunk.
    Truncated,
    /// No sink was registered for the session.
    SessionNotFound,
    /// A write to the sink failed.
    Transport,
    /// The client went away while the producer was pending.
    Cancelled,
}

/// Result of running an exchange to its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeOutcome {
    pub state: ExchangeState,
    pub failure: Option<ExchangeFailure>,
    /// Frames successfully written, terminal frame included.
    pub frames_written: usize,
    /// Items pulled from the producer.
    pub chunks_pulled: usize,
}

enum Step {
    Pulled(Option<Result<StreamChunk, crate::provider::ProducerError>>),
    Disconnected,
}

/// One streaming exchange bound to a frame target.
pub struct Exchange<T> {
    target: T,
    state: ExchangeState,
    frames_written: usize,
    chunks_pulled: usize,
}

impl<T: FrameTarget> Exchange<T> {
    pub const fn new(target: T) -> Self {
        Self {
            target,
            state: ExchangeState::Idle,
            frames_written: 0,
            chunks_pulled: 0,
        }
    }

    /// Drain `chunks` onto the target until a terminal transition.
    ///
    /// The producer is dropped as soon as the exchange ends, without pulling
    /// anything further.
    pub async fn run(mut self, mut chunks: ChunkStream) -> ExchangeOutcome {
        if let Err(e) = self.target.ready().await {
            warn!(target_label = self.target.label(), error = %e, "exchange rejected before streaming");
            return self.finish(Some(ExchangeFailure::SessionNotFound));
        }
        self.transition(ExchangeState::Streaming);

        loop {
            let step = tokio::select! {
                biased;
                () = self.target.disconnected() => Step::Disconnected,
                item = chunks.next() => Step::Pulled(item),
            };

            let chunk = match step {
                Step::Disconnected => {
                    drop(chunks);
                    info!(target_label = self.target.label(), "client gone, producer abandoned");
                    return self.finish(Some(ExchangeFailure::Cancelled));
                }
                Step::Pulled(None) => {
                    drop(chunks);
                    warn!(target_label = self.target.label(), "producer ended without a terminal chunk");
                    return self
                        .fail_with_error_chunk(ExchangeFailure::Truncated, TRUNCATED_MESSAGE)
                        .await;
                }
                Step::Pulled(Some(Err(e))) => {
                    drop(chunks);
                    let message = e.to_string();
                    warn!(target_label = self.target.label(), error = %message, "producer failed");
                    return self
                        .fail_with_error_chunk(ExchangeFailure::Producer(message.clone()), &message)
                        .await;
                }
                Step::Pulled(Some(Ok(chunk))) => chunk,
            };
            self.chunks_pulled += 1;

            if let Err(e) = self.write(&chunk).await {
                drop(chunks);
                return self.finish(Some(write_failure(&e)));
            }

            if chunk.is_terminal() {
                drop(chunks);
                let failure = chunk
                    .error_message()
                    .map(|message| ExchangeFailure::Producer(message.to_string()));
                return self.finish(failure);
            }
        }
    }

    async fn write(&mut self, chunk: &StreamChunk) -> Result<(), RelayError> {
        let frame = encode_chunk(chunk)?;
        self.target.deliver(frame).await?;
        self.frames_written += 1;
        debug!(target_label = self.target.label(), kind = %chunk.kind(), "frame written");
        Ok(())
    }

    /// Deliver a synthesized error chunk if the target is still reachable.
    async fn fail_with_error_chunk(
        mut self,
        failure: ExchangeFailure,
        message: &str,
    ) -> ExchangeOutcome {
        if let Err(e) = self.write(&StreamChunk::error(message)).await {
            debug!(target_label = self.target.label(), error = %e, "error chunk not delivered");
        }
        self.finish(Some(failure))
    }

    fn transition(&mut self, next: ExchangeState) {
        debug!(target_label = self.target.label(), from = ?self.state, to = ?next, "exchange transition");
        self.state = next;
    }

    fn finish(mut self, failure: Option<ExchangeFailure>) -> ExchangeOutcome {
        let next = if failure.is_some() {
            ExchangeState::Failed
        } else {
            ExchangeState::Completed
        };
        self.transition(next);
        info!(target_label = self.target.label(), state = ?self.state, "exchange finished");
        ExchangeOutcome {
            state: self.state,
            failure,
            frames_written: self.frames_written,
            chunks_pulled: self.chunks_pulled,
        }
    }
}

fn write_failure(error: &RelayError) -> ExchangeFailure {
    match error {
        RelayError::SessionNotFound(_) => ExchangeFailure::SessionNotFound,
        RelayError::Encode(e) => ExchangeFailure::Producer(e.to_string()),
        _ => ExchangeFailure::Transport,
    }
}

/// Run an exchange that writes to the sink registered for the slot's session.
///
/// The slot is held until the exchange has ended, so the next exchange for the
/// session starts only after this one's terminal frame.
pub fn relay_to_session(
    slot: ExchangeSlot,
    chunks: ChunkStream,
) -> impl Future<Output = ExchangeOutcome> + Send + 'static {
    let target = SessionTarget::new(Arc::clone(slot.registry()), slot.session_id());
    async move {
        let outcome = Exchange::new(target).run(chunks).await;
        drop(slot);
        outcome
    }
}

/// Run an exchange that streams into a fresh response body.
///
/// The body ends once the exchange has written its terminal frame.
pub fn relay_inline(
    chunks: ChunkStream,
    capacity: usize,
) -> (ReceiverStream<Bytes>, JoinHandle<ExchangeOutcome>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(Exchange::new(InlineTarget::new(tx)).run(chunks));
    (ReceiverStream::new(rx), handle)
}
