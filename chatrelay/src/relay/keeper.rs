//! Connection keeper: owns one receive channel from open to close.
//!
//! Opening a channel registers its sink, starts the heartbeat, and hands back a
//! [`Connection`] that the HTTP layer streams as the response body. Teardown
//! runs from whichever side notices first:
//!
//! - the body is dropped (peer disconnected): the [`ConnectionLease`] drops
//! - a heartbeat write fails: the heartbeat task exits and releases
//! - a multiplexer write fails: the session target releases
//!
//! All three go through [`SessionRegistry::release`], which only removes the
//! mapping while it still belongs to this connection, so cleanup happens once
//! and never evicts a newer connection for the same session.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::registry::{ConnectionId, SessionRegistry, SessionSink};
use crate::codec::heartbeat_frame;

/// Default interval between keep-alive frames.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shortest accepted heartbeat interval; a zero period would panic the ticker.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of frames buffered per connection before writers wait.
pub const DEFAULT_SINK_CAPACITY: usize = 64;

/// Opens receive channels against a shared registry.
#[derive(Debug, Clone)]
pub struct ConnectionKeeper {
    registry: Arc<SessionRegistry>,
    heartbeat_interval: Duration,
    sink_capacity: usize,
}

impl ConnectionKeeper {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    #[must_use]
    pub fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity.max(1);
        self
    }

    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open a receive channel for `session_id`, replacing any previous one.
    pub fn open(&self, session_id: &str) -> Connection {
        let (tx, rx) = mpsc::channel(self.sink_capacity);
        let sink = SessionSink::new(tx);
        let connection = sink.connection();

        self.registry.register(session_id, sink.clone());

        let heartbeat = tokio::spawn(run_heartbeat(
            Arc::clone(&self.registry),
            session_id.to_string(),
            sink,
            self.heartbeat_interval,
        ));

        Connection {
            frames: ReceiverStream::new(rx),
            lease: ConnectionLease {
                registry: Arc::clone(&self.registry),
                session_id: session_id.to_string(),
                connection,
                heartbeat,
            },
        }
    }
}

/// Writes a heartbeat frame every `period` until the channel closes.
async fn run_heartbeat(
    registry: Arc<SessionRegistry>,
    session_id: String,
    sink: SessionSink,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = sink.closed() => {
                debug!(%session_id, connection = %sink.connection(), "heartbeat stopped, peer gone");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.write(heartbeat_frame()).await {
                    warn!(%session_id, error = %e, "heartbeat write failed");
                    break;
                }
            }
        }
    }

    registry.release(&session_id, sink.connection());
}

/// Guarantees release of a connection's registry entry and heartbeat task.
///
/// Dropped with the [`Connection`] on every exit path.
#[derive(Debug)]
pub struct ConnectionLease {
    registry: Arc<SessionRegistry>,
    session_id: String,
    connection: ConnectionId,
    heartbeat: JoinHandle<()>,
}

impl ConnectionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if self.registry.release(&self.session_id, self.connection) {
            info!(session_id = %self.session_id, connection = %self.connection, "receive channel closed");
        }
    }
}

/// Frames flowing out to one client, in write order.
///
/// Stays open across exchanges; ends only when every writer is gone.
#[derive(Debug)]
pub struct Connection {
    frames: ReceiverStream<Bytes>,
    lease: ConnectionLease,
}

impl Connection {
    pub fn session_id(&self) -> &str {
        self.lease.session_id()
    }

    pub const fn connection_id(&self) -> ConnectionId {
        self.lease.connection()
    }
}

impl Stream for Connection {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.frames).poll_next(cx).map(|frame| frame.map(Ok))
    }
}
