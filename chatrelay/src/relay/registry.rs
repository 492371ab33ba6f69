//! Session registry: maps a client-assigned session id to its open sink.
//!
//! The registry is the only shared mutable state in the relay. One lock guards
//! the map, so replacing a sink is serialized with every lookup for the same id,
//! and no caller ever observes a half-removed session.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::futures::Notified;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::RelayError;
use crate::models::SessionInfo;

/// Identifier of one physical connection (one receive channel).
///
/// A session id can be held by several connections over its lifetime when the
/// client reconnects; the connection id tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Write side of an open receive channel.
///
/// Cloning is cheap; clones share the same channel and activity clock.
#[derive(Debug, Clone)]
pub struct SessionSink {
    connection: ConnectionId,
    tx: mpsc::Sender<Bytes>,
    opened_at: DateTime<Utc>,
    last_activity_ms: Arc<AtomicI64>,
}

impl SessionSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        let opened_at = Utc::now();
        Self {
            connection: ConnectionId::new(),
            tx,
            opened_at,
            last_activity_ms: Arc::new(AtomicI64::new(opened_at.timestamp_millis())),
        }
    }

    pub const fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Write one encoded frame, waiting for room in the channel.
    pub async fn write(&self, frame: Bytes) -> Result<(), RelayError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| RelayError::TransportWrite(self.connection))?;
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Resolves once the receiving side has gone away.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }

    pub const fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(self.last_activity_ms.load(Ordering::Relaxed))
            .unwrap_or(self.opened_at)
    }
}

/// Registry of open sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionSink>>,
    /// Sessions with an exchange currently streaming.
    exchanges: Mutex<HashSet<String>>,
    changed: Notify,
}

/// Exclusive right to stream one exchange into a session.
///
/// Frames carry no exchange id, so a session runs one exchange at a time.
/// The slot is freed when dropped.
pub struct ExchangeSlot {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl ExchangeSlot {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

impl Drop for ExchangeSlot {
    fn drop(&mut self) {
        self.registry.exchanges.lock().remove(&self.session_id);
        debug!(session_id = %self.session_id, "exchange slot freed");
    }
}

impl fmt::Debug for ExchangeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeSlot")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the exchange slot for `session_id`.
    ///
    /// Fails with [`RelayError::ExchangeInProgress`] while another exchange
    /// for the same session still holds it.
    pub fn claim_exchange(self: &Arc<Self>, session_id: &str) -> Result<ExchangeSlot, RelayError> {
        if !self.exchanges.lock().insert(session_id.to_string()) {
            return Err(RelayError::ExchangeInProgress(session_id.to_string()));
        }
        Ok(ExchangeSlot {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
        })
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.exchanges.lock().contains(session_id)
    }

    /// Resolves on the next register, unregister or release.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Install `sink` as the current handle for `session_id`.
    ///
    /// A previous handle is removed from the map and returned, not closed:
    /// its owner is still responsible for its lifetime.
    pub fn register(&self, session_id: &str, sink: SessionSink) -> Option<SessionSink> {
        let connection = sink.connection();
        let replaced = self.sessions.write().insert(session_id.to_string(), sink);
        self.changed.notify_waiters();
        match &replaced {
            Some(old) => info!(
                session_id,
                %connection,
                replaced = %old.connection(),
                "session re-registered"
            ),
            None => info!(session_id, %connection, "session registered"),
        }
        replaced
    }

    /// Current sink for `session_id`.
    pub fn lookup(&self, session_id: &str) -> Result<SessionSink, RelayError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }

    /// Remove the mapping for `session_id`. Removing an absent id is a no-op.
    #[allow(dead_code)]
    pub fn unregister(&self, session_id: &str) -> Option<SessionSink> {
        let removed = self.sessions.write().remove(session_id);
        self.changed.notify_waiters();
        if let Some(sink) = &removed {
            info!(session_id, connection = %sink.connection(), "session unregistered");
        }
        removed
    }

    /// Remove the mapping only while it still belongs to `connection`.
    ///
    /// Returns `true` for the single call that actually removed it, which lets
    /// every teardown path call this freely.
    pub fn release(&self, session_id: &str, connection: ConnectionId) -> bool {
        let mut sessions = self.sessions.write();
        let owned = sessions
            .get(session_id)
            .map(|sink| sink.connection() == connection);
        match owned {
            Some(true) => {
                sessions.remove(session_id);
                drop(sessions);
                self.changed.notify_waiters();
                info!(session_id, %connection, "session released");
                true
            }
            Some(false) => {
                debug!(session_id, %connection, "release skipped, session held by a newer connection");
                false
            }
            None => false,
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().contains_key(session_id)
    }

    /// Snapshot of every open session, oldest first.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .iter()
            .map(|(id, sink)| SessionInfo {
                id: id.clone(),
                connection_id: sink.connection().to_string(),
                opened_at: sink.opened_at(),
                last_activity: sink.last_activity(),
                streaming: self.is_streaming(id),
            })
            .collect();
        sessions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        sessions
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}
