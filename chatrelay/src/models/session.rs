//! Session snapshot exposed for listing open receive channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Client-assigned session identifier.
    pub id: String,
    /// Identifier of the connection currently holding the session.
    pub connection_id: String,
    /// When the receive channel was opened.
    pub opened_at: DateTime<Utc>,
    /// Last successful write to the channel (chunk or heartbeat).
    pub last_activity: DateTime<Utc>,
    /// Whether an exchange is currently streaming into the channel.
    #[serde(default)]
    pub streaming: bool,
}
