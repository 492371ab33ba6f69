//! Session-keyed streaming relay.
//!
//! - `registry`: session id -> open sink
//! - `keeper`: one receive channel's lifetime and heartbeat
//! - `multiplexer`: drains a producer onto a sink, one exchange at a time

mod keeper;
mod multiplexer;
mod registry;

pub use keeper::{
    ConnectionKeeper, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_SINK_CAPACITY, MIN_HEARTBEAT_INTERVAL,
};
pub use multiplexer::{relay_inline, relay_to_session};
pub use registry::{ConnectionId, SessionRegistry};
