//! Framing codec for the event-stream wire format.

mod decoder;
mod frame;

pub use decoder::{FrameDecoder, Line, LineBuffer};
pub use frame::{encode_chunk, heartbeat_frame};
