//! Data models shared by the relay server and client.

mod catalog;
mod chunk;
mod message;
mod request;
mod response;
mod session;

pub use catalog::ModelInfo;
pub use chunk::{Metadata, StreamChunk};
pub use message::{ChatMessage, ChatRole};
pub use request::{ChatRequest, ModelConfig};
pub use response::{ApiResponse, ChatResponse, StatusReport};
pub use session::SessionInfo;
