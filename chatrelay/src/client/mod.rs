//! Client side of the relay: HTTP calls plus frame reassembly.

mod http;
mod reassembler;

use thiserror::Error;

pub use http::RelayClient;
pub use reassembler::{read_exchange, ChunkReader, ExchangeEnd, Transcript};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("exchange failed: {0}")]
    Exchange(String),

    #[error("stream ended before the exchange completed")]
    AbnormalEnd,
}
