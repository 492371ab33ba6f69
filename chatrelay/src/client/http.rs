//! Thin HTTP client for the relay endpoints.

use std::pin::Pin;

use axum::body::Bytes;
use futures::Stream;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{ChunkReader, ClientError};
use crate::models::{ApiResponse, ChatRequest, ChatResponse, ModelInfo, SessionInfo, StatusReport};
use crate::server::API_PREFIX;

/// Raw response body of a streaming call.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

#[derive(Debug, Deserialize)]
struct ErrorReply {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    /// `base_url` is the server origin, e.g. `http://127.0.0.1:3001`.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    /// Open the long-lived receive channel for `session_id`.
    pub async fn open_channel(&self, session_id: &str) -> Result<ChunkReader<ByteStream>, ClientError> {
        let url = format!(
            "{}?sessionId={}",
            self.url("/chat/events"),
            urlencoding::encode(session_id)
        );
        let resp = self.client.get(&url).send().await?;
        let resp = check(resp).await?;
        debug!(%session_id, "receive channel open");
        Ok(ChunkReader::new(Box::pin(resp.bytes_stream())))
    }

    /// Submit a request whose frames go to the open receive channel.
    pub async fn submit(&self, request: &ChatRequest) -> Result<(), ClientError> {
        let resp = self
            .client
            .post(self.url("/chat/submit"))
            .json(request)
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }

    /// Submit a request and read its frames from the response body.
    pub async fn stream_inline(&self, request: &ChatRequest) -> Result<ChunkReader<ByteStream>, ClientError> {
        let resp = self
            .client
            .post(self.url("/chat/stream"))
            .json(request)
            .send()
            .await?;
        let resp = check(resp).await?;
        Ok(ChunkReader::new(Box::pin(resp.bytes_stream())))
    }

    /// Submit a request and wait for the whole reply.
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
        let resp = self.client.post(self.url("/chat")).json(request).send().await?;
        Ok(check(resp).await?.json().await?)
    }

    pub async fn models(&self) -> Result<Vec<ModelInfo>, ClientError> {
        self.get_data("/models").await
    }

    pub async fn status(&self) -> Result<StatusReport, ClientError> {
        self.get_data("/status").await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionInfo>, ClientError> {
        self.get_data("/sessions").await
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self.client.get(self.url(path)).send().await?;
        let reply: ApiResponse<T> = check(resp).await?.json().await?;
        reply.data.ok_or_else(|| ClientError::Status {
            status: StatusCode::OK.as_u16(),
            message: reply.message.unwrap_or_else(|| "response carried no data".into()),
        })
    }
}

/// Turn a non-success response into [`ClientError::Status`].
async fn check(resp: Response) -> Result<Response, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp
        .json::<ErrorReply>()
        .await
        .ok()
        .and_then(|r| r.message)
        .unwrap_or_else(|| status.to_string());
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}
