//! OpenAI-compatible chat completions producer.
//!
//! Streams `POST {api_base}/chat/completions` with `stream: true` and turns
//! each upstream `data:` event into a text chunk. The upstream read runs in its
//! own task and forwards chunks over a bounded channel; the task stops as soon
//! as the relay drops the receiving end.

use async_trait::async_trait;
use axum::body::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::{ChunkProducer, ChunkStream, KeyCheck, ModelCatalog, ProducerError};
use crate::codec::{Line, LineBuffer};
use crate::models::{ChatRequest, Metadata, ModelInfo, StreamChunk};

/// Default upstream endpoint.
pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Model used when the request does not name one.
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 1000;
const DEFAULT_TOP_P: f32 = 1.0;

/// Sentinel payload ending an upstream stream.
const DONE_SENTINEL: &str = "[DONE]";

const CHANNEL_CAPACITY: usize = 32;

/// One parsed upstream streaming event.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionChunk {
    /// Model that produced the delta.
    pub model: Option<String>,
    /// Text delta, if this event carries one.
    pub content: Option<String>,
    /// Finish reason on the final delta.
    pub finish_reason: Option<String>,
}

impl CompletionChunk {
    /// Parse the payload of one upstream `data:` line.
    pub fn parse(payload: &str) -> Option<Self> {
        let payload = payload.trim();
        if payload.is_empty() {
            return None;
        }

        let value: Value = serde_json::from_str(payload).ok()?;

        let model = value.get("model").and_then(Value::as_str).map(String::from);

        let choice = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first());

        let content = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from);

        let finish_reason = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
            .map(String::from);

        Some(Self {
            model,
            content,
            finish_reason,
        })
    }

    /// Convert into a relay text chunk, if there is text to relay.
    pub fn into_chunk(self) -> Option<StreamChunk> {
        let content = self.content?;
        let mut metadata = Metadata::new();
        if let Some(model) = self.model {
            metadata.insert("model".into(), Value::String(model));
        }
        metadata.insert(
            "finishReason".into(),
            self.finish_reason.map_or(Value::Null, Value::String),
        );
        Some(StreamChunk::text(content).with_metadata(metadata))
    }
}

/// Request body sent upstream.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Value>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    stream: bool,
}

/// `GET /models` reply.
#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<UpstreamModel>,
}

#[derive(Debug, Deserialize)]
struct UpstreamModel {
    id: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    owned_by: Option<String>,
}

impl From<UpstreamModel> for ModelInfo {
    fn from(model: UpstreamModel) -> Self {
        Self {
            created: model.created,
            owned_by: model.owned_by,
            ..Self::new(model.id)
        }
    }
}

type ChunkSender = mpsc::Sender<Result<StreamChunk, ProducerError>>;

/// Producer backed by an OpenAI-compatible HTTP API.
#[derive(Debug, Clone)]
pub struct OpenAiProducer {
    client: reqwest::Client,
    api_base: String,
    api_key: Option<String>,
    default_model: String,
}

impl OpenAiProducer {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            api_key,
            default_model: DEFAULT_MODEL.to_string(),
        }
    }

    #[must_use]
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.api_base)
    }

    fn authorized(&self, call: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => call.bearer_auth(key),
            None => call,
        }
    }

    fn request_body<'a>(&'a self, request: &'a ChatRequest) -> CompletionRequest<'a> {
        let config = request.model_config.as_ref();
        let model = config
            .map(|c| c.model.as_str())
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.default_model);

        CompletionRequest {
            model,
            messages: request
                .messages
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
                .collect(),
            temperature: config
                .and_then(|c| c.temperature)
                .unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: config
                .and_then(|c| c.max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            top_p: config.and_then(|c| c.top_p).unwrap_or(DEFAULT_TOP_P),
            frequency_penalty: config.and_then(|c| c.frequency_penalty).unwrap_or(0.0),
            presence_penalty: config.and_then(|c| c.presence_penalty).unwrap_or(0.0),
            stream: true,
        }
    }

    /// Read the upstream stream and forward chunks until done or abandoned.
    async fn pump(self, request: ChatRequest, tx: ChunkSender) {
        let result = tokio::select! {
            () = tx.closed() => {
                debug!("relay abandoned the producer before completion");
                return;
            }
            result = self.forward(&request, &tx) => result,
        };

        if let Err(e) = result {
            warn!(error = %e, "upstream stream failed");
            let _ = tx.send(Err(e)).await;
        }
    }

    async fn forward(&self, request: &ChatRequest, tx: &ChunkSender) -> Result<(), ProducerError> {
        if request.messages.is_empty() {
            return Err(ProducerError::EmptyConversation);
        }

        let body = self.request_body(request);
        info!(model = body.model, messages = body.messages.len(), "opening upstream stream");

        let call = self.client.post(self.url("chat/completions")).json(&body);
        let response = self.authorized(call).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProducerError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        relay_events(response.bytes_stream(), tx).await
    }
}

/// Turn upstream `data:` events into chunks until the sentinel or end of body.
async fn relay_events<S>(bytes: S, tx: &ChunkSender) -> Result<(), ProducerError>
where
    S: Stream<Item = Result<Bytes, reqwest::Error>>,
{
    tokio::pin!(bytes);
    let mut lines = LineBuffer::new();

    while let Some(read) = bytes.next().await {
        let read = read?;
        for line in lines.push(&read) {
            let Line::Data(payload) = Line::classify(&line) else {
                continue;
            };
            if payload.trim() == DONE_SENTINEL {
                let _ = tx.send(Ok(StreamChunk::done())).await;
                return Ok(());
            }
            let event = CompletionChunk::parse(payload)
                .ok_or_else(|| ProducerError::Decode(payload.to_string()))?;
            if let Some(chunk) = event.into_chunk() {
                if tx.send(Ok(chunk)).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    // Some compatible servers close the stream without the sentinel.
    debug!("upstream closed without the done sentinel");
    let _ = tx.send(Ok(StreamChunk::done())).await;
    Ok(())
}

impl ChunkProducer for OpenAiProducer {
    fn stream(&self, request: ChatRequest) -> ChunkStream {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(self.clone().pump(request, tx));
        Box::pin(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl KeyCheck for OpenAiProducer {
    async fn key_is_valid(&self) -> bool {
        let Some(key) = &self.api_key else {
            return false;
        };
        match self.client.get(self.url("models")).bearer_auth(key).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "API key validation failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "API key validation error");
                false
            }
        }
    }
}

#[async_trait]
impl ModelCatalog for OpenAiProducer {
    async fn list_models(&self) -> Result<Vec<ModelInfo>, ProducerError> {
        let response = self.authorized(self.client.get(self.url("models"))).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProducerError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| ProducerError::Decode(e.to_string()))?;
        debug!(count = list.data.len(), "listed upstream models");
        Ok(list.data.into_iter().map(ModelInfo::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatMessage, ModelConfig};
    use futures::stream;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn parse_content_delta() {
        let payload = r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let event = CompletionChunk::parse(payload).unwrap();
        assert_eq!(event.model.as_deref(), Some("gpt-4o"));
        assert_eq!(event.content.as_deref(), Some("Hel"));
        assert_eq!(event.finish_reason, None);

        let chunk = event.into_chunk().unwrap();
        assert_eq!(chunk.content(), Some("Hel"));
        let meta = chunk.metadata().unwrap();
        assert_eq!(meta.get("model"), Some(&json!("gpt-4o")));
        assert_eq!(meta.get("finishReason"), Some(&Value::Null));
    }

    #[test]
    fn role_only_delta_yields_no_chunk() {
        let payload = r#"{"model":"gpt-4o","choices":[{"delta":{"role":"assistant","content":""}}]}"#;
        let event = CompletionChunk::parse(payload).unwrap();
        assert!(event.into_chunk().is_none());
    }

    #[test]
    fn finish_reason_captured() {
        let payload = r#"{"model":"gpt-4o","choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let event = CompletionChunk::parse(payload).unwrap();
        assert_eq!(event.finish_reason.as_deref(), Some("stop"));
        assert!(event.content.is_none());
    }

    #[test]
    fn invalid_payload_is_rejected() {
        assert!(CompletionChunk::parse("not json").is_none());
        assert!(CompletionChunk::parse("   ").is_none());
    }

    #[test]
    fn request_body_defaults() {
        let producer = OpenAiProducer::new(None).with_default_model("gpt-4o-mini");
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        let body = producer.request_body(&request);

        assert_eq!(body.model, "gpt-4o-mini");
        assert!((body.temperature - 0.7).abs() < f32::EPSILON);
        assert_eq!(body.max_tokens, 1000);
        assert!(body.stream);
        assert_eq!(body.messages, vec![json!({"role": "user", "content": "hi"})]);
    }

    #[test]
    fn request_body_honors_model_config() {
        let producer = OpenAiProducer::new(None);
        let mut request = ChatRequest::new(vec![ChatMessage::user("hi")]);
        request.model_config = Some(ModelConfig {
            temperature: Some(0.0),
            max_tokens: Some(64),
            ..ModelConfig::new("gpt-4o")
        });
        let body = producer.request_body(&request);

        assert_eq!(body.model, "gpt-4o");
        assert!(body.temperature.abs() < f32::EPSILON);
        assert_eq!(body.max_tokens, 64);
    }

    #[test]
    fn api_base_trailing_slash_trimmed() {
        let producer = OpenAiProducer::new(None).with_api_base("http://localhost:8080/v1/");
        assert_eq!(producer.url("models"), "http://localhost:8080/v1/models");
    }

    #[tokio::test]
    async fn missing_key_is_invalid() {
        let producer = OpenAiProducer::new(None);
        assert!(!producer.key_is_valid().await);
    }

    #[tokio::test]
    async fn empty_conversation_fails_without_network() {
        let producer = OpenAiProducer::new(None);
        let mut chunks = producer.stream(ChatRequest::new(Vec::new()));
        let first = chunks.next().await.unwrap();
        assert!(matches!(first, Err(ProducerError::EmptyConversation)));
        assert!(chunks.next().await.is_none());
    }

    fn event(content: &str) -> String {
        format!(
            "data: {}\n\n",
            json!({"model": "gpt-4o", "choices": [{"delta": {"content": content}, "finish_reason": null}]})
        )
    }

    fn producer_for(server: &MockServer) -> OpenAiProducer {
        OpenAiProducer::new(Some("sk-test".into())).with_api_base(server.uri())
    }

    async fn mount_stream(server: &MockServer, status: u16, body: String) {
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(ResponseTemplate::new(status).set_body_raw(body, "text/event-stream"))
            .mount(server)
            .await;
    }

    async fn run(producer: &OpenAiProducer) -> Vec<Result<StreamChunk, ProducerError>> {
        producer
            .stream(ChatRequest::new(vec![ChatMessage::user("hi")]))
            .collect()
            .await
    }

    #[tokio::test]
    async fn streams_deltas_until_done_sentinel() {
        let server = MockServer::start().await;
        let body = [
            "data: {\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"role\":\"assistant\",\"content\":\"\"}}]}\n\n".to_string(),
            event("Hel"),
            event("lo"),
            "data: [DONE]\n\n".to_string(),
            event("ignored"),
        ]
        .concat();
        mount_stream(&server, 200, body).await;

        let items = run(&producer_for(&server)).await;
        let chunks: Vec<StreamChunk> = items.into_iter().map(Result::unwrap).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].content(), Some("Hel"));
        assert_eq!(chunks[1].content(), Some("lo"));
        assert_eq!(chunks[2], StreamChunk::done());
        assert_eq!(
            chunks[0].metadata().and_then(|m| m.get("model")),
            Some(&json!("gpt-4o"))
        );
    }

    #[tokio::test]
    async fn upstream_rejection_is_an_error_item() {
        let server = MockServer::start().await;
        mount_stream(&server, 401, r#"{"error":{"message":"bad key"}}"#.to_string()).await;

        let items = run(&producer_for(&server)).await;

        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(ProducerError::Upstream { status, body }) => {
                assert_eq!(*status, 401);
                assert!(body.contains("bad key"));
            }
            other => panic!("expected upstream error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_event_stops_with_decode_error() {
        let server = MockServer::start().await;
        mount_stream(&server, 200, [event("ok"), "data: {oops\n\n".to_string()].concat()).await;

        let items = run(&producer_for(&server)).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().content(), Some("ok"));
        assert!(matches!(items[1], Err(ProducerError::Decode(_))));
    }

    #[tokio::test]
    async fn close_without_sentinel_still_completes() {
        let server = MockServer::start().await;
        mount_stream(&server, 200, event("only")).await;

        let items = run(&producer_for(&server)).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().content(), Some("only"));
        assert_eq!(items[1].as_ref().unwrap(), &StreamChunk::done());
    }

    #[tokio::test]
    async fn events_split_mid_line_are_reassembled() {
        let wire = [event("Hel"), event("lo"), "data: [DONE]\n\n".to_string()].concat();
        let bytes = wire.as_bytes();
        let parts: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::copy_from_slice(&bytes[..9])),
            Ok(Bytes::copy_from_slice(&bytes[9..70])),
            Ok(Bytes::copy_from_slice(&bytes[70..bytes.len() - 4])),
            Ok(Bytes::copy_from_slice(&bytes[bytes.len() - 4..])),
        ];
        let (tx, mut rx) = mpsc::channel(8);

        relay_events(stream::iter(parts), &tx).await.unwrap();
        drop(tx);

        let mut chunks = Vec::new();
        while let Some(item) = rx.recv().await {
            chunks.push(item.unwrap());
        }
        let text: String = chunks.iter().filter_map(StreamChunk::content).collect();
        assert_eq!(text, "Hello");
        assert_eq!(chunks.last(), Some(&StreamChunk::done()));
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn key_check_and_model_listing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    {"id": "gpt-4o", "object": "model", "created": 1_715_367_049, "owned_by": "system"},
                    {"id": "gpt-4o-mini", "object": "model"}
                ]
            })))
            .mount(&server)
            .await;

        let producer = producer_for(&server);
        assert!(producer.key_is_valid().await);

        let models = producer.list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "gpt-4o");
        assert_eq!(models[0].owned_by.as_deref(), Some("system"));
        assert_eq!(models[1].created, None);
    }

    #[tokio::test]
    async fn rejected_key_is_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let producer = producer_for(&server);
        assert!(!producer.key_is_valid().await);
        assert!(matches!(
            producer.list_models().await,
            Err(ProducerError::Upstream { status: 401, .. })
        ));
    }
}
