//! Chat relay HTTP server.
//!
//! Endpoints (all under `/api/v1/openai`):
//! - GET /chat/events?sessionId= - Open the receive channel (event stream)
//! - POST /chat/submit - Start an exchange that streams to the receive channel
//! - POST /chat/stream - Start an exchange that streams in the response body
//! - POST /chat - Run an exchange to completion and reply with the whole message
//! - GET /models - Models the provider can serve
//! - GET /status - Provider key status
//! - GET /sessions - Open receive channels

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, rejection::QueryRejection, Query, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::models::{
    ApiResponse, ChatMessage, ChatRequest, ChatResponse, ChatRole, ModelInfo, SessionInfo,
    StatusReport,
};
use crate::provider::{ChunkStream, Provider};
use crate::relay::{
    relay_inline, relay_to_session, ConnectionKeeper, SessionRegistry, DEFAULT_SINK_CAPACITY,
};

/// Route prefix shared by every relay endpoint.
pub const API_PREFIX: &str = "/api/v1/openai";

/// Shared server state.
pub struct AppState {
    keeper: ConnectionKeeper,
    provider: Provider,
    sink_capacity: usize,
}

impl AppState {
    pub const fn new(keeper: ConnectionKeeper, provider: Provider) -> Self {
        Self {
            keeper,
            provider,
            sink_capacity: DEFAULT_SINK_CAPACITY,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        let keeper = ConnectionKeeper::new(Arc::new(SessionRegistry::new()))
            .with_heartbeat_interval(config.heartbeat_interval)
            .with_sink_capacity(config.sink_capacity);
        Self {
            sink_capacity: config.sink_capacity.max(1),
            ..Self::new(keeper, config.build_provider())
        }
    }

    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        self.keeper.registry()
    }

    async fn authorize(&self) -> Result<(), RelayError> {
        if self.provider.key_check.key_is_valid().await {
            Ok(())
        } else {
            Err(RelayError::Unauthorized)
        }
    }
}

// === Request/Response Types ===

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub session_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    pub session_id: String,
    pub message: String,
}

// === Server Lifecycle ===

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/chat/events", get(open_events))
        .route("/chat/submit", post(submit))
        .route("/chat/stream", post(stream_inline))
        .route("/chat", post(chat))
        .route("/models", get(list_models))
        .route("/status", get(status))
        .route("/sessions", get(list_sessions));

    Router::new()
        .nest(API_PREFIX, api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the server and serve until it fails.
pub async fn start_server(config: RelayConfig) -> Result<()> {
    let addr = config.socket_addr()?;
    let state = Arc::new(AppState::from_config(&config));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        %addr,
        provider = ?config.provider,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "chatrelay listening"
    );
    axum::serve(listener, router(state))
        .await
        .context("Server error")?;

    Ok(())
}

// === Handlers ===

/// Response headers for an event-stream body.
fn event_stream(body: Body) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

/// Check the fields every submission needs.
fn validate(request: &ChatRequest) -> Result<(), RelayError> {
    if request.messages.is_empty() {
        return Err(RelayError::InvalidRequest("messages must not be empty".into()));
    }
    Ok(())
}

async fn open_events(
    State(state): State<Arc<AppState>>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Response, RelayError> {
    let Query(query) = query.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;
    if query.session_id.trim().is_empty() {
        return Err(RelayError::InvalidRequest("sessionId must not be empty".into()));
    }

    let connection = state.keeper.open(&query.session_id);
    debug!(
        session_id = connection.session_id(),
        connection = %connection.connection_id(),
        "receive channel opened"
    );
    Ok(event_stream(Body::from_stream(connection)))
}

async fn submit(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), RelayError> {
    let Json(request) = payload.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;
    validate(&request)?;
    let session_id = request
        .session_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| RelayError::InvalidRequest("sessionId is required".into()))?;

    state.authorize().await?;
    state.registry().lookup(&session_id)?;
    let slot = state.registry().claim_exchange(&session_id)?;

    info!(%session_id, messages = request.messages.len(), "exchange accepted");
    let chunks = state.provider.producer.stream(request);
    let exchange = relay_to_session(slot, chunks);
    let id = session_id.clone();
    tokio::spawn(async move {
        let outcome = exchange.await;
        debug!(
            session_id = %id,
            state = ?outcome.state,
            failure = ?outcome.failure,
            frames = outcome.frames_written,
            pulled = outcome.chunks_pulled,
            "session exchange ended"
        );
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            success: true,
            session_id,
            message: "Request accepted, streaming to receive channel".into(),
        }),
    ))
}

async fn stream_inline(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, RelayError> {
    let Json(request) = payload.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;
    validate(&request)?;
    state.authorize().await?;

    let chunks = state.provider.producer.stream(request);
    let (frames, _exchange) = relay_inline(chunks, state.sink_capacity);
    let body = frames.map(Ok::<_, std::convert::Infallible>);
    Ok(event_stream(Body::from_stream(body)))
}

/// Drain a producer into one assistant message.
async fn collect_reply(mut chunks: ChunkStream) -> Result<ChatMessage, RelayError> {
    let mut content = String::new();
    let mut metadata = None;

    while let Some(item) = chunks.next().await {
        let chunk = item.map_err(|e| RelayError::Upstream(e.to_string()))?;
        if let Some(message) = chunk.error_message() {
            return Err(RelayError::Upstream(message.to_string()));
        }
        if let Some(text) = chunk.content() {
            content.push_str(text);
        }
        if let Some(meta) = chunk.metadata() {
            metadata = Some(meta.clone());
        }
        if chunk.is_terminal() {
            return Ok(ChatMessage {
                metadata,
                ..ChatMessage::new(ChatRole::Assistant, content)
            });
        }
    }
    Err(RelayError::Upstream("response stream ended unexpectedly".into()))
}

async fn chat(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, RelayError> {
    let Json(request) = payload.map_err(|e| RelayError::InvalidRequest(e.body_text()))?;
    validate(&request)?;
    state.authorize().await?;

    let session_id = request.session_id.clone();
    info!(messages = request.messages.len(), "chat request received");
    let message = collect_reply(state.provider.producer.stream(request)).await?;
    Ok(Json(ChatResponse {
        message,
        session_id,
    }))
}

async fn list_models(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<ModelInfo>>>, RelayError> {
    state.authorize().await?;
    let models = state
        .provider
        .catalog
        .list_models()
        .await
        .map_err(|e| RelayError::Upstream(e.to_string()))?;
    let message = format!("{} models available", models.len());
    Ok(Json(ApiResponse::ok(models, message)))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<StatusReport>> {
    let api_key_valid = state.provider.key_check.key_is_valid().await;
    let message = if api_key_valid {
        "API key is valid"
    } else {
        "API key is not valid"
    };
    Json(ApiResponse::ok(
        StatusReport {
            api_key_valid,
            timestamp: chrono::Utc::now(),
        },
        message,
    ))
}

async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<SessionInfo>>> {
    let sessions = state.registry().snapshot();
    let message = format!("{} open sessions", sessions.len());
    Json(ApiResponse::ok(sessions, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{read_exchange, ChunkReader, ExchangeEnd};
    use crate::models::StreamChunk;
    use crate::provider::{ChunkProducer, EchoProducer, KeyCheck, ProducerError};
    use async_trait::async_trait;
    use futures::stream;
    use std::time::Duration;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct Denied;

    #[async_trait]
    impl KeyCheck for Denied {
        async fn key_is_valid(&self) -> bool {
            false
        }
    }

    /// Replies with one text chunk, then fails.
    struct Broken;

    impl ChunkProducer for Broken {
        fn stream(&self, _request: ChatRequest) -> ChunkStream {
            Box::pin(stream::iter(vec![
                Ok(StreamChunk::text("partial")),
                Err(ProducerError::Decode("bad event".into())),
            ]))
        }
    }

    fn state_with(provider: Provider) -> Arc<AppState> {
        Arc::new(AppState::new(
            ConnectionKeeper::new(Arc::new(SessionRegistry::new())),
            provider,
        ))
    }

    fn echo_state() -> Arc<AppState> {
        state_with(Provider::new(EchoProducer::new()))
    }

    fn post_json(uri: &str, body: &impl Serialize) -> Request<Body> {
        Request::post(format!("{API_PREFIX}{uri}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(format!("{API_PREFIX}{uri}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn submit_without_receiver_is_rejected() {
        let app = router(echo_state());
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]).with_session("nobody");

        let resp = app.oneshot(post_json("/chat/submit", &request)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn submit_requires_session_id() {
        let app = router(echo_state());
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);

        let resp = app.oneshot(post_json("/chat/submit", &request)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let app = router(echo_state());
        let req = Request::post(format!("{API_PREFIX}/chat/submit"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["error"], "invalid_request");
    }

    #[tokio::test]
    async fn failed_key_check_is_unauthorized() {
        let app = router(state_with(Provider {
            key_check: Arc::new(Denied),
            ..Provider::new(EchoProducer::new())
        }));
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);

        for uri in ["/chat/stream", "/chat"] {
            let resp = app.clone().oneshot(post_json(uri, &request)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(json_body(resp).await["error"], "unauthorized");
        }
        let resp = app.oneshot(get("/models")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn events_requires_session_id() {
        let app = router(echo_state());
        let resp = app.oneshot(get("/chat/events")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn inline_stream_ends_after_terminal_frame() {
        let app = router(echo_state());
        let request = ChatRequest::new(vec![ChatMessage::user("hello inline world")]);

        let resp = app.oneshot(post_json("/chat/stream", &request)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");

        let mut reader = ChunkReader::new(resp.into_body().into_data_stream());
        let transcript = read_exchange(&mut reader, |_| {}).await;
        assert_eq!(transcript.content, "hello inline world");
        assert_eq!(transcript.end, ExchangeEnd::Completed);
        assert!(reader.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn session_channel_receives_submitted_exchange() {
        let state = echo_state();
        let app = router(Arc::clone(&state));

        let events = app
            .clone()
            .oneshot(get("/chat/events?sessionId=s-1"))
            .await
            .unwrap();
        assert_eq!(events.status(), StatusCode::OK);
        assert_eq!(events.headers()[header::CACHE_CONTROL], "no-cache");
        assert!(state.registry().contains("s-1"));

        let request = ChatRequest::new(vec![ChatMessage::user("Hi there")]).with_session("s-1");
        let resp = app
            .clone()
            .oneshot(post_json("/chat/submit", &request))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["sessionId"], "s-1");

        let mut reader = ChunkReader::new(events.into_body().into_data_stream());
        let transcript = read_exchange(&mut reader, |_| {}).await;
        assert_eq!(transcript.content, "Hi there");
        assert_eq!(transcript.end, ExchangeEnd::Completed);

        // The channel outlives the exchange.
        assert!(state.registry().contains("s-1"));
        drop(reader);
        assert!(!state.registry().contains("s-1"));
    }

    #[tokio::test]
    async fn status_reports_key_validity() {
        let app = router(echo_state());
        let resp = app.oneshot(get("/status")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["apiKeyValid"], true);
    }

    #[tokio::test]
    async fn sessions_lists_open_channels() {
        let state = echo_state();
        let app = router(Arc::clone(&state));

        let events = app
            .clone()
            .oneshot(get("/chat/events?sessionId=listed"))
            .await
            .unwrap();

        let body = json_body(app.clone().oneshot(get("/sessions")).await.unwrap()).await;
        let sessions = body["data"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["id"], "listed");
        assert!(sessions[0]["openedAt"].is_string());

        drop(events);
        let body = json_body(app.oneshot(get("/sessions")).await.unwrap()).await;
        assert!(body["data"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_submit_waits_for_first_exchange() {
        let state = state_with(Provider::new(
            EchoProducer::new().with_delay(Duration::from_millis(20)),
        ));
        let app = router(Arc::clone(&state));
        let events = app
            .clone()
            .oneshot(get("/chat/events?sessionId=busy"))
            .await
            .unwrap();

        let first = ChatRequest::new(vec![ChatMessage::user("one two three")]).with_session("busy");
        let second = ChatRequest::new(vec![ChatMessage::user("four five")]).with_session("busy");

        let resp = app.clone().oneshot(post_json("/chat/submit", &first)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let resp = app.clone().oneshot(post_json("/chat/submit", &second)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(resp).await["error"], "exchange_in_progress");

        let mut reader = ChunkReader::new(events.into_body().into_data_stream());
        let transcript = read_exchange(&mut reader, |_| {}).await;
        assert_eq!(transcript.content, "one two three");
        assert_eq!(transcript.end, ExchangeEnd::Completed);

        // The slot frees once the exchange task has returned.
        tokio::time::timeout(Duration::from_secs(1), async {
            while state.registry().is_streaming("busy") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let resp = app.clone().oneshot(post_json("/chat/submit", &second)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let transcript = read_exchange(&mut reader, |_| {}).await;
        assert_eq!(transcript.content, "four five");
        assert_eq!(transcript.end, ExchangeEnd::Completed);
    }

    #[tokio::test]
    async fn chat_returns_whole_reply() {
        let app = router(echo_state());
        let request = ChatRequest::new(vec![ChatMessage::user("all at once")]).with_session("s-9");

        let resp = app.oneshot(post_json("/chat", &request)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["message"]["role"], "assistant");
        assert_eq!(body["message"]["content"], "all at once");
        assert_eq!(body["message"]["metadata"]["model"], "echo");
        assert_eq!(body["sessionId"], "s-9");
    }

    #[tokio::test]
    async fn chat_producer_failure_is_bad_gateway() {
        let app = router(state_with(Provider {
            producer: Arc::new(Broken),
            ..Provider::new(EchoProducer::new())
        }));
        let request = ChatRequest::new(vec![ChatMessage::user("hi")]);

        let resp = app.oneshot(post_json("/chat", &request)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(resp).await;
        assert_eq!(body["error"], "upstream");
        assert!(body["message"].as_str().unwrap().contains("bad event"));
    }

    #[tokio::test]
    async fn models_lists_provider_catalog() {
        let app = router(echo_state());
        let resp = app.oneshot(get("/models")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"][0]["id"], "echo");
        assert_eq!(body["data"][0]["ownedBy"], "chatrelay");
    }
}
