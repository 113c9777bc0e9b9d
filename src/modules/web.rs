//! HTTP input
//!
//! `POST /api/message` publishes the text and waits for the engine's
//! response with the matching correlation id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::{InputFactory, InputModule, ModuleContext};
use crate::bus::{BusStats, Envelope, EnvelopeKind, MessageBus, Payload};
use crate::config::ModuleConfig;
use crate::tools::ToolCallResult;
use crate::{Error, Result};

/// Web input settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long a request waits for its response
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

const fn default_port() -> u16 {
    8080
}

const fn default_response_timeout() -> u64 {
    30
}

type Pending = HashMap<Uuid, oneshot::Sender<Arc<Envelope>>>;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct WebState {
    name: String,
    bus: MessageBus,
    pending: Arc<Mutex<Pending>>,
    response_timeout: Duration,
}

impl WebState {
    #[must_use]
    pub fn new(name: &str, bus: MessageBus, response_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            bus,
            pending: Arc::new(Mutex::new(HashMap::new())),
            response_timeout,
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests waiting for a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    /// Hand a response to the request waiting for it
    ///
    /// Returns false if nobody is waiting (timed out, gone, or not ours).
    pub fn resolve(&self, envelope: Arc<Envelope>) -> bool {
        let Some(id) = envelope.correlation_id else {
            return false;
        };
        let waiter = self.pending().remove(&id);
        waiter.is_some_and(|waiter| waiter.send(envelope).is_ok())
    }

    /// Register a waiter for `id`, removed again when the guard drops
    fn wait_for(&self, id: Uuid) -> (PendingGuard, oneshot::Receiver<Arc<Envelope>>) {
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id, tx);
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };
        (guard, rx)
    }
}

/// Drops a request's waiter when its handler ends, including when the
/// client disconnects and axum drops the handler mid-wait
struct PendingGuard {
    pending: Arc<Mutex<Pending>>,
    id: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    #[serde(alias = "text")]
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub correlation_id: Uuid,
    pub response: String,
    pub results: Vec<ToolCallResult>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub input: String,
    pub pending: usize,
    pub bus: BusStats,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Publish a message and wait for its response
///
/// # Errors
///
/// `400` for an empty message, `504` when no response arrives in time
pub async fn send_message(
    State(state): State<WebState>,
    Json(request): Json<MessageRequest>,
) -> std::result::Result<Json<MessageResponse>, ApiError> {
    let text = request.message.trim();
    if text.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message is empty"));
    }

    let inbound = Envelope::inbound(&state.name, text);
    let id = inbound.id;
    let (_guard, rx) = state.wait_for(id);

    tracing::debug!(input = %state.name, %id, "web message");
    state.bus.publish(inbound);

    let outcome = tokio::time::timeout(state.response_timeout, rx).await;
    match outcome {
        Ok(Ok(envelope)) => {
            let (response, results) = match &envelope.payload {
                Payload::Response { text, results } => (text.clone(), results.clone()),
                other => (other.text().unwrap_or_default().to_string(), Vec::new()),
            };
            Ok(Json(MessageResponse {
                correlation_id: id,
                response,
                results,
            }))
        }
        Ok(Err(_)) => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "shutting down",
        )),
        Err(_) => {
            tracing::warn!(input = %state.name, %id, "no response in time");
            Err(api_error(
                StatusCode::GATEWAY_TIMEOUT,
                "no response in time",
            ))
        }
    }
}

async fn status(State(state): State<WebState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        input: state.name.clone(),
        pending: state.pending_count(),
        bus: state.bus.stats(),
    })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Routes served by the web input
pub fn router(state: WebState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/message", post(send_message))
        .route("/api/status", get(status))
        .route("/health", get(health))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// HTTP input module
#[derive(Debug)]
pub struct WebInput {
    name: String,
    config: WebConfig,
}

impl WebInput {
    #[must_use]
    pub fn new(name: &str, config: WebConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

#[async_trait]
impl InputModule for WebInput {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, ctx: ModuleContext) -> Result<()> {
        let state = WebState::new(
            &self.name,
            ctx.bus.clone(),
            Duration::from_secs(self.config.response_timeout_secs),
        );

        let name = self.name.clone();
        let mut responses = ctx.bus.subscribe(format!("input:{name}"), move |e: &Envelope| {
            e.kind == EnvelopeKind::OutboundText && e.target.as_deref() == Some(name.as_str())
        })?;

        let collector = {
            let state = state.clone();
            let shutdown = ctx.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        envelope = responses.recv() => match envelope {
                            Some(envelope) => {
                                state.resolve(envelope);
                            }
                            None => break,
                        },
                    }
                }
            })
        };

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::construction(&self.name, format!("failed to bind {addr}: {e}")))?;
        tracing::info!(input = %self.name, %addr, "web input listening");

        let served = axum::serve(listener, router(state))
            .with_graceful_shutdown(ctx.shutdown.clone().cancelled_owned())
            .await;

        collector.abort();
        served.map_err(|e| Error::Bus(format!("web input {} failed: {e}", self.name)))
    }
}

/// Builds [`WebInput`]s
#[derive(Debug, Default)]
pub struct WebInputFactory;

impl InputFactory for WebInputFactory {
    fn validate_config(&self, config: &ModuleConfig) -> Result<()> {
        config.parse::<WebConfig>().map(|_| ())
    }

    fn build(&self, name: &str, config: &ModuleConfig) -> Result<Box<dyn InputModule>> {
        Ok(Box::new(WebInput::new(name, config.parse()?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(message: &str) -> Json<MessageRequest> {
        Json(MessageRequest {
            message: message.to_string(),
        })
    }

    #[tokio::test]
    async fn test_empty_message_rejected() {
        let bus = MessageBus::new(8).unwrap();
        let state = WebState::new("web", bus, Duration::from_secs(1));
        let (status, _) = send_message(State(state), request("   ")).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_message_answered_by_correlated_response() {
        let bus = MessageBus::new(8).unwrap();
        let state = WebState::new("web", bus.clone(), Duration::from_secs(5));
        let mut inbound = bus
            .subscribe("fake-engine", |e: &Envelope| e.kind == EnvelopeKind::InboundText)
            .unwrap();

        let responder = {
            let state = state.clone();
            tokio::spawn(async move {
                let envelope = inbound.recv().await.unwrap();
                let response = Envelope::response("engine", &envelope, "pong", Vec::new());
                assert!(state.resolve(Arc::new(response)));
            })
        };

        let Json(body) = send_message(State(state), request("ping")).await.unwrap();
        assert_eq!(body.response, "pong");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out_without_response() {
        let bus = MessageBus::new(8).unwrap();
        let state = WebState::new("web", bus, Duration::from_millis(50));
        let (status, _) = send_message(State(state.clone()), request("hello"))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(state.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnected_client_leaves_nothing_pending() {
        let bus = MessageBus::new(8).unwrap();
        let state = WebState::new("web", bus, Duration::from_secs(30));
        let handler = tokio::spawn(send_message(State(state.clone()), request("hello")));

        for _ in 0..100 {
            if state.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(state.pending_count(), 1);

        // What axum does when the client goes away
        handler.abort();
        assert!(handler.await.unwrap_err().is_cancelled());
        assert_eq!(state.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_uncorrelated_response_ignored() {
        let bus = MessageBus::new(8).unwrap();
        let state = WebState::new("web", bus, Duration::from_secs(1));
        let stray = Envelope::inbound("web", "x");
        assert!(!state.resolve(Arc::new(stray)));
    }
}
