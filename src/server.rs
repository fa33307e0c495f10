use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::journal::SharedJournal;
use crate::proxy;
use crate::translate::anthropic_types::{
    CountTokensRequest, CountTokensResponse, MessagesRequest, StreamEvent,
};
use crate::translate::tokens::estimate_tokens;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info_span, warn, Instrument};

const DEFAULT_DIAGNOSTICS_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub client: reqwest::Client,
    pub journal: SharedJournal,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handle_root))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/health", get(handle_health))
        .route("/v1/models", get(handle_models))
        .route("/v1/diagnostics", get(handle_diagnostics))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_messages(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request_id = proxy::new_request_id();
    let span = info_span!("messages", request_id = %request_id);

    async move {
        let req: MessagesRequest = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Failed to parse request");
                state
                    .journal
                    .warn(&request_id, "server", format!("rejected request body: {e}"));
                return ProxyError::validation(format!("Invalid request body: {e}")).into_response();
            }
        };

        if req.stream.unwrap_or(false) {
            handle_streaming(&state, &req, &request_id).await
        } else {
            handle_non_streaming(&state, &req, &request_id).await
        }
    }
    .instrument(span)
    .await
}

async fn handle_non_streaming(state: &AppState, req: &MessagesRequest, request_id: &str) -> Response {
    match proxy::proxy_non_streaming(req, &state.config, &state.client, &state.journal, request_id)
        .await
    {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => reject(state, request_id, e),
    }
}

async fn handle_streaming(state: &AppState, req: &MessagesRequest, request_id: &str) -> Response {
    let events =
        match proxy::proxy_streaming(req, &state.config, &state.client, &state.journal, request_id)
            .await
        {
            Ok(s) => s,
            // Nothing has been sent yet, so this can still be a plain JSON error.
            Err(e) => return reject(state, request_id, e),
        };

    let sse_stream = events.map(|event| Ok::<_, Infallible>(sse_event(&event)));

    Sse::new(sse_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn reject(state: &AppState, request_id: &str, err: ProxyError) -> Response {
    warn!(error = %err, "Request failed");
    state.journal.error(request_id, "server", err.to_string());
    err.into_response()
}

fn sse_event(event: &StreamEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(json) => Event::default().event(event.event_name()).data(json),
        Err(e) => {
            warn!(error = %e, event = event.event_name(), "Failed to serialize stream event");
            Event::default().event("error").data(
                r#"{"type":"error","error":{"type":"api_error","message":"failed to serialize stream event"}}"#,
            )
        }
    }
}

async fn handle_count_tokens(body: Bytes) -> Response {
    match serde_json::from_slice::<CountTokensRequest>(&body) {
        Ok(req) => Json(CountTokensResponse {
            input_tokens: estimate_tokens(&req),
        })
        .into_response(),
        Err(e) => ProxyError::validation(format!("Invalid request body: {e}")).into_response(),
    }
}

async fn handle_root() -> &'static str {
    concat!(
        "anthropic-facade v",
        env!("CARGO_PKG_VERSION"),
        ": Anthropic Messages API in front of a LiteLLM routing service\n"
    )
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut aliases: Vec<(&String, &String)> = state.config.models.iter().collect();
    aliases.sort();

    let models: Vec<serde_json::Value> = aliases
        .into_iter()
        .map(|(name, routed)| {
            serde_json::json!({
                "id": name,
                "type": "model",
                "display_name": name,
                "routed_to": routed,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "has_more": false }))
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    limit: Option<usize>,
}

async fn handle_diagnostics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiagnosticsQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(DEFAULT_DIAGNOSTICS_LIMIT);
    let entries = state.journal.recent(limit);
    Json(serde_json::json!({ "entries": entries }))
}
