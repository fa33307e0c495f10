//! Map internal errors and routing-service error payloads to Anthropic error envelopes.
//!
//! Never fails: shapes we do not recognise degrade to `api_error`.

use serde::Serialize;
use serde_json::Value;

use super::anthropic_types::ErrorResponse;
use super::openai_types::ChatErrorResponse;
use crate::error::ProxyError;

/// Longest raw upstream body quoted back to the client.
const MAX_RAW_MESSAGE_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Upstream,
    UpstreamUnavailable,
    Internal,
}

/// A client-facing error: taxonomy kind, HTTP status and Anthropic envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub status: u16,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(kind: ErrorKind, status: u16, body: ErrorResponse) -> Self {
        Self { kind, status, body }
    }

    pub fn error_type(&self) -> &str {
        &self.body.error.error_type
    }

    pub fn message(&self) -> &str {
        &self.body.error.message
    }
}

pub fn map_error(err: &ProxyError) -> ApiError {
    match err {
        ProxyError::Validation { message } => ApiError::new(
            ErrorKind::Validation,
            400,
            ErrorResponse::invalid_request(message.clone()),
        ),
        ProxyError::Upstream { status, body } => map_upstream_payload(*status, body),
        ProxyError::UpstreamUnavailable { message, timed_out } => {
            unavailable(message, *timed_out)
        }
        ProxyError::Http(e) => unavailable(&e.to_string(), e.is_timeout()),
        // Streaming degrades per block; reaching here means no response could be built.
        ProxyError::Translation { message } => ApiError::new(
            ErrorKind::Internal,
            500,
            ErrorResponse::api_error(message.clone()),
        ),
        other => ApiError::new(
            ErrorKind::Internal,
            500,
            ErrorResponse::api_error(other.to_string()),
        ),
    }
}

/// Map a non-2xx routing-service response (status plus raw body) to an Anthropic error.
pub fn map_upstream_payload(status: u16, body: &str) -> ApiError {
    let (message, type_hint) = extract_upstream_error(body);

    let error_type = type_hint
        .as_deref()
        .and_then(classify_by_type)
        .unwrap_or_else(|| classify_by_status(status));

    let http_status = if (400..600).contains(&status) {
        status
    } else {
        502
    };

    let message = if message.is_empty() {
        format!("upstream returned status {status}")
    } else {
        message
    };

    ApiError::new(
        ErrorKind::Upstream,
        http_status,
        ErrorResponse::new(error_type, message),
    )
}

fn unavailable(message: &str, timed_out: bool) -> ApiError {
    let status = if timed_out { 504 } else { 502 };
    ApiError::new(
        ErrorKind::UpstreamUnavailable,
        status,
        ErrorResponse::api_error(format!("upstream unavailable: {message}")),
    )
}

/// Pull `(message, type-or-code text)` out of whatever the routing service sent.
fn extract_upstream_error(body: &str) -> (String, Option<String>) {
    if let Ok(ChatErrorResponse { error }) = serde_json::from_str::<ChatErrorResponse>(body) {
        let hint = error
            .error_type
            .into_iter()
            .chain(error.code.as_ref().map(value_text))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        let hint = (!hint.is_empty()).then(|| hint.join(" "));
        return (error.message, hint);
    }

    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return (truncate(body.trim()), None);
    };

    match json.get("error") {
        Some(Value::Object(err)) => {
            let message = err.get("message").map(value_text).unwrap_or_default();
            let hint = [err.get("type"), err.get("code")]
                .into_iter()
                .flatten()
                .map(value_text)
                .find(|s| !s.is_empty());
            (message, hint)
        }
        Some(Value::String(message)) => (message.clone(), None),
        _ => {
            let message = json
                .get("detail")
                .or_else(|| json.get("message"))
                .map(value_text)
                .unwrap_or_else(|| truncate(body.trim()));
            (message, None)
        }
    }
}

fn classify_by_type(hint: &str) -> Option<&'static str> {
    let hint = hint.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| hint.contains(n));

    if has(&["auth", "permission", "key"]) {
        Some("authentication_error")
    } else if has(&["rate_limit"]) {
        Some("rate_limit_error")
    } else if has(&["invalid_request", "validation", "bad_request"]) {
        Some("invalid_request_error")
    } else if has(&["not_found"]) {
        Some("not_found_error")
    } else if has(&["overloaded", "capacity", "unavailable"]) {
        Some("overloaded_error")
    } else {
        None
    }
}

fn classify_by_status(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        404 => "not_found_error",
        413 => "request_too_large",
        429 => "rate_limit_error",
        503 | 529 => "overloaded_error",
        _ => "api_error",
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truncate(s: &str) -> String {
    match s.char_indices().nth(MAX_RAW_MESSAGE_CHARS) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
