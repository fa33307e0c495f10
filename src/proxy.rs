use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::journal::SharedJournal;
use crate::translate::anthropic_types::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::openai_types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::translate::request::anthropic_to_openai;
use crate::translate::response::openai_to_anthropic;
use crate::translate::streaming::{translate_stream, StreamFragment, StreamTranslator};
use crate::translate::{Diagnostic, DiagnosticKind};

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;
use tracing::{debug, info, warn};

/// Anthropic events for a streaming request, ready to be framed as SSE.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

/// Forward a non-streaming Anthropic request to the routing service.
pub async fn proxy_non_streaming(
    req: &MessagesRequest,
    config: &ProxyConfig,
    client: &reqwest::Client,
    journal: &SharedJournal,
    request_id: &str,
) -> Result<MessagesResponse> {
    let openai_req = translate_request(req, config, journal, request_id)?;

    let response = send_upstream(&openai_req, config, client).await?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(|e| ProxyError::UpstreamUnavailable {
        message: format!("failed to read response body: {e}"),
        timed_out: e.is_timeout(),
    })?;

    debug!(status, body_len = body.len(), "Upstream response");

    let openai_resp: ChatCompletionResponse = match serde_json::from_str(&body) {
        Ok(resp) => resp,
        Err(e) => {
            // Some backends report failures with a 200 and an error body.
            if is_error_payload(&body) {
                return Err(ProxyError::upstream(status, body));
            }
            return Err(ProxyError::translation(format!(
                "failed to parse upstream response: {e}. Body: {}",
                truncate(&body, 300)
            )));
        }
    };

    let translated = openai_to_anthropic(&openai_resp, &req.model)?;
    report(journal, request_id, "response", &translated.diagnostics);

    let resp = translated.value;
    info!(
        input_tokens = resp.usage.input_tokens,
        output_tokens = resp.usage.output_tokens,
        stop_reason = resp.stop_reason.map(|r| r.as_str()),
        "Completed"
    );

    Ok(resp)
}

/// Forward a streaming Anthropic request, returning a stream of Anthropic events.
///
/// Failures before the upstream stream opens are returned as errors; after that,
/// every failure is folded into the event stream.
pub async fn proxy_streaming(
    req: &MessagesRequest,
    config: &ProxyConfig,
    client: &reqwest::Client,
    journal: &SharedJournal,
    request_id: &str,
) -> Result<EventStream> {
    let openai_req = translate_request(req, config, journal, request_id)?;

    let response = send_upstream(&openai_req, config, client).await?;
    let status = response.status().as_u16();

    info!(status, "Upstream stream opened");

    let fragments = upstream_fragments(
        response.bytes_stream(),
        status,
        journal.clone(),
        request_id.to_string(),
    );

    let sink_journal = journal.clone();
    let sink_request_id = request_id.to_string();
    let events = translate_stream(
        fragments,
        StreamTranslator::new(&req.model),
        move |diagnostics| report(&sink_journal, &sink_request_id, "stream", &diagnostics),
    );

    Ok(Box::pin(events))
}

fn translate_request(
    req: &MessagesRequest,
    config: &ProxyConfig,
    journal: &SharedJournal,
    request_id: &str,
) -> Result<ChatCompletionRequest> {
    let translated = anthropic_to_openai(req, config)?;
    report(journal, request_id, "request", &translated.diagnostics);

    info!(
        model = %req.model,
        upstream_model = %translated.value.model,
        messages = translated.value.messages.len(),
        stream = req.stream.unwrap_or(false),
        "Forwarding request"
    );

    Ok(translated.value)
}

/// POST to the routing service. Non-2xx responses become [`ProxyError::Upstream`].
async fn send_upstream(
    body: &ChatCompletionRequest,
    config: &ProxyConfig,
    client: &reqwest::Client,
) -> Result<reqwest::Response> {
    let url = config.chat_completions_url();
    let mut builder = client.post(&url).json(body);
    if let Some(key) = config.resolve_api_key() {
        builder = builder.bearer_auth(key);
    }

    let response = builder.send().await.map_err(|e| {
        warn!(url = %url, error = %e, "Upstream request failed");
        ProxyError::UpstreamUnavailable {
            message: e.to_string(),
            timed_out: e.is_timeout(),
        }
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), body = %truncate(&body, 300), "Upstream returned an error");
        return Err(ProxyError::upstream(status.as_u16(), body));
    }

    Ok(response)
}

/// Parse the upstream SSE byte stream into stream fragments.
fn upstream_fragments(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    status: u16,
    journal: SharedJournal,
    request_id: String,
) -> impl Stream<Item = Result<StreamFragment>> + Send + 'static {
    byte_stream.eventsource().filter_map(move |item| {
        let journal = journal.clone();
        let request_id = request_id.clone();
        async move {
            let event = match item {
                Ok(event) => event,
                Err(EventStreamError::Transport(e)) => {
                    return Some(Err(ProxyError::UpstreamUnavailable {
                        message: format!("upstream stream broke: {e}"),
                        timed_out: e.is_timeout(),
                    }));
                }
                Err(e) => {
                    return Some(Err(ProxyError::unavailable(format!(
                        "malformed upstream event stream: {e}"
                    ))));
                }
            };

            let data = event.data.trim();
            if data.is_empty() {
                return None;
            }
            if data == "[DONE]" {
                return Some(Ok(StreamFragment::Done));
            }

            let value: serde_json::Value = match serde_json::from_str(data) {
                Ok(v) => v,
                Err(e) => {
                    let d = Diagnostic::new(
                        DiagnosticKind::IgnoredFragment,
                        format!("skipped non-JSON stream event: {e}"),
                    );
                    report(&journal, &request_id, "stream", &[d]);
                    return None;
                }
            };

            if value.get("error").is_some() {
                return Some(Err(ProxyError::upstream(status, data)));
            }

            match serde_json::from_value::<ChatCompletionChunk>(value) {
                Ok(chunk) => Some(Ok(StreamFragment::Chunk(chunk))),
                Err(e) => {
                    let d = Diagnostic::new(
                        DiagnosticKind::IgnoredFragment,
                        format!("skipped unparseable chunk: {e}"),
                    );
                    report(&journal, &request_id, "stream", &[d]);
                    None
                }
            }
        }
    })
}

/// Log diagnostics and record them in the journal.
fn report(journal: &SharedJournal, request_id: &str, component: &str, diagnostics: &[Diagnostic]) {
    for d in diagnostics {
        warn!(request_id, component, kind = ?d.kind, "{}", d.message);
    }
    journal.diagnostics(request_id, component, diagnostics);
}

fn is_error_payload(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .is_ok_and(|v| v.get("error").is_some() || v.get("detail").is_some())
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique() {
        let a = new_request_id();
        let b = new_request_id();
        assert!(a.starts_with("req_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 100), "short");
    }

    #[test]
    fn test_error_payload_detection() {
        assert!(is_error_payload(r#"{"error":{"message":"bad"}}"#));
        assert!(is_error_payload(r#"{"detail":"Not Found"}"#));
        assert!(!is_error_payload(r#"{"id":"x"}"#));
        assert!(!is_error_payload("<html>"));
    }

    #[tokio::test]
    async fn test_upstream_fragments_parse_sse() {
        let body = concat!(
            "data: {\"id\":\"chatcmpl-1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n",
            ": keep-alive comment\n\n",
            "data: not json\n\n",
            "data: [DONE]\n\n",
        );
        let bytes = futures::stream::iter(vec![
            Ok::<_, reqwest::Error>(Bytes::from(&body[..40])),
            Ok(Bytes::from(&body[40..])),
        ]);

        let journal = SharedJournal::in_memory();
        let fragments: Vec<Result<StreamFragment>> =
            upstream_fragments(bytes, 200, journal.clone(), "req_t".to_string())
                .collect()
                .await;

        assert_eq!(fragments.len(), 2);
        match &fragments[0] {
            Ok(StreamFragment::Chunk(chunk)) => {
                assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
            }
            other => panic!("Expected chunk, got {other:?}"),
        }
        assert!(matches!(fragments[1], Ok(StreamFragment::Done)));
        assert_eq!(journal.len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_event_becomes_upstream_error() {
        let bytes = futures::stream::iter(vec![Ok::<_, reqwest::Error>(Bytes::from_static(
            b"data: {\"error\":{\"message\":\"quota\",\"type\":\"rate_limit_error\"}}\n\n",
        ))]);

        let fragments: Vec<Result<StreamFragment>> =
            upstream_fragments(bytes, 200, SharedJournal::in_memory(), "req_t".to_string())
                .collect()
                .await;

        assert!(matches!(
            fragments.as_slice(),
            [Err(ProxyError::Upstream { status: 200, .. })]
        ));
    }
}
