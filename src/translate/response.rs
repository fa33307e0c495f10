use serde_json::Value;

use super::anthropic_types::{MessagesResponse, ResponseContentBlock, StopReason, Usage};
use super::openai_types::{ChatCompletionResponse, ChatUsage};
use super::{Diagnostic, DiagnosticKind, Translated};
use crate::error::{ProxyError, Result};

/// Translate an `OpenAI` Chat Completion response into an Anthropic Messages response.
/// Pure function: `requested_model` is what the client originally asked for.
pub fn openai_to_anthropic(
    resp: &ChatCompletionResponse,
    requested_model: &str,
) -> Result<Translated<MessagesResponse>> {
    if resp.choices.is_empty() {
        return Err(ProxyError::translation(format!(
            "upstream response '{}' contained no choices",
            resp.id
        )));
    }

    let mut diagnostics = Vec::new();
    let mut choices: Vec<_> = resp.choices.iter().collect();
    choices.sort_by_key(|c| c.index);

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    for choice in &choices {
        if let Some(ref text) = choice.message.content {
            if !text.is_empty() {
                content.push(ResponseContentBlock::Text { text: text.clone() });
            }
        }

        if let Some(ref tool_calls) = choice.message.tool_calls {
            for tc in tool_calls {
                let id = if tc.id.is_empty() {
                    let id = synthesize_tool_id();
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::IgnoredFragment,
                        format!("tool call '{}' had no id; assigned '{id}'", tc.function.name),
                    ));
                    id
                } else {
                    tc.id.clone()
                };
                if tc.function.name.is_empty() {
                    diagnostics.push(Diagnostic::new(
                        DiagnosticKind::DroppedContent,
                        format!("tool call '{id}' has no function name"),
                    ));
                }
                let input = parse_tool_arguments(&id, &tc.function.arguments, &mut diagnostics);
                content.push(ResponseContentBlock::ToolUse {
                    id,
                    name: tc.function.name.clone(),
                    input,
                });
            }
        }
    }

    // Clients expect non-empty content
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let stop_reason = choices
        .iter()
        .find_map(|c| c.finish_reason.as_deref())
        .map_or(StopReason::EndTurn, |r| stop_reason_for(r, &mut diagnostics));

    let message = MessagesResponse {
        id: message_id(&resp.id),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content,
        model: requested_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: resp.usage.as_ref().map_or_else(Usage::default, map_usage),
    };

    Ok(Translated::new(message, diagnostics))
}

/// Map `OpenAI` `finish_reason` to Anthropic `stop_reason`. `None` for reasons we do not know.
pub fn map_finish_reason(reason: &str) -> Option<StopReason> {
    match reason {
        "stop" => Some(StopReason::EndTurn),
        "length" => Some(StopReason::MaxTokens),
        "tool_calls" | "function_call" => Some(StopReason::ToolUse),
        "content_filter" => Some(StopReason::EndTurn),
        _ => None,
    }
}

/// Like [`map_finish_reason`] but falls back to `end_turn` and records the unknown reason.
pub(crate) fn stop_reason_for(reason: &str, diagnostics: &mut Vec<Diagnostic>) -> StopReason {
    map_finish_reason(reason).unwrap_or_else(|| {
        diagnostics.push(Diagnostic::new(
            DiagnosticKind::UnknownFinishReason,
            format!("unknown finish_reason '{reason}' mapped to end_turn"),
        ));
        StopReason::EndTurn
    })
}

/// Id for a tool call the routing service sent without one.
pub(crate) fn synthesize_tool_id() -> String {
    format!("toolu_{}", uuid::Uuid::new_v4().simple())
}

/// Parse accumulated tool arguments. Empty means no arguments; garbage degrades to `{}`.
pub(crate) fn parse_tool_arguments(
    tool_id: &str,
    raw: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }

    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::MalformedToolArguments,
                format!("arguments for tool call '{tool_id}' are not valid JSON ({e}); using {{}}"),
            ));
            Value::Object(serde_json::Map::new())
        }
    }
}

pub(crate) fn map_usage(u: &ChatUsage) -> Usage {
    Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        cache_creation_input_tokens: None,
        cache_read_input_tokens: u
            .prompt_tokens_details
            .as_ref()
            .and_then(|d| d.cached_tokens),
    }
}

/// Use the upstream ID, prefixed to look like an Anthropic ID.
pub(crate) fn message_id(upstream_id: &str) -> String {
    let id = upstream_id.trim_start_matches("chatcmpl-");
    if id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        format!("msg_{id}")
    }
}
