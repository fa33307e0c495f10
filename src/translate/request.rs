//! Translate Anthropic Messages API requests into `OpenAI` Chat Completions requests.
//!
//! Handles system messages, multi-part content (text, images), tool use, tool results,
//! and tool choice mapping. A single Anthropic message can expand into multiple `OpenAI`
//! messages (e.g. a user message with `tool_result` blocks becomes separate `tool`-role messages).

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessagesRequest, Role, Tool, ToolChoice,
    ToolResultContent,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatMessage, ChatRole, ChatTool,
    ChatToolCall, ChatToolCallFunction, ChatToolChoice, ChatToolChoiceFunction,
    ChatToolChoiceSpecific, ContentPart, ImageUrlDetail, StreamOptions,
};
use super::schema::sanitize_schema;
use super::{Diagnostic, DiagnosticKind, Translated};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// Translate an Anthropic Messages API request into an `OpenAI` Chat Completions request.
///
/// Pure function of the request and the configuration. Fails only with
/// [`ProxyError::Validation`], before anything is sent downstream.
pub fn anthropic_to_openai(
    req: &MessagesRequest,
    config: &ProxyConfig,
) -> Result<Translated<ChatCompletionRequest>> {
    let mut diagnostics = Vec::new();
    let declared: &[Tool] = req.tools.as_deref().unwrap_or_default();

    let tools = translate_tools(req.tools.as_deref(), config.translation.sanitize_tool_schemas)?;
    let (tool_choice, parallel_tool_calls) = match req.tool_choice {
        Some(ref choice) => translate_tool_choice(choice, declared, &mut diagnostics)?,
        None => (None, None),
    };

    let mut messages = Vec::new();

    if let Some(ref system) = req.system {
        let text = system.as_text();
        let text = text.trim();
        if !text.is_empty() {
            messages.push(text_message(ChatRole::System, text));
        }
    }

    for msg in &req.messages {
        messages.extend(translate_message(msg, &mut diagnostics));
    }

    report_dropped_parameters(req, &mut diagnostics);

    let stream_options = req.stream.filter(|s| *s).map(|_| StreamOptions {
        include_usage: true,
    });

    let user = req.metadata.as_ref().and_then(|m| m.user_id.clone());

    let translated = ChatCompletionRequest {
        model: config.map_model(&req.model),
        messages,
        max_tokens: Some(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stream_options,
        tools,
        tool_choice,
        parallel_tool_calls,
        stop: req.stop_sequences.clone(),
        user,
    };

    Ok(Translated::new(translated, diagnostics))
}

/// A single Anthropic message can expand to multiple `OpenAI` messages
/// (e.g. a user message with `tool_results` becomes separate tool-role messages).
fn translate_message(msg: &Message, diagnostics: &mut Vec<Diagnostic>) -> Vec<ChatMessage> {
    let blocks = msg.content.blocks();

    match msg.role {
        Role::User => translate_user_message(&blocks, diagnostics),
        Role::Assistant => translate_assistant_message(&blocks, diagnostics),
    }
}

fn translate_user_message(
    blocks: &[ContentBlock],
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    let mut content_parts: Vec<ContentPart> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                content_parts.push(ContentPart::Text { text: text.clone() });
            }
            ContentBlock::Image { source } => {
                content_parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: image_url(source),
                        detail: None,
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                // Flush preceding parts so relative order survives the split.
                if !content_parts.is_empty() {
                    messages.push(user_message(&content_parts));
                    content_parts.clear();
                }

                let result_text =
                    tool_result_to_string(tool_use_id, content.as_ref(), *is_error, diagnostics);

                messages.push(ChatMessage {
                    role: ChatRole::Tool,
                    content: Some(ChatContent::Text(result_text)),
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id.clone()),
                });
            }
            ContentBlock::ToolUse { id, .. } => diagnostics.push(Diagnostic::new(
                DiagnosticKind::DroppedContent,
                format!("tool_use block '{id}' in a user message was dropped"),
            )),
            ContentBlock::Unsupported => diagnostics.push(unsupported_block("user")),
        }
    }

    if !content_parts.is_empty() {
        messages.push(user_message(&content_parts));
    }

    if messages.is_empty() {
        messages.push(text_message(ChatRole::User, ""));
    }

    messages
}

fn translate_assistant_message(
    blocks: &[ContentBlock],
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<ChatMessage> {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                });
            }
            ContentBlock::ToolResult { tool_use_id, .. } => diagnostics.push(Diagnostic::new(
                DiagnosticKind::DroppedContent,
                format!("tool_result for '{tool_use_id}' in an assistant message was dropped"),
            )),
            ContentBlock::Image { .. } => diagnostics.push(Diagnostic::new(
                DiagnosticKind::DroppedContent,
                "image block in an assistant message was dropped",
            )),
            ContentBlock::Unsupported => diagnostics.push(unsupported_block("assistant")),
        }
    }

    let content = if text_parts.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(ChatContent::Text(text_parts.concat()))
    };

    vec![ChatMessage {
        role: ChatRole::Assistant,
        content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
    }]
}

fn translate_tools(tools: Option<&[Tool]>, sanitize: bool) -> Result<Option<Vec<ChatTool>>> {
    let Some(tools) = tools else {
        return Ok(None);
    };

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(tools.len());

    for tool in tools {
        if !seen.insert(tool.name.as_str()) {
            return Err(ProxyError::validation(format!(
                "tool '{}' is declared more than once",
                tool.name
            )));
        }

        let parameters = if sanitize {
            sanitize_schema(&tool.input_schema)
        } else {
            tool.input_schema.clone()
        };

        out.push(ChatTool {
            tool_type: "function".to_string(),
            function: ChatFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters,
            },
        });
    }

    Ok(Some(out))
}

fn translate_tool_choice(
    choice: &ToolChoice,
    tools: &[Tool],
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<(Option<ChatToolChoice>, Option<bool>)> {
    let (translated, disable_parallel) = match choice {
        ToolChoice::Auto {
            disable_parallel_tool_use,
        } => (mode("auto"), *disable_parallel_tool_use),
        ToolChoice::Any {
            disable_parallel_tool_use,
        } => {
            if tools.is_empty() {
                return Err(ProxyError::validation(
                    "tool_choice 'any' requires at least one declared tool",
                ));
            }
            (mode("required"), *disable_parallel_tool_use)
        }
        ToolChoice::Tool {
            name,
            disable_parallel_tool_use,
        } => {
            if !tools.iter().any(|t| &t.name == name) {
                return Err(ProxyError::validation(format!(
                    "tool_choice names tool '{name}', which is not among the declared tools"
                )));
            }
            let specific = ChatToolChoice::Specific(ChatToolChoiceSpecific {
                choice_type: "function".to_string(),
                function: ChatToolChoiceFunction { name: name.clone() },
            });
            (specific, *disable_parallel_tool_use)
        }
        ToolChoice::None => (mode("none"), None),
    };

    // Downstream rejects tool_choice without tools.
    if tools.is_empty() {
        diagnostics.push(Diagnostic::dropped_parameter("tool_choice"));
        return Ok((None, None));
    }

    let parallel_tool_calls = (disable_parallel == Some(true)).then_some(false);
    Ok((Some(translated), parallel_tool_calls))
}

fn report_dropped_parameters(req: &MessagesRequest, diagnostics: &mut Vec<Diagnostic>) {
    if req.top_k.is_some() {
        diagnostics.push(Diagnostic::dropped_parameter("top_k"));
    }
    if req.thinking.is_some() {
        diagnostics.push(Diagnostic::dropped_parameter("thinking"));
    }
    if let Some(ref metadata) = req.metadata {
        for key in metadata.extra.keys() {
            diagnostics.push(Diagnostic::dropped_parameter(&format!("metadata.{key}")));
        }
    }
    for key in req.extra.keys() {
        diagnostics.push(Diagnostic::dropped_parameter(key));
    }
}

fn tool_result_to_string(
    tool_use_id: &str,
    content: Option<&ToolResultContent>,
    is_error: Option<bool>,
    diagnostics: &mut Vec<Diagnostic>,
) -> String {
    let prefix = if is_error == Some(true) { "ERROR: " } else { "" };

    match content {
        Some(ToolResultContent::Text(t)) => format!("{prefix}{t}"),
        Some(ToolResultContent::Blocks(blocks)) => {
            let mut texts = Vec::new();
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => texts.push(text.as_str()),
                    _ => diagnostics.push(Diagnostic::new(
                        DiagnosticKind::DroppedContent,
                        format!("non-text block inside tool_result for '{tool_use_id}' was dropped"),
                    )),
                }
            }
            format!("{prefix}{}", texts.join("\n"))
        }
        Some(ToolResultContent::Json(value)) => format!("{prefix}{value}"),
        None => format!("{prefix}(no content)"),
    }
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url.clone(),
    }
}

fn user_message(parts: &[ContentPart]) -> ChatMessage {
    let content = match parts {
        [ContentPart::Text { text }] => ChatContent::Text(text.clone()),
        _ => ChatContent::Parts(parts.to_vec()),
    };
    ChatMessage {
        role: ChatRole::User,
        content: Some(content),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn text_message(role: ChatRole, text: &str) -> ChatMessage {
    ChatMessage {
        role,
        content: Some(ChatContent::Text(text.to_string())),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn mode(value: &str) -> ChatToolChoice {
    ChatToolChoice::Mode(value.to_string())
}

fn unsupported_block(role: &str) -> Diagnostic {
    Diagnostic::new(
        DiagnosticKind::DroppedContent,
        format!("unsupported content block in a {role} message was dropped"),
    )
}
