//! State machine for translating `OpenAI` streaming chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] processes `OpenAI` `ChatCompletionChunk`s one at a time,
//! maintaining state about which content blocks are open, and emitting the
//! corresponding Anthropic stream events (`message_start`, `content_block_delta`, etc.).
//! [`translate_stream`] drives it from a fragment source as a pull-based [`Stream`].
//!
//! Stream lifecycle: `NotStarted -> Open -> Closing -> Closed`. A `finish_reason`
//! finalizes every open block and moves to `Closing`; the closing `message_delta` and
//! `message_stop` wait for `[DONE]` (or the end of the source) so that a trailing
//! usage-only chunk is still reported.

use std::collections::HashMap;

use futures::{Stream, StreamExt};
use serde_json::Value;

use super::anthropic_types::{
    Delta, DeltaUsage, ErrorResponse, MessageDeltaBody, MessagesResponse, ResponseContentBlock,
    StopReason, StreamEvent, Usage,
};
use super::errors::map_error;
use super::openai_types::{ChatCompletionChunk, ChunkChoice, ChunkToolCall};
use super::response::{
    map_usage, message_id, parse_tool_arguments, stop_reason_for, synthesize_tool_id,
};
use super::{Diagnostic, DiagnosticKind};
use crate::error::ProxyError;

/// One item from the upstream event stream.
#[derive(Debug, Clone)]
pub enum StreamFragment {
    Chunk(ChatCompletionChunk),
    /// The `data: [DONE]` sentinel.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    NotStarted,
    Open,
    /// A `finish_reason` was seen; waiting for `[DONE]` or end of source.
    Closing,
    Closed,
}

#[derive(Debug)]
enum BlockContent {
    Text {
        text: String,
    },
    Tool {
        id: String,
        name: String,
        arguments: String,
        input: Option<Value>,
    },
}

#[derive(Debug)]
struct Block {
    content: BlockContent,
    building: bool,
    /// `content_block_start` has been emitted. Tool blocks wait for their name.
    started: bool,
}

/// State machine that translates `OpenAI` streaming chunks into Anthropic SSE events.
///
/// Usage:
///   let mut translator = StreamTranslator::new("claude-sonnet-4-20250514");
///   for chunk in openai_chunks {
///       let events = translator.process_chunk(&chunk);
///       // send each event as SSE
///   }
///   let final_events = translator.finish();
#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    msg_id: String,
    state: StreamState,
    /// Anthropic blocks in index order.
    blocks: Vec<Block>,
    /// Index of the text block currently receiving text, if any.
    text_block: Option<usize>,
    /// Upstream tool-call index -> Anthropic block index.
    tool_blocks: HashMap<u64, usize>,
    /// The only upstream choice we translate.
    choice_index: Option<u64>,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
    diagnostics: Vec<Diagnostic>,
}

impl StreamTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            msg_id: String::new(),
            state: StreamState::NotStarted,
            blocks: Vec::new(),
            text_block: None,
            tool_blocks: HashMap::new(),
            choice_index: None,
            stop_reason: None,
            usage: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Diagnostics recorded since the last call.
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Process a single `OpenAI` streaming chunk, returning zero or more Anthropic SSE events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.is_closed() {
            return events;
        }

        if let Some(ref usage) = chunk.usage {
            self.usage = Some(map_usage(usage));
        }

        if self.state == StreamState::NotStarted {
            self.start(message_id(&chunk.id), &mut events);
        }

        for choice in &chunk.choices {
            let tracked = *self.choice_index.get_or_insert(choice.index);
            if choice.index != tracked {
                if carries_content(choice) {
                    self.record(
                        DiagnosticKind::IgnoredFragment,
                        format!("dropped content for additional choice {}", choice.index),
                    );
                }
                continue;
            }

            if self.state == StreamState::Closing {
                if carries_content(choice) {
                    self.record(
                        DiagnosticKind::IgnoredFragment,
                        "dropped content that arrived after finish_reason",
                    );
                }
                continue;
            }

            if let Some(text) = choice.delta.content.as_deref().filter(|s| !s.is_empty()) {
                self.push_text(text, &mut events);
            }

            if let Some(ref tool_calls) = choice.delta.tool_calls {
                for tc in tool_calls {
                    self.push_tool_fragment(tc, &mut events);
                }
            }

            if let Some(ref reason) = choice.finish_reason {
                let stop_reason = stop_reason_for(reason, &mut self.diagnostics);
                self.stop_reason = Some(stop_reason);
                self.finalize_all(&mut events);
                self.state = StreamState::Closing;
            }
        }

        events
    }

    /// Call on `[DONE]`. Emits the closing `message_delta` and `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.state {
            StreamState::Closed => return events,
            StreamState::NotStarted | StreamState::Open => {
                if self.state == StreamState::NotStarted {
                    self.start(message_id(""), &mut events);
                }
                self.record(
                    DiagnosticKind::UnknownFinishReason,
                    "stream ended with [DONE] but no finish_reason; using end_turn",
                );
                self.stop_reason = Some(StopReason::EndTurn);
                self.finalize_all(&mut events);
            }
            StreamState::Closing => {}
        }

        self.close(&mut events);
        events
    }

    /// Call when the source ended without `[DONE]`.
    pub fn end_of_source(&mut self) -> Vec<StreamEvent> {
        match self.state {
            StreamState::Closed => Vec::new(),
            StreamState::Closing => {
                let mut events = Vec::new();
                self.close(&mut events);
                events
            }
            StreamState::NotStarted | StreamState::Open => self.fail(&ProxyError::unavailable(
                "upstream stream ended before a finish_reason",
            )),
        }
    }

    /// Terminate the message because the source failed. Output already emitted stands.
    pub fn fail(&mut self, err: &ProxyError) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.state {
            StreamState::Closed => return events,
            StreamState::Closing => {
                // Everything but trailing usage is already determined.
                self.record(
                    DiagnosticKind::IgnoredFragment,
                    format!("source failed after finish_reason: {err}"),
                );
                self.close(&mut events);
                return events;
            }
            StreamState::NotStarted => self.start(message_id(""), &mut events),
            StreamState::Open => {}
        }

        self.finalize_all(&mut events);

        let ErrorResponse { error, .. } = map_error(err).body;
        events.push(StreamEvent::Error { error });

        self.stop_reason = Some(StopReason::Error);
        self.close(&mut events);
        events
    }

    /// The message as reconstructed from everything processed so far.
    pub fn message(&self) -> MessagesResponse {
        let mut content: Vec<ResponseContentBlock> = self
            .blocks
            .iter()
            .map(|block| match block.content {
                BlockContent::Text { ref text } => ResponseContentBlock::Text { text: text.clone() },
                BlockContent::Tool {
                    ref id,
                    ref name,
                    ref arguments,
                    ref input,
                } => ResponseContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone().unwrap_or_else(|| {
                        serde_json::from_str(arguments)
                            .unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
                    }),
                },
            })
            .collect();

        if content.is_empty() {
            content.push(ResponseContentBlock::Text {
                text: String::new(),
            });
        }

        MessagesResponse {
            id: self.msg_id.clone(),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: self.model.clone(),
            stop_reason: self.stop_reason,
            stop_sequence: None,
            usage: self.usage.clone().unwrap_or_default(),
        }
    }

    fn start(&mut self, msg_id: String, events: &mut Vec<StreamEvent>) {
        self.msg_id = msg_id;
        let usage = Usage {
            input_tokens: self.usage.as_ref().map_or(0, |u| u.input_tokens),
            ..Usage::default()
        };

        events.push(StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: "assistant".to_string(),
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage,
            },
        });
        events.push(StreamEvent::Ping);
        self.state = StreamState::Open;
    }

    fn push_text(&mut self, fragment: &str, events: &mut Vec<StreamEvent>) {
        let index = match self.text_block {
            Some(index) => index,
            None => {
                self.start_pending(events);
                let index = self.open_block(BlockContent::Text {
                    text: String::new(),
                });
                self.start_block(index, events);
                self.text_block = Some(index);
                index
            }
        };

        if let BlockContent::Text { ref mut text } = self.blocks[index].content {
            text.push_str(fragment);
        }

        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: fragment.to_string(),
            },
        });
    }

    fn push_tool_fragment(&mut self, tc: &ChunkToolCall, events: &mut Vec<StreamEvent>) {
        let fragment_id = tc.id.as_deref().filter(|s| !s.is_empty());
        let fragment_name = tc
            .function
            .as_ref()
            .and_then(|f| f.name.as_deref())
            .filter(|s| !s.is_empty());
        let arguments = tc
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .unwrap_or_default();

        let mut existing = self.tool_blocks.get(&tc.index).copied();

        // A new call id at a known index starts a new invocation; the old block is
        // finalized as-is and never rewritten.
        if let (Some(index), Some(new_id)) = (existing, fragment_id) {
            if let BlockContent::Tool { ref id, .. } = self.blocks[index].content {
                if id != new_id {
                    let message = format!(
                        "tool index {} reused by call '{new_id}' while '{id}' was in progress; opened a new block",
                        tc.index
                    );
                    self.record(DiagnosticKind::IndexReuse, message);
                    self.finalize(index, events);
                    existing = None;
                }
            }
        }

        self.close_text_run(events);

        let index = match existing {
            Some(index) => index,
            None => {
                let id = match fragment_id {
                    Some(id) => id.to_string(),
                    None => {
                        let id = synthesize_tool_id();
                        self.record(
                            DiagnosticKind::IgnoredFragment,
                            format!("tool call at index {} had no id; assigned '{id}'", tc.index),
                        );
                        id
                    }
                };

                self.start_pending(events);
                let index = self.open_block(BlockContent::Tool {
                    id,
                    name: String::new(),
                    arguments: String::new(),
                    input: None,
                });
                self.tool_blocks.insert(tc.index, index);
                index
            }
        };

        let started = self.blocks[index].started;
        if let BlockContent::Tool {
            ref mut name,
            arguments: ref mut acc,
            ..
        } = self.blocks[index].content
        {
            if let Some(fragment_name) = fragment_name {
                if name.is_empty() && !started {
                    *name = fragment_name.to_string();
                }
            }
            acc.push_str(arguments);
        }

        if started {
            if !arguments.is_empty() {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::InputJsonDelta {
                        partial_json: arguments.to_string(),
                    },
                });
            }
        } else if fragment_name.is_some() {
            self.start_block(index, events);
        }
    }

    fn open_block(&mut self, content: BlockContent) -> usize {
        self.blocks.push(Block {
            content,
            building: true,
            started: false,
        });
        self.blocks.len() - 1
    }

    /// Emit `content_block_start` for a block, replaying arguments buffered while its
    /// name was unknown.
    fn start_block(&mut self, index: usize, events: &mut Vec<StreamEvent>) {
        if self.blocks[index].started {
            return;
        }
        self.blocks[index].started = true;

        let (content_block, buffered) = match self.blocks[index].content {
            BlockContent::Text { .. } => (
                ResponseContentBlock::Text {
                    text: String::new(),
                },
                None,
            ),
            BlockContent::Tool {
                ref id,
                ref name,
                ref arguments,
                ..
            } => {
                if name.is_empty() {
                    self.diagnostics.push(Diagnostic::new(
                        DiagnosticKind::DroppedContent,
                        format!("tool call '{id}' never received a function name"),
                    ));
                }
                (
                    ResponseContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: Value::Object(serde_json::Map::new()),
                    },
                    (!arguments.is_empty()).then(|| arguments.clone()),
                )
            }
        };

        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        if let Some(partial_json) = buffered {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta { partial_json },
            });
        }
    }

    /// Start every block still waiting on its name so block indices go out in order.
    fn start_pending(&mut self, events: &mut Vec<StreamEvent>) {
        for index in 0..self.blocks.len() {
            if self.blocks[index].building {
                self.start_block(index, events);
            }
        }
    }

    fn close_text_run(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.text_block.take() {
            self.finalize(index, events);
        }
    }

    /// Finalize every block still building, in opening order.
    fn finalize_all(&mut self, events: &mut Vec<StreamEvent>) {
        self.text_block = None;
        for index in 0..self.blocks.len() {
            self.finalize(index, events);
        }
    }

    fn finalize(&mut self, index: usize, events: &mut Vec<StreamEvent>) {
        if !self.blocks[index].building {
            return;
        }
        self.start_block(index, events);

        let block = &mut self.blocks[index];
        block.building = false;

        if let BlockContent::Tool {
            ref id,
            ref arguments,
            ref mut input,
            ..
        } = block.content
        {
            *input = Some(parse_tool_arguments(id, arguments, &mut self.diagnostics));
        }

        events.push(StreamEvent::ContentBlockStop { index });
    }

    fn close(&mut self, events: &mut Vec<StreamEvent>) {
        let usage = self.usage.as_ref();
        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: self.stop_reason,
                stop_sequence: None,
            },
            usage: DeltaUsage {
                input_tokens: usage.map(|u| u.input_tokens),
                output_tokens: usage.map_or(0, |u| u.output_tokens),
            },
        });
        events.push(StreamEvent::MessageStop);
        self.state = StreamState::Closed;
    }

    fn record(&mut self, kind: DiagnosticKind, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(kind, message));
    }
}

fn carries_content(choice: &ChunkChoice) -> bool {
    choice.delta.content.as_deref().is_some_and(|s| !s.is_empty())
        || choice
            .delta
            .tool_calls
            .as_ref()
            .is_some_and(|tcs| !tcs.is_empty())
}

/// Drive `translator` from `fragments`, yielding Anthropic events as the consumer pulls.
///
/// Diagnostics are handed to `on_diagnostics` as they are recorded. The returned stream
/// always ends with `message_stop`, whatever the source does. Dropping it drops the source.
pub fn translate_stream<S, F>(
    fragments: S,
    mut translator: StreamTranslator,
    mut on_diagnostics: F,
) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<StreamFragment, ProxyError>> + Send + 'static,
    F: FnMut(Vec<Diagnostic>) + Send + 'static,
{
    async_stream::stream! {
        tokio::pin!(fragments);

        while let Some(item) = fragments.next().await {
            let events = match item {
                Ok(StreamFragment::Chunk(chunk)) => translator.process_chunk(&chunk),
                Ok(StreamFragment::Done) => translator.finish(),
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream stream failed");
                    translator.fail(&e)
                }
            };

            let diagnostics = translator.take_diagnostics();
            if !diagnostics.is_empty() {
                on_diagnostics(diagnostics);
            }

            for event in events {
                yield event;
            }

            if translator.is_closed() {
                break;
            }
        }

        // Ensure stream is properly closed even if [DONE] was missing
        let events = translator.end_of_source();
        let diagnostics = translator.take_diagnostics();
        if !diagnostics.is_empty() {
            on_diagnostics(diagnostics);
        }
        for event in events {
            yield event;
        }
    }
}
