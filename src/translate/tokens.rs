//! Rough input-token estimate for `POST /v1/messages/count_tokens`.
//!
//! The routing service has no counting endpoint, so this is a character heuristic
//! (about four characters per token), not a tokenizer.

use super::anthropic_types::{ContentBlock, CountTokensRequest, ToolResultContent};

const CHARS_PER_TOKEN: usize = 4;
const IMAGE_TOKENS: u64 = 85;
const TOOL_DEFINITION_TOKENS: u64 = 20;

pub fn estimate_tokens(req: &CountTokensRequest) -> u64 {
    let mut chars = 0usize;
    let mut fixed = 0u64;

    if let Some(ref system) = req.system {
        chars += system.as_text().len();
    }

    for message in &req.messages {
        for block in message.content.blocks().iter() {
            let (c, f) = block_cost(block);
            chars += c;
            fixed += f;
        }
    }

    for tool in req.tools.iter().flatten() {
        fixed += TOOL_DEFINITION_TOKENS;
        chars += tool.name.len();
        chars += tool.description.as_deref().map_or(0, str::len);
        chars += tool.input_schema.to_string().len();
    }

    let estimate = chars.div_ceil(CHARS_PER_TOKEN) as u64 + fixed;
    if estimate == 0 && !req.messages.is_empty() {
        1
    } else {
        estimate
    }
}

/// `(characters, fixed tokens)` contributed by one block.
fn block_cost(block: &ContentBlock) -> (usize, u64) {
    match block {
        ContentBlock::Text { text } => (text.len(), 0),
        ContentBlock::Image { .. } => (0, IMAGE_TOKENS),
        ContentBlock::ToolUse { name, input, .. } => (name.len() + input.to_string().len(), 0),
        ContentBlock::ToolResult { content, .. } => match content {
            Some(ToolResultContent::Text(t)) => (t.len(), 0),
            Some(ToolResultContent::Blocks(blocks)) => {
                blocks.iter().map(block_cost).fold((0, 0), |(c, f), (bc, bf)| (c + bc, f + bf))
            }
            Some(ToolResultContent::Json(v)) => (v.to_string().len(), 0),
            None => (0, 0),
        },
        ContentBlock::Unsupported => (0, 0),
    }
}
