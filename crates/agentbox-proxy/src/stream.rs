//! Streaming translation: OpenAI chunks in, Anthropic events out.
//!
//! [`StreamTranslator`] is a pure state machine. Every path through it ends
//! with `message_stop`: a `[DONE]` sentinel, an upstream that ends without
//! one, and a translation failure all close open blocks and emit the terminal
//! events.

use crate::anthropic::{
    message_id, BlockDelta, ContentBlock, DeltaUsage, ErrorDetail, MessageDeltaBody,
    MessagesResponse, StopReason, StreamEvent, Usage,
};
use crate::openai::{ChatChunk, ToolCallDelta};
use crate::translate::stop_reason;
use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, trace};

/// One parsed `data:` line of an upstream SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamLine {
    Chunk(ChatChunk),
    Done,
}

/// Parse one SSE line. Blank lines, comments and non-data fields yield `None`.
pub fn parse_line(line: &str) -> Result<Option<UpstreamLine>, serde_json::Error> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(None);
    };
    let data = data.trim_start();
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(UpstreamLine::Done));
    }
    serde_json::from_str(data).map(|chunk| Some(UpstreamLine::Chunk(chunk)))
}

#[derive(Debug, Clone)]
struct ToolBlock {
    index: usize,
    id: String,
    name: String,
}

#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    input_tokens: u32,
    started: bool,
    finished: bool,
    /// Index the next opened block receives.
    next_index: usize,
    /// Open text block. Opening any other block closes it.
    open_text: Option<usize>,
    /// Tool blocks stay open until the message ends, since argument
    /// fragments of earlier calls may arrive after a later call starts.
    open_tools: Vec<usize>,
    /// Upstream tool-call index -> block.
    tools: HashMap<usize, ToolBlock>,
    finish_reason: Option<String>,
    usage: Usage,
}

impl StreamTranslator {
    /// A translator reporting `model` in `message_start`.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: message_id(),
            model: model.into(),
            input_tokens: 0,
            started: false,
            finished: false,
            next_index: 0,
            open_text: None,
            open_tools: Vec::new(),
            tools: HashMap::new(),
            finish_reason: None,
            usage: Usage::default(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn start(&mut self, out: &mut Vec<StreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        let mut message = MessagesResponse::new(self.id.clone(), self.model.clone());
        message.usage.input_tokens = self.input_tokens;
        out.push(StreamEvent::MessageStart { message });
    }

    fn close_text(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(index) = self.open_text.take() {
            out.push(StreamEvent::ContentBlockStop { index });
        }
    }

    /// Close every open block in index order.
    fn close_all(&mut self, out: &mut Vec<StreamEvent>) {
        let mut open: Vec<usize> = self.open_tools.drain(..).collect();
        open.extend(self.open_text.take());
        open.sort_unstable();
        out.extend(open.into_iter().map(|index| StreamEvent::ContentBlockStop { index }));
    }

    fn open_block(&mut self, block: ContentBlock, out: &mut Vec<StreamEvent>) -> usize {
        self.close_text(out);
        let index = self.next_index;
        self.next_index += 1;
        match block {
            ContentBlock::Text { .. } => self.open_text = Some(index),
            _ => self.open_tools.push(index),
        }
        out.push(StreamEvent::ContentBlockStart {
            index,
            content_block: block,
        });
        index
    }

    /// Translate one upstream chunk.
    pub fn on_chunk(&mut self, chunk: ChatChunk) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
            self.input_tokens = usage.prompt_tokens;
        }
        self.start(&mut out);

        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.on_text(text, &mut out);
            }
            for call in choice.delta.tool_calls.unwrap_or_default() {
                self.on_tool_call(call, &mut out);
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        out
    }

    fn on_text(&mut self, text: String, out: &mut Vec<StreamEvent>) {
        let index = match self.open_text {
            Some(index) => index,
            None => {
                if !self.tools.is_empty() {
                    trace!("Text after a tool call opens a new text block");
                }
                self.open_block(
                    ContentBlock::Text {
                        text: String::new(),
                    },
                    out,
                )
            }
        };
        out.push(StreamEvent::ContentBlockDelta {
            index,
            delta: BlockDelta::TextDelta { text },
        });
    }

    fn on_tool_call(&mut self, call: ToolCallDelta, out: &mut Vec<StreamEvent>) {
        let (name, arguments) = match call.function {
            Some(function) => (function.name, function.arguments),
            None => (None, None),
        };

        let index = match self.tools.get(&call.index) {
            Some(block) => block.index,
            None => {
                let id = call
                    .id
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                let name = name.unwrap_or_default();
                debug!(id = %id, name = %name, "Tool call started");
                let index = self.open_block(
                    ContentBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: json!({}),
                    },
                    out,
                );
                self.tools.insert(call.index, ToolBlock { index, id, name });
                index
            }
        };

        if let Some(partial_json) = arguments.filter(|a| !a.is_empty()) {
            out.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::InputJsonDelta { partial_json },
            });
        }
    }

    fn finish(&mut self, stop: StopReason, usage: DeltaUsage, out: &mut Vec<StreamEvent>) {
        self.start(out);
        if self.next_index == 0 {
            self.open_block(
                ContentBlock::Text {
                    text: String::new(),
                },
                out,
            );
        }
        self.close_all(out);
        out.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop),
                stop_sequence: None,
            },
            usage,
        });
        out.push(StreamEvent::MessageStop);
        self.finished = true;
    }

    fn stop_reason(&self) -> StopReason {
        if !self.tools.is_empty() {
            return StopReason::ToolUse;
        }
        match stop_reason(self.finish_reason.as_deref()) {
            StopReason::MaxTokens => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        }
    }

    /// The `[DONE]` sentinel.
    pub fn on_done(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let usage = DeltaUsage {
            output_tokens: self.usage.output_tokens,
        };
        self.finish(self.stop_reason(), usage, &mut out);
        out
    }

    /// The upstream closed without `[DONE]`.
    pub fn on_end(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        debug!(started = self.started, "Upstream stream ended without [DONE]");
        self.finish(self.stop_reason(), DeltaUsage::default(), &mut out);
        out
    }

    /// A failure while reading or translating the upstream stream.
    pub fn on_error(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.start(&mut out);
        out.push(StreamEvent::Error {
            error: ErrorDetail {
                kind: "api_error".to_string(),
                message: message.into(),
            },
        });
        self.finish(self.stop_reason(), DeltaUsage::default(), &mut out);
        out
    }

    /// Tool calls seen so far as `(id, name)` in block order.
    pub fn tool_calls(&self) -> Vec<(String, String)> {
        let mut blocks: Vec<&ToolBlock> = self.tools.values().collect();
        blocks.sort_by_key(|b| b.index);
        blocks
            .into_iter()
            .map(|b| (b.id.clone(), b.name.clone()))
            .collect()
    }
}
