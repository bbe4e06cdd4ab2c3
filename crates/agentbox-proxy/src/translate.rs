//! Request and response translation between the two wire formats.

use crate::anthropic::{
    self, ContentBlock, MessageContent, MessagesRequest, MessagesResponse, StopReason, ToolChoice,
    Usage,
};
use crate::openai::{
    ChatMessage, ChatRequest, ChatResponse, ChatTool, FunctionCall, FunctionDefinition,
    StreamOptions, ToolCall,
};
use serde_json::{json, Value};

/// Translate an Anthropic request into a chat-completions request.
///
/// `model_override` replaces the client's model name when set.
pub fn translate_request(request: &MessagesRequest, model_override: Option<&str>) -> ChatRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let text = system.text();
        if !text.is_empty() {
            messages.push(ChatMessage::new("system", text));
        }
    }

    for message in &request.messages {
        let role = message.role.as_str();
        let blocks = match &message.content {
            MessageContent::Text(text) => {
                messages.push(ChatMessage::new(role, text.clone()));
                continue;
            }
            MessageContent::Blocks(blocks) => blocks,
        };

        let text = anthropic::join_text(blocks);
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id: id.clone(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: input.to_string(),
                    },
                }),
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => tool_results.push(ChatMessage::tool(
                    tool_use_id.clone(),
                    content.as_ref().map(|c| c.text()).unwrap_or_default(),
                )),
                _ => {}
            }
        }

        if !tool_results.is_empty() {
            messages.extend(tool_results);
        } else if !tool_calls.is_empty() {
            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: (!text.is_empty()).then_some(text),
                tool_calls,
                tool_call_id: None,
            });
        } else {
            messages.push(ChatMessage::new(role, text));
        }
    }

    let tools = request
        .tools
        .iter()
        .map(|tool| ChatTool {
            kind: "function".to_string(),
            function: FunctionDefinition {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.input_schema.clone(),
            },
        })
        .collect();

    let stream = request.is_streaming();
    ChatRequest {
        model: model_override.unwrap_or(&request.model).to_string(),
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences.clone(),
        tools,
        tool_choice: request.tool_choice.as_ref().map(translate_tool_choice),
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    }
}

fn translate_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::Any => json!("required"),
        ToolChoice::None => json!("none"),
        ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
    }
}

/// Map an OpenAI `finish_reason` to an Anthropic stop reason.
pub fn stop_reason(finish_reason: Option<&str>) -> StopReason {
    match finish_reason {
        Some("tool_calls") | Some("function_call") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

/// Parse tool-call arguments, keeping unparseable input as `{"raw": ...}`.
pub fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| json!({ "raw": arguments }))
}

/// Translate a chat-completions response into an Anthropic message.
///
/// Only the first choice is used. The result always has at least one
/// content block.
pub fn translate_response(response: ChatResponse, model: &str) -> MessagesResponse {
    let id = if response.id.is_empty() {
        anthropic::message_id()
    } else {
        format!("msg_{}", response.id)
    };
    let mut message = MessagesResponse::new(id, model);

    let mut finish_reason = None;
    if let Some(choice) = response.choices.into_iter().next() {
        finish_reason = choice.finish_reason;
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            message.content.push(ContentBlock::Text { text });
        }
        for call in choice.message.tool_calls.unwrap_or_default() {
            message.content.push(ContentBlock::ToolUse {
                id: call.id,
                name: call.function.name,
                input: parse_arguments(&call.function.arguments),
            });
        }
    }

    if message.content.is_empty() {
        message.content.push(ContentBlock::Text {
            text: String::new(),
        });
    }
    message.stop_reason = Some(stop_reason(finish_reason.as_deref()));
    if let Some(usage) = response.usage {
        message.usage = Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        };
    }
    message
}
