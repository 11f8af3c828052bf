use bytes::Bytes;
use serde_json::{Value, json};

use mrelay_protocol::claude::{
    ContentBlock, Message, MessagesRequest, MessagesResponse, MessagesUsage, StreamEvent,
};
use mrelay_protocol::openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Usage,
};
use mrelay_protocol::sse::{done_frame, named_frame};

/// Anthropic dialect -> canonical chat. The relay's internal pivot is the
/// OpenAI shape; `/v1/messages` traffic is normalized here on the way in and
/// restored by `chat_response_to_claude` / `ClaudeStreamAdapter` on the way
/// out, which is also how non-Anthropic channels serve Anthropic clients.
pub fn claude_request_to_chat(request: &MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system_text() {
        messages.push(ChatMessage::text("system", system));
    }
    for message in &request.messages {
        messages.push(claude_message_to_chat(message));
    }

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream,
        stream_options: None,
        max_tokens: Some(request.max_tokens),
        max_completion_tokens: None,
        tools: request.tools.clone().map(claude_tools_to_openai),
        tool_choice: request.tool_choice.clone(),
        extra: request.extra.clone(),
    }
}

fn claude_message_to_chat(message: &Message) -> ChatMessage {
    // Tool blocks keep their structure; plain text flattens.
    match &message.content {
        Value::Array(blocks)
            if blocks
                .iter()
                .any(|block| block.get("type").and_then(Value::as_str) != Some("text")) =>
        {
            ChatMessage {
                role: message.role.clone(),
                content: message.content.clone(),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            }
        }
        _ => ChatMessage::text(&message.role, message.content_text()),
    }
}

fn claude_tools_to_openai(tools: Value) -> Value {
    let Value::Array(tools) = tools else {
        return tools;
    };
    Value::Array(
        tools
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned().unwrap_or(Value::Null),
                    }
                })
            })
            .collect(),
    )
}

pub fn chat_response_to_claude(response: &ChatCompletionResponse) -> MessagesResponse {
    let choice = response.choices.first();
    let text = choice
        .map(|c| c.message.content_text())
        .unwrap_or_default();
    let stop_reason = choice
        .and_then(|c| c.finish_reason.as_deref())
        .map(finish_reason_to_stop_reason)
        .map(str::to_string);
    let usage = response
        .usage
        .as_ref()
        .map(|usage| MessagesUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
        .unwrap_or_default();

    MessagesResponse {
        id: format!("msg_{}", response.id.trim_start_matches("chatcmpl-")),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model.clone(),
        content: vec![ContentBlock::Text { text }],
        stop_reason,
        stop_sequence: None,
        usage,
    }
}

fn finish_reason_to_stop_reason(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" => "tool_use",
        _ => "end_turn",
    }
}

pub fn stop_reason_to_finish_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Replays a canonical chunk stream as Anthropic named events.
///
/// Emits `message_start` / `content_block_start` lazily on the first delta so
/// an upstream error before any content still produces a well-formed error
/// stream for the client.
#[derive(Debug, Default)]
pub struct ClaudeStreamAdapter {
    started: bool,
    block_open: bool,
    usage: Usage,
    finish_reason: Option<String>,
}

impl ClaudeStreamAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_canonical_data(&mut self, data: &str) -> Vec<Bytes> {
        if data.trim() == "[DONE]" {
            return self.finish();
        }
        let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            let start = StreamEvent::MessageStart {
                message: json!({
                    "id": format!("msg_{}", chunk.id.trim_start_matches("chatcmpl-")),
                    "type": "message",
                    "role": "assistant",
                    "model": chunk.model,
                    "content": [],
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                }),
            };
            out.push(frame(&start));
        }
        if let Some(usage) = &chunk.usage {
            self.usage = usage.clone();
        }

        for choice in &chunk.choices {
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
            let Some(text) = &choice.delta.content else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            if !self.block_open {
                self.block_open = true;
                out.push(frame(&StreamEvent::ContentBlockStart {
                    index: 0,
                    content_block: json!({"type": "text", "text": ""}),
                }));
            }
            out.push(frame(&StreamEvent::ContentBlockDelta {
                index: 0,
                delta: json!({"type": "text_delta", "text": text}),
            }));
        }
        out
    }

    pub fn finish(&mut self) -> Vec<Bytes> {
        if !self.started {
            return Vec::new();
        }
        self.started = false;

        let mut out = Vec::new();
        if self.block_open {
            self.block_open = false;
            out.push(frame(&StreamEvent::ContentBlockStop { index: 0 }));
        }
        let stop_reason = self
            .finish_reason
            .as_deref()
            .map(finish_reason_to_stop_reason)
            .unwrap_or("end_turn");
        out.push(frame(&StreamEvent::MessageDelta {
            delta: json!({"stop_reason": stop_reason, "stop_sequence": null}),
            usage: Some(MessagesUsage {
                input_tokens: self.usage.prompt_tokens,
                output_tokens: self.usage.completion_tokens,
            }),
        }));
        out.push(frame(&StreamEvent::MessageStop));
        out
    }
}

fn frame(event: &StreamEvent) -> Bytes {
    match serde_json::to_vec(event) {
        Ok(payload) => named_frame(event.event_name(), &payload),
        Err(_) => done_frame(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_request_lifts_system_into_messages() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 128,
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        let chat = claude_request_to_chat(&request);
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.max_tokens, Some(128));
    }

    #[test]
    fn stop_reason_mapping_round_trips_length() {
        assert_eq!(finish_reason_to_stop_reason("length"), "max_tokens");
        assert_eq!(stop_reason_to_finish_reason("max_tokens"), "length");
    }

    #[test]
    fn stream_adapter_emits_ordered_named_events() {
        let mut adapter = ClaudeStreamAdapter::new();
        let chunk = json!({
            "id": "chatcmpl-1",
            "object": "chat.completion.chunk",
            "created": 0,
            "model": "gpt-4o",
            "choices": [{"index": 0, "delta": {"content": "hey"}, "finish_reason": null}],
        });
        let frames = adapter.on_canonical_data(&chunk.to_string());
        let joined: Vec<String> = frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).to_string())
            .collect();
        assert!(joined[0].starts_with("event: message_start"));
        assert!(joined[1].starts_with("event: content_block_start"));
        assert!(joined[2].starts_with("event: content_block_delta"));

        let tail = adapter.on_canonical_data("[DONE]");
        let tail: Vec<String> = tail
            .iter()
            .map(|frame| String::from_utf8_lossy(frame).to_string())
            .collect();
        assert!(tail[0].starts_with("event: content_block_stop"));
        assert!(tail.last().unwrap().starts_with("event: message_stop"));
    }
}
