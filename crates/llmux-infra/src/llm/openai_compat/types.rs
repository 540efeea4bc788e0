//! Wire types for the OpenAI chat completions protocol, and their mapping
//! to and from the canonical llmux types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use llmux_types::llm::{
    ChatMessage, ChatRequest, ChatResponse, Choice, ChunkChoice, ChunkDelta, FinishReason,
    FunctionCall, MessageRole, ModelInfo, StreamChunk, ToolCall, ToolCallDelta, Usage,
};

#[derive(Debug, Serialize)]
pub struct WireRequest {
    pub model: String,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<WireTool>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Serialize)]
pub struct WireMessage {
    pub role: MessageRole,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: WireFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Serialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: WireFunctionDef,
}

#[derive(Debug, Serialize)]
pub struct WireFunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Deserialize)]
pub struct WireResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub choices: Vec<WireChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct WireChoice {
    #[serde(default)]
    pub index: u32,
    pub message: WireResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct WireChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<WireChunkChoice>,
    #[serde(default)]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct WireChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: WireDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
pub struct WireToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
pub struct WireFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireModelList {
    #[serde(default)]
    pub data: Vec<WireModel>,
}

#[derive(Debug, Deserialize)]
pub struct WireModel {
    pub id: String,
    #[serde(default)]
    pub owned_by: Option<String>,
}

/// `{"error": {"message": ..., "type": ...}}` as returned on non-2xx
/// responses and, by some servers, inside an SSE event.
#[derive(Debug, Deserialize)]
pub struct WireErrorBody {
    pub error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct WireErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// Build the wire request. An empty `request.model` falls back to `default_model`.
pub fn to_wire_request(request: &ChatRequest, default_model: &str, stream: bool) -> WireRequest {
    let model = if request.model.is_empty() {
        default_model.to_string()
    } else {
        request.model.clone()
    };

    WireRequest {
        model,
        messages: request.messages.iter().map(to_wire_message).collect(),
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_tokens,
        stop: request.stop.clone().filter(|stops| !stops.is_empty()),
        seed: request.seed,
        tools: request
            .tools
            .iter()
            .map(|tool| WireTool {
                kind: "function",
                function: WireFunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect(),
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    }
}

fn to_wire_message(message: &ChatMessage) -> WireMessage {
    // Assistant turns that only carry tool calls are sent with null content.
    let content = if message.role == MessageRole::Assistant
        && message.content.is_empty()
        && !message.tool_calls.is_empty()
    {
        None
    } else {
        Some(message.content.clone())
    };

    WireMessage {
        role: message.role,
        content,
        name: message.name.clone(),
        tool_calls: message
            .tool_calls
            .iter()
            .map(|call| WireToolCall {
                id: call.id.clone(),
                kind: function_type(),
                function: WireFunctionCall {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                },
            })
            .collect(),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn parse_finish_reason(raw: Option<&str>) -> Option<FinishReason> {
    raw.and_then(|reason| reason.parse().ok())
}

impl From<WireUsage> for Usage {
    fn from(usage: WireUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

/// Map a non-streaming response. `provider` is the registry name.
pub fn from_wire_response(response: WireResponse, provider: &str) -> ChatResponse {
    let created_at = response
        .created
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let choices = response
        .choices
        .into_iter()
        .map(|choice| {
            let mut message = ChatMessage::assistant(choice.message.content.unwrap_or_default());
            message.tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| ToolCall {
                    id: call.id,
                    function: FunctionCall {
                        name: call.function.name,
                        arguments: call.function.arguments,
                    },
                })
                .collect();
            Choice {
                index: choice.index,
                message,
                finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            }
        })
        .collect();

    ChatResponse {
        id: response.id,
        provider: provider.to_string(),
        model: response.model,
        choices,
        usage: response.usage.map(Usage::from),
        created_at,
        latency_ms: None,
        cached: false,
    }
}

/// Map one SSE `data:` payload.
pub fn from_wire_chunk(chunk: WireChunk) -> StreamChunk {
    StreamChunk {
        id: chunk.id,
        model: chunk.model,
        choices: chunk
            .choices
            .into_iter()
            .map(|choice| ChunkChoice {
                index: choice.index,
                delta: ChunkDelta {
                    role: choice.delta.role.and_then(|role| role.parse().ok()),
                    content: choice.delta.content,
                    tool_calls: choice
                        .delta
                        .tool_calls
                        .unwrap_or_default()
                        .into_iter()
                        .map(|call| {
                            let (name, arguments) = match call.function {
                                Some(f) => (f.name, f.arguments),
                                None => (None, None),
                            };
                            ToolCallDelta {
                                index: call.index,
                                id: call.id,
                                name,
                                arguments,
                            }
                        })
                        .collect(),
                },
                finish_reason: parse_finish_reason(choice.finish_reason.as_deref()),
            })
            .collect(),
        usage: chunk.usage.map(Usage::from),
    }
}

impl From<WireModel> for ModelInfo {
    fn from(model: WireModel) -> Self {
        ModelInfo {
            id: model.id,
            owned_by: model.owned_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llmux_types::llm::ToolDefinition;

    #[test]
    fn request_uses_default_model_when_unset() {
        let request = ChatRequest::new("groq", "").with_message(ChatMessage::user("hi"));
        let wire = to_wire_request(&request, "llama-3.1-8b-instant", false);
        assert_eq!(wire.model, "llama-3.1-8b-instant");

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "hi");
        assert_eq!(json["stream"], false);
        assert!(json.get("stream_options").is_none());
        assert!(json.get("temperature").is_none());
        assert!(json.get("tools").is_none());
    }

    #[test]
    fn streaming_request_asks_for_usage() {
        let request = ChatRequest::new("openai", "gpt-4o")
            .with_message(ChatMessage::user("hi"))
            .with_temperature(0.3)
            .with_max_tokens(64);
        let json = serde_json::to_value(to_wire_request(&request, "unused", true)).unwrap();
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["temperature"], 0.3);
        assert_eq!(json["max_tokens"], 64);
    }

    #[test]
    fn tools_and_tool_turns_are_mapped() {
        let mut assistant = ChatMessage::assistant("");
        assistant.tool_calls.push(ToolCall {
            id: "call_1".to_string(),
            function: FunctionCall {
                name: "lookup".to_string(),
                arguments: "{\"q\":\"rust\"}".to_string(),
            },
        });
        let mut tool_reply = ChatMessage::new(MessageRole::Tool, "42");
        tool_reply.tool_call_id = Some("call_1".to_string());

        let mut request = ChatRequest::new("openai", "gpt-4o")
            .with_message(ChatMessage::user("look it up"))
            .with_message(assistant)
            .with_message(tool_reply);
        request.tools.push(ToolDefinition {
            name: "lookup".to_string(),
            description: Some("Search".to_string()),
            parameters: serde_json::json!({"type": "object"}),
        });

        let json = serde_json::to_value(to_wire_request(&request, "unused", false)).unwrap();
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "lookup");
        assert!(json["messages"][1]["content"].is_null());
        assert_eq!(json["messages"][1]["tool_calls"][0]["type"], "function");
        assert_eq!(json["messages"][1]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(json["messages"][2]["role"], "tool");
        assert_eq!(json["messages"][2]["tool_call_id"], "call_1");
    }

    #[test]
    fn response_is_mapped_to_canonical_shape() {
        let body = r#"{
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1700000000,
            "model": "gpt-4o-mini-2024-07-18",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello!"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        }"#;
        let wire: WireResponse = serde_json::from_str(body).unwrap();
        let response = from_wire_response(wire, "openai");

        assert_eq!(response.id, "chatcmpl-1");
        assert_eq!(response.provider, "openai");
        assert_eq!(response.text(), "Hello!");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage, Some(Usage::new(9, 3)));
        assert_eq!(response.created_at.timestamp(), 1_700_000_000);
        assert!(!response.cached);
    }

    #[test]
    fn response_tool_calls_are_mapped() {
        let body = r#"{
            "id": "chatcmpl-2",
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {"name": "get_weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }"#;
        let response = from_wire_response(serde_json::from_str(body).unwrap(), "openai");
        let choice = &response.choices[0];
        assert_eq!(choice.message.content, "");
        assert_eq!(choice.message.tool_calls[0].id, "call_abc");
        assert_eq!(choice.message.tool_calls[0].function.name, "get_weather");
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert!(response.usage.is_none());
    }

    #[test]
    fn chunk_deltas_are_mapped() {
        let data = r#"{
            "id": "chatcmpl-3",
            "model": "llama3.1",
            "choices": [{
                "index": 0,
                "delta": {
                    "role": "assistant",
                    "tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "f", "arguments": "{\"a\""}}]
                },
                "finish_reason": null
            }]
        }"#;
        let chunk = from_wire_chunk(serde_json::from_str(data).unwrap());
        let delta = &chunk.choices[0].delta;
        assert_eq!(delta.role, Some(MessageRole::Assistant));
        assert_eq!(delta.tool_calls[0].index, Some(0));
        assert_eq!(delta.tool_calls[0].id.as_deref(), Some("call_1"));
        assert_eq!(delta.tool_calls[0].name.as_deref(), Some("f"));
        assert_eq!(delta.tool_calls[0].arguments.as_deref(), Some("{\"a\""));
    }

    #[test]
    fn usage_only_chunk_has_no_choices() {
        let data = r#"{"id":"x","model":"m","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":7,"total_tokens":12}}"#;
        let chunk = from_wire_chunk(serde_json::from_str(data).unwrap());
        assert!(chunk.choices.is_empty());
        assert_eq!(chunk.usage, Some(Usage::new(5, 7)));
    }
}
