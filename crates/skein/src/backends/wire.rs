//! Conversions between the internal message format and the
//! chat-completions wire format.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};

use crate::errors::ToolError;
use crate::models::content::Content;
use crate::models::generation::Usage;
use crate::models::message::{Message, MessageContent};
use crate::models::tool::{ToolCall, ToolSpec};

/// Convert the internal transcript to wire messages, with an optional
/// system message first.
pub fn messages_to_wire(system: Option<&str>, messages: &[Message]) -> Vec<Value> {
    let mut wire = Vec::new();
    if let Some(system) = system {
        wire.push(json!({
            "role": "system",
            "content": system
        }));
    }

    for message in messages {
        let mut text_parts: Vec<&str> = Vec::new();
        let mut image_parts: Vec<Value> = Vec::new();
        let mut tool_calls: Vec<Value> = Vec::new();
        // Tool results travel as separate wire messages after the entry
        // that carried the request.
        let mut tool_results: Vec<Value> = Vec::new();

        for content in &message.content {
            match content {
                MessageContent::Text(text) => {
                    if !text.text.is_empty() {
                        text_parts.push(&text.text);
                    }
                }
                MessageContent::Image(image) => {
                    image_parts.push(json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", image.mime_type, image.data)
                        }
                    }));
                }
                MessageContent::ToolRequest(request) => match &request.tool_call {
                    Ok(tool_call) => {
                        tool_calls.push(json!({
                            "id": request.id,
                            "type": "function",
                            "function": {
                                "name": tool_call.name,
                                "arguments": tool_call.arguments.to_string(),
                            }
                        }));
                    }
                    Err(err) => {
                        tool_results.push(json!({
                            "role": "tool",
                            "tool_call_id": request.id,
                            "content": format!("Error: {}", err)
                        }));
                    }
                },
                MessageContent::ToolResponse(response) => {
                    let content = match &response.tool_result {
                        Ok(contents) => contents
                            .iter()
                            .filter_map(Content::as_text)
                            .collect::<Vec<_>>()
                            .join("\n"),
                        Err(err) => format!("Error: {}", err),
                    };
                    tool_results.push(json!({
                        "role": "tool",
                        "tool_call_id": response.id,
                        "content": content
                    }));
                }
            }
        }

        let mut entry = json!({ "role": message.role });
        let joined = text_parts.join("");
        if !image_parts.is_empty() {
            let mut parts = vec![json!({"type": "text", "text": joined})];
            parts.extend(image_parts);
            entry["content"] = json!(parts);
        } else if !joined.is_empty() {
            entry["content"] = json!(joined);
        }
        if !tool_calls.is_empty() {
            entry["tool_calls"] = json!(tool_calls);
        }
        if entry.get("content").is_some() || entry.get("tool_calls").is_some() {
            wire.push(entry);
        }
        wire.extend(tool_results);
    }

    wire
}

pub fn tools_to_wire(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                }
            })
        })
        .collect()
}

/// Parse a non-streaming wire response into an assistant message.
pub fn response_to_message(response: &Value) -> Result<Message> {
    let wire_message = response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| anyhow!("Response contained no message"))?;

    let mut message = Message::assistant();
    if let Some(text) = wire_message["content"].as_str() {
        if !text.is_empty() {
            message = message.with_text(text);
        }
    }
    if let Some(tool_calls) = wire_message["tool_calls"].as_array() {
        for call in tool_calls {
            let id = call["id"].as_str().unwrap_or_default().to_string();
            let name = call["function"]["name"].as_str().unwrap_or_default();
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
            let tool_call = match serde_json::from_str::<Value>(arguments) {
                Ok(parsed) => Ok(ToolCall::new(name, parsed)),
                Err(err) => Err(ToolError::InvalidInput(format!(
                    "Could not interpret tool call arguments: {err}"
                ))),
            };
            message = message.with_tool_request(id, tool_call);
        }
    }
    Ok(message)
}

pub fn finish_reason(response: &Value) -> Option<Value> {
    response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("finish_reason"))
        .filter(|reason| !reason.is_null())
        .map(|reason| json!({ "finish_reason": reason }))
}

pub fn usage_from_response(response: &Value) -> Result<Usage> {
    let usage = response
        .get("usage")
        .ok_or_else(|| anyhow!("No usage data in response"))?;

    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let output_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32);

    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .or_else(|| match (input_tokens, output_tokens) {
            (Some(input), Some(output)) => Some(input + output),
            _ => None,
        });

    Ok(Usage::new(input_tokens, output_tokens, total_tokens))
}

/// Accumulates streamed tool-call fragments; argument fragments are
/// appended in arrival order.
#[derive(Debug, Default)]
pub(crate) struct ToolCallBuilder {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

pub(crate) fn apply_tool_call_delta(builders: &mut Vec<ToolCallBuilder>, delta: &Value) {
    let index = delta["index"].as_u64().unwrap_or(builders.len() as u64) as usize;
    while builders.len() <= index {
        builders.push(ToolCallBuilder::default());
    }
    let builder = &mut builders[index];
    if let Some(id) = delta["id"].as_str() {
        builder.id.push_str(id);
    }
    if let Some(name) = delta["function"]["name"].as_str() {
        builder.name.push_str(name);
    }
    if let Some(fragment) = delta["function"]["arguments"].as_str() {
        builder.arguments.push_str(fragment);
    }
}

pub(crate) fn builders_to_value(builders: &[ToolCallBuilder]) -> Value {
    json!(builders
        .iter()
        .map(|builder| {
            json!({
                "id": builder.id,
                "name": builder.name,
                "arguments": builder.arguments,
            })
        })
        .collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::content::Content;

    #[test]
    fn test_messages_to_wire_basic() {
        let messages = vec![Message::user().with_text("Hello?")];
        let wire = messages_to_wire(Some("You are helpful."), &messages);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"], "Hello?");
    }

    #[test]
    fn test_messages_to_wire_tool_round() {
        let messages = vec![
            Message::assistant().with_tool_request(
                "call_1",
                Ok(ToolCall::new("get_weather", json!({"location": "SF"}))),
            ),
            Message::user().with_tool_response("call_1", Ok(vec![Content::text("sunny")])),
        ];
        let wire = messages_to_wire(None, &messages);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["tool_calls"][0]["function"]["name"], "get_weather");
        assert_eq!(wire[1]["role"], "tool");
        assert_eq!(wire[1]["tool_call_id"], "call_1");
        assert_eq!(wire[1]["content"], "sunny");
    }

    #[test]
    fn test_response_to_message_with_tool_calls() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_123",
                        "type": "function",
                        "function": {
                            "name": "get_weather",
                            "arguments": "{\"location\":\"San Francisco, CA\"}"
                        }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let message = response_to_message(&response).unwrap();
        let requests = message.tool_requests();
        assert_eq!(requests.len(), 1);
        let call = requests[0].tool_call.as_ref().unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments, json!({"location": "San Francisco, CA"}));
    }

    #[test]
    fn test_response_to_message_bad_arguments_become_data() {
        let response = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "function": {"name": "echo", "arguments": "{not json"}
                    }]
                }
            }]
        });
        let message = response_to_message(&response).unwrap();
        assert!(message.tool_requests()[0].tool_call.is_err());
    }

    #[test]
    fn test_tool_call_delta_accumulates_arguments_in_order() {
        let mut builders = Vec::new();
        apply_tool_call_delta(
            &mut builders,
            &json!({"index": 0, "id": "call_1", "function": {"name": "echo", "arguments": "{\"mes"}}),
        );
        apply_tool_call_delta(
            &mut builders,
            &json!({"index": 0, "function": {"arguments": "sage\": \"hi\"}"}}),
        );
        assert_eq!(builders.len(), 1);
        assert_eq!(builders[0].name, "echo");
        assert_eq!(builders[0].arguments, "{\"message\": \"hi\"}");
    }

    #[test]
    fn test_usage_from_response_totals() {
        let usage = usage_from_response(&json!({
            "usage": {"prompt_tokens": 12, "completion_tokens": 15}
        }))
        .unwrap();
        assert_eq!(usage.total_tokens, Some(27));
    }
}
