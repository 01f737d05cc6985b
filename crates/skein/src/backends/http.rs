//! Generic chat-completions backend over HTTP.
//!
//! Speaks the de-facto JSON protocol shared by most hosted and local
//! inference servers; one adapter covers them all, so there is no
//! per-vendor code above this module.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::wire::{
    apply_tool_call_delta, builders_to_value, finish_reason, messages_to_wire, response_to_message,
    tools_to_wire, usage_from_response, ToolCallBuilder,
};
use super::{Backend, BackendConfig, BackendReply, CompletionRequest};
use crate::models::generation::GenerationChunk;

pub struct HttpBackend {
    client: Client,
    config: BackendConfig,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600)) // 10 minutes timeout
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.config.host.trim_end_matches('/')
        )
    }

    fn build_payload(&self, request: &CompletionRequest, stream: bool) -> Value {
        let messages = messages_to_wire(request.system.as_deref(), &request.messages);

        let mut payload = json!({
            "model": request.params.model,
            "messages": messages
        });

        if !request.tools.is_empty() {
            payload["tools"] = json!(tools_to_wire(&request.tools));
        }
        if let Some(temperature) = request.params.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.params.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if !request.params.stop.is_empty() {
            payload["stop"] = json!(request.params.stop);
        }
        if stream {
            payload["stream"] = json!(true);
        }

        payload
    }

    async fn post(&self, payload: Value) -> Result<Value> {
        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK => Ok(response.json().await?),
            status if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() >= 500 => {
                Err(anyhow!("Server error: {}", status))
            }
            status => Err(anyhow!("Request failed: {}", status)),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<BackendReply> {
        let payload = self.build_payload(request, false);
        let response = self.post(payload).await?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("Backend API error: {}", error));
        }

        let message = response_to_message(&response)?;
        let usage = usage_from_response(&response)?;

        Ok(BackendReply {
            message,
            usage,
            generation_info: finish_reason(&response),
        })
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
        let payload = self.build_payload(request, true);
        let response = self
            .client
            .post(self.url())
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Request failed: {}", response.status()));
        }

        let mut body = response.bytes_stream();

        Ok(Box::pin(async_stream::try_stream! {
            let mut buffer = String::new();
            let mut builders: Vec<ToolCallBuilder> = Vec::new();
            let mut finish: Option<Value> = None;
            let mut done = false;

            while let Some(bytes) = body.next().await {
                let bytes = bytes?;
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        done = true;
                        break;
                    }

                    let value: Value = serde_json::from_str(data)?;
                    let delta = &value["choices"][0]["delta"];
                    if let Some(text) = delta["content"].as_str() {
                        if !text.is_empty() {
                            yield GenerationChunk::new(text);
                        }
                    }
                    if let Some(calls) = delta["tool_calls"].as_array() {
                        for call in calls {
                            apply_tool_call_delta(&mut builders, call);
                        }
                    }
                    if let Some(reason) = value["choices"][0]["finish_reason"].as_str() {
                        finish = Some(json!(reason));
                    }
                }

                if done {
                    break;
                }
            }

            if finish.is_some() || !builders.is_empty() {
                let mut info = serde_json::Map::new();
                if let Some(reason) = finish {
                    info.insert("finish_reason".to_string(), reason);
                }
                if !builders.is_empty() {
                    info.insert("tool_calls".to_string(), builders_to_value(&builders));
                }
                yield GenerationChunk::default().with_info(Value::Object(info));
            }
        }))
    }
}
