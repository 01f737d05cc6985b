//! Inference backends.
//!
//! A [`Backend`] is the black-box seam to a vendor: messages in, a reply
//! (or a stream of fragments) out. Everything above this trait is
//! vendor-agnostic; the single [`http`] adapter speaks the de-facto
//! chat-completions JSON protocol that covers most hosted and local
//! backends, and [`mock`] provides scripted replies for tests.
pub mod http;
pub mod mock;
pub mod registry;
pub(crate) mod wire;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::generation::{GenerationChunk, Usage};
use crate::models::message::Message;
use crate::models::tool::ToolSpec;

/// The identifying parameters of one model configuration.
///
/// Serialized (with sorted keys) into the cache signature, so any change
/// here invalidates previously cached generations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop: Vec<String>,
}

impl ModelParams {
    pub fn new<S: Into<String>>(model: S) -> Self {
        ModelParams {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            stop: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: i32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = stop;
        self
    }

    /// The model signature half of the cache key: sorted, serialized
    /// identifying parameters.
    pub fn llm_key(&self) -> String {
        // Value objects sort their keys, which keeps the signature stable
        // across field reordering.
        serde_json::to_value(self)
            .map(|value| value.to_string())
            .unwrap_or_else(|_| self.model.clone())
    }
}

/// One request to an inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub params: ModelParams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tools: Vec<ToolSpec>,
    pub messages: Vec<Message>,
}

/// One reply from an inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendReply {
    pub message: Message,
    #[serde(default)]
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_info: Option<Value>,
}

/// Connection settings for a backend instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub api_key: String,
}

/// Base trait for inference backends.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Generate the reply for a single request.
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<BackendReply>;

    /// Generate replies for several requests in one sub-call, preserving
    /// input order.
    async fn complete_batch(
        &self,
        requests: &[CompletionRequest],
    ) -> anyhow::Result<Vec<BackendReply>> {
        let futures: Vec<_> = requests
            .iter()
            .map(|request| self.complete(request))
            .collect();
        futures::future::try_join_all(futures).await
    }

    /// Stream the reply as ordered fragments. Backends without native
    /// streaming fall back to the whole reply as a single chunk.
    async fn stream(
        &self,
        request: &CompletionRequest,
    ) -> anyhow::Result<BoxStream<'static, anyhow::Result<GenerationChunk>>> {
        let reply = self.complete(request).await?;
        let mut chunk = GenerationChunk::new(reply.message.text());
        if let Some(info) = reply.generation_info {
            chunk = chunk.with_info(info);
        }
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }
}
