//! Conversational state persisted across calls.
//!
//! Memory is loaded into a chain's inputs before its core logic runs and
//! saved back only after a successful call.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::chain::{value_to_string, ChainValues};
use crate::errors::{Error, Result};
use crate::models::message::Message;
use crate::prompt::buffer_string;

/// The memory seam a chain wires around its call.
#[async_trait]
pub trait Memory: Send + Sync {
    /// The variable names this memory contributes to chain inputs.
    fn memory_keys(&self) -> Vec<String>;

    async fn load_variables(&self, inputs: &ChainValues) -> Result<ChainValues>;

    async fn save_context(&self, inputs: &ChainValues, outputs: &ChainValues) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Whole-conversation transcript memory under a single variable.
pub struct BufferMemory {
    messages: Mutex<Vec<Message>>,
    memory_key: String,
    input_key: Option<String>,
    output_key: Option<String>,
}

impl Default for BufferMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferMemory {
    pub fn new() -> Self {
        BufferMemory {
            messages: Mutex::new(Vec::new()),
            memory_key: "history".to_string(),
            input_key: None,
            output_key: None,
        }
    }

    pub fn with_memory_key<S: Into<String>>(mut self, key: S) -> Self {
        self.memory_key = key.into();
        self
    }

    pub fn with_input_key<S: Into<String>>(mut self, key: S) -> Self {
        self.input_key = Some(key.into());
        self
    }

    pub fn with_output_key<S: Into<String>>(mut self, key: S) -> Self {
        self.output_key = Some(key.into());
        self
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.messages.lock().await.clone()
    }

    /// Pick the configured key, or the only non-memory key present.
    fn select<'a>(
        values: &'a ChainValues,
        key: &Option<String>,
        exclude: &[String],
    ) -> Result<&'a Value> {
        if let Some(key) = key {
            return values
                .get(key)
                .ok_or_else(|| Error::Validation(format!("Missing memory key: {key}")));
        }
        let candidates: Vec<&String> = values
            .keys()
            .filter(|candidate| !exclude.iter().any(|excluded| excluded == *candidate))
            .collect();
        if candidates.len() != 1 {
            return Err(Error::Validation(format!(
                "Buffer memory expected exactly one value key, got {}",
                candidates.len()
            )));
        }
        Ok(&values[candidates[0]])
    }
}

#[async_trait]
impl Memory for BufferMemory {
    fn memory_keys(&self) -> Vec<String> {
        vec![self.memory_key.clone()]
    }

    async fn load_variables(&self, _inputs: &ChainValues) -> Result<ChainValues> {
        let messages = self.messages.lock().await;
        let mut variables = ChainValues::new();
        variables.insert(
            self.memory_key.clone(),
            Value::String(buffer_string(&messages)),
        );
        Ok(variables)
    }

    async fn save_context(&self, inputs: &ChainValues, outputs: &ChainValues) -> Result<()> {
        let memory_keys = self.memory_keys();
        let input = value_to_string(Self::select(inputs, &self.input_key, &memory_keys)?);
        let output = value_to_string(Self::select(outputs, &self.output_key, &[])?);

        let mut messages = self.messages.lock().await;
        messages.push(Message::user().with_text(input));
        messages.push(Message::assistant().with_text(output));
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.messages.lock().await.clear();
        Ok(())
    }
}
