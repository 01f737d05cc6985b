//! The chain contract: one step of business logic wrapping a model call
//! with memory and callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callbacks::{self, CallbackManager, RunManager};
use crate::errors::{Error, Result};
use crate::memory::Memory;
use crate::model::{deadline_token, CallOptions, ChatModel, Prompt};
use crate::prompt::PromptTemplate;

/// Named values flowing into and out of a chain.
pub type ChainValues = HashMap<String, Value>;

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Call-site options for one chain invocation.
#[derive(Clone, Default)]
pub struct ChainCallOptions {
    pub callbacks: Option<CallbackManager>,
    pub signal: Option<CancellationToken>,
    pub timeout: Option<Duration>,
}

/// A chain's output values plus the run id that produced them.
///
/// The id rides alongside the values rather than inside them, so code that
/// iterates output keys is unaffected.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub values: ChainValues,
    pub run_id: Uuid,
}

impl ChainOutput {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

/// Base trait that all chains implement.
///
/// `call` wraps the chain's core logic with memory loading/saving, callback
/// notification and the cancellation race; implementations supply
/// `call_inner` and their key declarations.
#[async_trait]
pub trait Chain: Send + Sync {
    /// The string type key uniquely identifying this kind of chain.
    fn chain_type(&self) -> &'static str;

    /// The input keys the chain requires, memory-provided keys included.
    fn input_keys(&self) -> Vec<String>;

    /// The output keys the chain produces.
    fn output_keys(&self) -> Vec<String>;

    fn memory(&self) -> Option<&dyn Memory> {
        None
    }

    fn callbacks(&self) -> CallbackManager {
        callbacks::default_manager()
    }

    /// Run the core logic of this chain and return the output values.
    async fn call_inner(&self, values: &ChainValues, run: &RunManager) -> Result<ChainValues>;

    /// Run the chain: load memory, notify callbacks, run the core logic
    /// under the cancellation race, save context on success.
    async fn call(&self, values: ChainValues, opts: ChainCallOptions) -> Result<ChainOutput> {
        let mut full = values.clone();
        if let Some(memory) = self.memory() {
            for (key, value) in memory.load_variables(&values).await? {
                full.insert(key, value);
            }
        }
        for key in self.input_keys() {
            if !full.contains_key(&key) {
                return Err(Error::Validation(format!("Missing input key: {key}")));
            }
        }

        let manager = CallbackManager::configure(opts.callbacks.as_ref(), &self.callbacks());
        let run = manager.start_run();
        run.on_chain_start(self.chain_type(), &full).await;

        let signal = match (&opts.signal, opts.timeout) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(timeout)) => Some(deadline_token(timeout)),
            (None, None) => None,
        };
        let result = match &signal {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                result = self.call_inner(&full, &run) => result,
            },
            None => self.call_inner(&full, &run).await,
        };

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(err) => {
                run.on_chain_error(&err).await;
                return Err(err);
            }
        };

        if let Some(memory) = self.memory() {
            if let Err(err) = memory.save_context(&values, &outputs).await {
                run.on_chain_error(&err).await;
                return Err(err);
            }
        }

        run.on_chain_end(&outputs).await;
        Ok(ChainOutput {
            values: outputs,
            run_id: run.run_id(),
        })
    }

    /// Convenience for chains with exactly one free input key and one
    /// output key: string in, string out.
    async fn run(&self, input: Value) -> Result<String> {
        let memory_keys = self
            .memory()
            .map(|memory| memory.memory_keys())
            .unwrap_or_default();
        let input_keys: Vec<String> = self
            .input_keys()
            .into_iter()
            .filter(|key| !memory_keys.contains(key))
            .collect();
        if input_keys.len() != 1 {
            return Err(Error::Validation(format!(
                "`run` requires a chain with exactly one input key, {} has {}",
                self.chain_type(),
                input_keys.len()
            )));
        }
        let output_keys = self.output_keys();
        if output_keys.len() != 1 {
            return Err(Error::Validation(format!(
                "`run` requires a chain with exactly one output key, {} has {}",
                self.chain_type(),
                output_keys.len()
            )));
        }

        let mut values = ChainValues::new();
        values.insert(input_keys[0].clone(), input);
        let output = self.call(values, ChainCallOptions::default()).await?;
        output
            .values
            .get(&output_keys[0])
            .map(value_to_string)
            .ok_or_else(|| {
                Error::Validation(format!("Chain produced no '{}' output", output_keys[0]))
            })
    }

    /// Call the chain on every input in the list.
    async fn apply(&self, inputs: Vec<ChainValues>) -> Result<Vec<ChainOutput>> {
        futures::future::try_join_all(
            inputs
                .into_iter()
                .map(|values| self.call(values, ChainCallOptions::default())),
        )
        .await
    }
}

/// A chain that formats a prompt template and runs it through a model.
pub struct LlmChain {
    prompt: PromptTemplate,
    model: ChatModel,
    output_key: String,
    memory: Option<Arc<dyn Memory>>,
    callbacks: CallbackManager,
}

impl LlmChain {
    pub fn new(prompt: PromptTemplate, model: ChatModel) -> Self {
        LlmChain {
            prompt,
            model,
            output_key: "text".to_string(),
            memory: None,
            callbacks: callbacks::default_manager(),
        }
    }

    pub fn with_output_key<S: Into<String>>(mut self, key: S) -> Self {
        self.output_key = key.into();
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackManager) -> Self {
        self.callbacks = callbacks;
        self
    }
}

#[async_trait]
impl Chain for LlmChain {
    fn chain_type(&self) -> &'static str {
        "llm"
    }

    fn input_keys(&self) -> Vec<String> {
        self.prompt.input_variables().to_vec()
    }

    fn output_keys(&self) -> Vec<String> {
        vec![self.output_key.clone()]
    }

    fn memory(&self) -> Option<&dyn Memory> {
        self.memory.as_deref()
    }

    fn callbacks(&self) -> CallbackManager {
        self.callbacks.clone()
    }

    async fn call_inner(&self, values: &ChainValues, run: &RunManager) -> Result<ChainValues> {
        let rendered = self.prompt.format(values)?;
        let result = self
            .model
            .generate(
                &[Prompt::text(rendered)],
                CallOptions {
                    callbacks: Some(run.child()),
                    ..Default::default()
                },
            )
            .await?;

        let text = result.first_text().unwrap_or_default().to_string();
        let mut outputs = ChainValues::new();
        outputs.insert(self.output_key.clone(), Value::String(text));
        Ok(outputs)
    }
}
