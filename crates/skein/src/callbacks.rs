//! Lifecycle event dispatch.
//!
//! Every top-level invocation gets a run-scoped [`RunManager`] carrying a
//! fresh correlation id; nested calls inherit the parent id so observers can
//! reconstruct the call tree. Handler failures are logged and never abort
//! the underlying call.

use std::sync::Arc;

use async_trait::async_trait;
use lazy_static::lazy_static;
use uuid::Uuid;

use crate::agent::{AgentAction, AgentFinish};
use crate::chain::ChainValues;
use crate::errors::{Error, ToolError};
use crate::models::generation::LlmResult;

/// Correlation identifiers for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
}

/// An observer of model, chain, tool and agent lifecycle events.
///
/// All methods default to no-ops so a handler only implements the events it
/// cares about. A returned error is caught and logged by the dispatcher.
#[async_trait]
pub trait CallbackHandler: Send + Sync {
    async fn on_llm_start(
        &self,
        _run: &RunInfo,
        _model: &str,
        _prompts: &[String],
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_llm_new_token(&self, _run: &RunInfo, _token: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_llm_end(&self, _run: &RunInfo, _result: &LlmResult) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_llm_error(&self, _run: &RunInfo, _error: &Error) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_chain_start(
        &self,
        _run: &RunInfo,
        _chain_type: &str,
        _inputs: &ChainValues,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_chain_end(&self, _run: &RunInfo, _outputs: &ChainValues) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_chain_error(&self, _run: &RunInfo, _error: &Error) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tool_start(&self, _run: &RunInfo, _name: &str, _input: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tool_end(&self, _run: &RunInfo, _output: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_tool_error(
        &self,
        _run: &RunInfo,
        _name: &str,
        _error: &ToolError,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_agent_action(&self, _run: &RunInfo, _action: &AgentAction) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_agent_finish(&self, _run: &RunInfo, _finish: &AgentFinish) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A set of handlers plus the parent run they are scoped under.
///
/// Managers are cheap to clone and are passed explicitly down the call chain
/// (model, chain, agent); [`default_manager`] provides the process-wide
/// fallback instance.
#[derive(Clone, Default)]
pub struct CallbackManager {
    handlers: Vec<Arc<dyn CallbackHandler>>,
    parent_run_id: Option<Uuid>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(handler: Arc<dyn CallbackHandler>) -> Self {
        CallbackManager {
            handlers: vec![handler],
            parent_run_id: None,
        }
    }

    pub fn add_handler(&mut self, handler: Arc<dyn CallbackHandler>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Call-site overrides win over the configured fallback.
    pub fn configure(overrides: Option<&CallbackManager>, fallback: &CallbackManager) -> Self {
        overrides.cloned().unwrap_or_else(|| fallback.clone())
    }

    /// Begin a new run under this manager's parent, with a fresh id.
    pub fn start_run(&self) -> RunManager {
        RunManager {
            info: RunInfo {
                run_id: Uuid::new_v4(),
                parent_run_id: self.parent_run_id,
            },
            handlers: self.handlers.clone(),
        }
    }
}

impl std::fmt::Debug for CallbackManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackManager")
            .field("handlers", &self.handlers.len())
            .field("parent_run_id", &self.parent_run_id)
            .finish()
    }
}

macro_rules! dispatch {
    ($self:ident, $method:ident $(, $arg:expr)*) => {
        for handler in &$self.handlers {
            if let Err(err) = handler.$method(&$self.info $(, $arg)*).await {
                tracing::warn!(
                    run_id = %$self.info.run_id,
                    error = %err,
                    concat!("callback handler failed in ", stringify!($method)),
                );
            }
        }
    };
}

/// Dispatches the events of a single run to every registered handler, in
/// registration order.
pub struct RunManager {
    info: RunInfo,
    handlers: Vec<Arc<dyn CallbackHandler>>,
}

impl RunManager {
    pub fn run_id(&self) -> Uuid {
        self.info.run_id
    }

    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// A manager for nested calls, scoped under this run's id.
    pub fn child(&self) -> CallbackManager {
        CallbackManager {
            handlers: self.handlers.clone(),
            parent_run_id: Some(self.info.run_id),
        }
    }

    pub async fn on_llm_start(&self, model: &str, prompts: &[String]) {
        dispatch!(self, on_llm_start, model, prompts);
    }

    pub async fn on_llm_new_token(&self, token: &str) {
        dispatch!(self, on_llm_new_token, token);
    }

    pub async fn on_llm_end(&self, result: &LlmResult) {
        dispatch!(self, on_llm_end, result);
    }

    pub async fn on_llm_error(&self, error: &Error) {
        dispatch!(self, on_llm_error, error);
    }

    pub async fn on_chain_start(&self, chain_type: &str, inputs: &ChainValues) {
        dispatch!(self, on_chain_start, chain_type, inputs);
    }

    pub async fn on_chain_end(&self, outputs: &ChainValues) {
        dispatch!(self, on_chain_end, outputs);
    }

    pub async fn on_chain_error(&self, error: &Error) {
        dispatch!(self, on_chain_error, error);
    }

    pub async fn on_tool_start(&self, name: &str, input: &str) {
        dispatch!(self, on_tool_start, name, input);
    }

    pub async fn on_tool_end(&self, output: &str) {
        dispatch!(self, on_tool_end, output);
    }

    pub async fn on_tool_error(&self, name: &str, error: &ToolError) {
        dispatch!(self, on_tool_error, name, error);
    }

    pub async fn on_agent_action(&self, action: &AgentAction) {
        dispatch!(self, on_agent_action, action);
    }

    pub async fn on_agent_finish(&self, finish: &AgentFinish) {
        dispatch!(self, on_agent_finish, finish);
    }
}

/// Logs lifecycle events through `tracing`.
pub struct TracingCallbackHandler;

#[async_trait]
impl CallbackHandler for TracingCallbackHandler {
    async fn on_llm_start(
        &self,
        run: &RunInfo,
        model: &str,
        prompts: &[String],
    ) -> anyhow::Result<()> {
        tracing::debug!(run_id = %run.run_id, model, prompts = prompts.len(), "llm start");
        Ok(())
    }

    async fn on_llm_end(&self, run: &RunInfo, result: &LlmResult) -> anyhow::Result<()> {
        tracing::debug!(run_id = %run.run_id, prompts = result.generations.len(), "llm end");
        Ok(())
    }

    async fn on_llm_error(&self, run: &RunInfo, error: &Error) -> anyhow::Result<()> {
        tracing::warn!(run_id = %run.run_id, error = %error, "llm error");
        Ok(())
    }

    async fn on_chain_start(
        &self,
        run: &RunInfo,
        chain_type: &str,
        _inputs: &ChainValues,
    ) -> anyhow::Result<()> {
        tracing::debug!(run_id = %run.run_id, chain_type, "chain start");
        Ok(())
    }

    async fn on_chain_end(&self, run: &RunInfo, _outputs: &ChainValues) -> anyhow::Result<()> {
        tracing::debug!(run_id = %run.run_id, "chain end");
        Ok(())
    }

    async fn on_chain_error(&self, run: &RunInfo, error: &Error) -> anyhow::Result<()> {
        tracing::warn!(run_id = %run.run_id, error = %error, "chain error");
        Ok(())
    }

    async fn on_tool_start(&self, run: &RunInfo, name: &str, input: &str) -> anyhow::Result<()> {
        tracing::debug!(run_id = %run.run_id, tool = name, input, "tool start");
        Ok(())
    }

    async fn on_tool_error(
        &self,
        run: &RunInfo,
        name: &str,
        error: &ToolError,
    ) -> anyhow::Result<()> {
        tracing::warn!(run_id = %run.run_id, tool = name, error = %error, "tool error");
        Ok(())
    }
}

lazy_static! {
    static ref DEFAULT_MANAGER: CallbackManager =
        CallbackManager::with_handler(Arc::new(TracingCallbackHandler));
}

/// The process-wide default manager: tracing-backed, overridable per call.
pub fn default_manager() -> CallbackManager {
    DEFAULT_MANAGER.clone()
}
