//! The agent decision loop: alternate between asking the model for the
//! next action and executing tools, until the model finishes or a budget
//! runs out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indoc::formatdoc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::callbacks::{self, CallbackManager, RunManager};
use crate::chain::{value_to_string, Chain, ChainCallOptions, ChainValues, LlmChain};
use crate::errors::{Error, Result};
use crate::memory::Memory;
use crate::model::ChatModel;
use crate::models::message::Message;
use crate::models::tool::ToolSpec;
use crate::output_parser::{AgentOutputParser, OutputParser};
use crate::prompt::PromptTemplate;
use crate::tools::Tool;

/// An in-flight tool invocation request produced by planning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    pub tool: String,
    pub tool_input: String,
    /// The raw reasoning text that produced this action.
    pub log: String,
    /// The originating message log, for reassembling conversation history.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message_log: Vec<Message>,
}

/// The terminal result of an agent run: named return values plus the raw
/// text that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentFinish {
    pub return_values: ChainValues,
    pub log: String,
}

impl AgentFinish {
    pub fn from_output<S: Into<String>, L: Into<String>>(output: S, log: L) -> Self {
        let mut return_values = ChainValues::new();
        return_values.insert("output".to_string(), Value::String(output.into()));
        AgentFinish {
            return_values,
            log: log.into(),
        }
    }

    /// The synthetic finish used when the loop is halted by a budget.
    pub fn stopped() -> Self {
        Self::from_output("Agent stopped due to iteration limit or time limit.", "")
    }
}

/// One completed loop cycle: an action paired with the observation its
/// tool produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub action: AgentAction,
    pub observation: String,
}

/// What planning decided: act (possibly on several tools) or finish.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentDecision {
    Act(Vec<AgentAction>),
    Finish(AgentFinish),
}

/// The planning half of an agent: model plus parser.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Input keys the planner expects, beyond the scratchpad it builds
    /// itself.
    fn input_keys(&self) -> Vec<String>;

    /// Decide the next step from the accumulated steps and original inputs.
    async fn plan(
        &self,
        steps: &[AgentStep],
        inputs: &ChainValues,
        run: &RunManager,
    ) -> Result<AgentDecision>;

    /// Produce a best-effort finish once the executor halts the loop.
    async fn plan_finish(
        &self,
        steps: &[AgentStep],
        inputs: &ChainValues,
        run: &RunManager,
    ) -> Result<AgentFinish> {
        let _ = (steps, inputs, run);
        Ok(AgentFinish::stopped())
    }
}

/// An agent that plans with tag-formatted output over an [`LlmChain`].
pub struct TagAgent {
    chain: LlmChain,
    parser: AgentOutputParser,
}

impl TagAgent {
    pub fn new(model: ChatModel, tools: &[ToolSpec]) -> Self {
        let tool_lines = tools
            .iter()
            .map(|tool| format!("{}: {}", tool.name, tool.description))
            .collect::<Vec<_>>()
            .join("\n");
        let template = formatdoc! {r#"
            You are a helpful assistant. You have access to the following tools:

            {tools}

            In order to use a tool, write a <tool></tool> element with the tool name inside,
            followed by a <tool_input></tool_input> element with the input to the tool.
            You will get back the result inside an <observation></observation> element.

            When you know the final answer, respond with it inside a <final_answer></final_answer> element.

            Question: {{{{ input }}}}

            {{{{ agent_scratchpad }}}}"#,
            tools = tool_lines,
        };
        let prompt = PromptTemplate::new(
            template,
            vec!["input".to_string(), "agent_scratchpad".to_string()],
        );
        TagAgent {
            chain: LlmChain::new(prompt, model),
            parser: AgentOutputParser,
        }
    }

    fn scratchpad(steps: &[AgentStep]) -> String {
        steps
            .iter()
            .map(|step| {
                format!(
                    "{}\n<observation>{}</observation>",
                    step.action.log.trim(),
                    step.observation
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn predict(
        &self,
        steps: &[AgentStep],
        inputs: &ChainValues,
        run: &RunManager,
        suffix: Option<&str>,
    ) -> Result<String> {
        let mut values = inputs.clone();
        let mut pad = Self::scratchpad(steps);
        if let Some(suffix) = suffix {
            pad.push_str(suffix);
        }
        values.insert("agent_scratchpad".to_string(), Value::String(pad));

        let output = self
            .chain
            .call(
                values,
                ChainCallOptions {
                    callbacks: Some(run.child()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(output
            .values
            .get(&self.chain.output_keys()[0])
            .map(value_to_string)
            .unwrap_or_default())
    }
}

#[async_trait]
impl Agent for TagAgent {
    fn input_keys(&self) -> Vec<String> {
        self.chain
            .input_keys()
            .into_iter()
            .filter(|key| key != "agent_scratchpad")
            .collect()
    }

    async fn plan(
        &self,
        steps: &[AgentStep],
        inputs: &ChainValues,
        run: &RunManager,
    ) -> Result<AgentDecision> {
        let text = self.predict(steps, inputs, run, None).await?;
        self.parser.parse(&text)
    }

    async fn plan_finish(
        &self,
        steps: &[AgentStep],
        inputs: &ChainValues,
        run: &RunManager,
    ) -> Result<AgentFinish> {
        let text = self
            .predict(
                steps,
                inputs,
                run,
                Some("\n\nGive your best final answer now, inside a <final_answer></final_answer> element."),
            )
            .await?;
        match self.parser.parse(&text) {
            Ok(AgentDecision::Finish(finish)) => Ok(finish),
            // Anything else still counts as the best effort we got.
            _ => Ok(AgentFinish::from_output(text.clone(), text)),
        }
    }
}

/// How the executor treats a tool failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolErrorMode {
    /// Convert the failure to an observation string and keep looping.
    #[default]
    Recover,
    /// Propagate the failure to the caller.
    Fatal,
}

/// What the executor does when an iteration or time budget is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EarlyStopping {
    /// Return a synthetic "stopped" finish immediately.
    #[default]
    Force,
    /// Ask the agent for one final best-effort finish.
    Generate,
}

/// Drives an [`Agent`] in a planning/acting loop against a set of tools.
pub struct AgentExecutor {
    agent: Arc<dyn Agent>,
    tools: HashMap<String, Arc<dyn Tool>>,
    max_iterations: Option<usize>,
    max_time: Option<Duration>,
    tool_error_mode: ToolErrorMode,
    early_stopping: EarlyStopping,
    return_intermediate_steps: bool,
    memory: Option<Arc<dyn Memory>>,
    callbacks: CallbackManager,
}

impl AgentExecutor {
    pub fn new(agent: Arc<dyn Agent>, tools: Vec<Arc<dyn Tool>>) -> Self {
        let tools = tools
            .into_iter()
            .map(|tool| (tool.name().to_string(), tool))
            .collect();
        AgentExecutor {
            agent,
            tools,
            max_iterations: Some(15),
            max_time: None,
            tool_error_mode: ToolErrorMode::default(),
            early_stopping: EarlyStopping::default(),
            return_intermediate_steps: false,
            memory: None,
            callbacks: callbacks::default_manager(),
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: Option<usize>) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    pub fn with_tool_error_mode(mut self, mode: ToolErrorMode) -> Self {
        self.tool_error_mode = mode;
        self
    }

    pub fn with_early_stopping(mut self, early_stopping: EarlyStopping) -> Self {
        self.early_stopping = early_stopping;
        self
    }

    pub fn with_intermediate_steps(mut self) -> Self {
        self.return_intermediate_steps = true;
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

    fn should_continue(&self, iterations: usize, started: Instant) -> bool {
        if let Some(max) = self.max_iterations {
            if iterations >= max {
                return false;
            }
        }
        if let Some(max) = self.max_time {
            if started.elapsed() >= max {
                return false;
            }
        }
        true
    }

    /// Execute one action. Always produces an observation unless tool
    /// errors are configured fatal; the loop never blocks on a failed
    /// tool.
    async fn execute_action(&self, action: &AgentAction, run: &RunManager) -> Result<String> {
        let Some(tool) = self.tools.get(&action.tool) else {
            return Ok(format!(
                "{} is not a valid tool, try another one.",
                action.tool
            ));
        };

        run.on_tool_start(tool.name(), &action.tool_input).await;
        match tool.invoke(&action.tool_input).await {
            Ok(observation) => {
                run.on_tool_end(&observation).await;
                Ok(observation)
            }
            Err(err) => {
                run.on_tool_error(tool.name(), &err).await;
                match self.tool_error_mode {
                    ToolErrorMode::Fatal => Err(Error::Tool(err)),
                    ToolErrorMode::Recover => {
                        Ok(format!("Tool '{}' failed: {}", tool.name(), err))
                    }
                }
            }
        }
    }

    async fn finish(
        &self,
        finish: AgentFinish,
        steps: Vec<AgentStep>,
        run: &RunManager,
    ) -> Result<ChainValues> {
        run.on_agent_finish(&finish).await;
        let mut values = finish.return_values;
        if self.return_intermediate_steps {
            values.insert(
                "intermediate_steps".to_string(),
                serde_json::to_value(&steps)
                    .map_err(|err| Error::Validation(err.to_string()))?,
            );
        }
        Ok(values)
    }
}

#[async_trait]
impl Chain for AgentExecutor {
    fn chain_type(&self) -> &'static str {
        "agent_executor"
    }

    fn input_keys(&self) -> Vec<String> {
        self.agent.input_keys()
    }

    fn output_keys(&self) -> Vec<String> {
        vec!["output".to_string()]
    }

    fn memory(&self) -> Option<&dyn Memory> {
        self.memory.as_deref()
    }

    fn callbacks(&self) -> CallbackManager {
        self.callbacks.clone()
    }

    async fn call_inner(&self, values: &ChainValues, run: &RunManager) -> Result<ChainValues> {
        let started = Instant::now();
        let mut steps: Vec<AgentStep> = Vec::new();
        let mut iterations = 0usize;

        while self.should_continue(iterations, started) {
            let decision = match self.agent.plan(&steps, values, run).await {
                Ok(decision) => decision,
                Err(Error::Parse { message, raw }) => {
                    // Recoverable: feed the failure back so the model can
                    // correct itself on the next planning step.
                    let action = AgentAction {
                        tool: "_exception".to_string(),
                        tool_input: String::new(),
                        log: raw,
                        message_log: Vec::new(),
                    };
                    run.on_agent_action(&action).await;
                    steps.push(AgentStep {
                        action,
                        observation: format!("Could not parse tool invocation: {message}"),
                    });
                    iterations += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match decision {
                AgentDecision::Finish(finish) => {
                    return self.finish(finish, steps, run).await;
                }
                AgentDecision::Act(actions) => {
                    for action in actions {
                        run.on_agent_action(&action).await;
                        let observation = self.execute_action(&action, run).await?;
                        steps.push(AgentStep {
                            action,
                            observation,
                        });
                    }
                }
            }
            iterations += 1;
        }

        // Budget exhausted.
        let finish = match self.early_stopping {
            EarlyStopping::Force => AgentFinish::stopped(),
            EarlyStopping::Generate => self.agent.plan_finish(&steps, values, run).await?,
        };
        self.finish(finish, steps, run).await
    }
}
