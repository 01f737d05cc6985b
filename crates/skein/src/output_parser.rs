//! Parsers that turn raw model text into structured results.
//!
//! Parsers are pure functions of their input text plus configuration, so
//! one instance is safe to reuse across calls. A failure carries the
//! offending text for diagnostics.

use std::marker::PhantomData;

use indoc::indoc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::agent::{AgentAction, AgentDecision, AgentFinish};
use crate::chain::ChainValues;
use crate::errors::{Error, Result};

pub trait OutputParser<T>: Send + Sync {
    fn parse(&self, text: &str) -> Result<T>;

    /// Instructions telling the model how to format its output.
    fn format_instructions(&self) -> String {
        String::new()
    }
}

lazy_static! {
    static ref TOOL_RE: Regex = Regex::new(r"<tool>([\s\S]*?)</tool>").unwrap();
    static ref TOOL_INPUT_RE: Regex = Regex::new(r"<tool_input>([\s\S]*?)</tool_input>").unwrap();
    static ref FINAL_ANSWER_RE: Regex =
        Regex::new(r"<final_answer>([\s\S]*?)</final_answer>").unwrap();
    static ref FENCE_RE: Regex = Regex::new(r"```(?:json)?\s*([\s\S]*?)```").unwrap();
}

/// Parses tag-formatted planning output into actions or a finish.
///
/// Several `<tool>` elements in one reply become parallel actions; a
/// `<tool>` without a matching `<tool_input>` gets an empty input.
#[derive(Debug, Default, Clone, Copy)]
pub struct AgentOutputParser;

impl OutputParser<AgentDecision> for AgentOutputParser {
    fn parse(&self, text: &str) -> Result<AgentDecision> {
        if text.contains("</tool>") {
            let inputs: Vec<&str> = TOOL_INPUT_RE
                .captures_iter(text)
                .filter_map(|captures| captures.get(1))
                .map(|m| m.as_str().trim())
                .collect();
            let actions: Vec<AgentAction> = TOOL_RE
                .captures_iter(text)
                .filter_map(|captures| captures.get(1))
                .enumerate()
                .map(|(index, tool)| AgentAction {
                    tool: tool.as_str().trim().to_string(),
                    tool_input: inputs.get(index).copied().unwrap_or_default().to_string(),
                    log: text.to_string(),
                    message_log: Vec::new(),
                })
                .collect();
            if actions.is_empty() {
                return Err(Error::Parse {
                    message: "found a closing </tool> but no complete <tool> element".to_string(),
                    raw: text.to_string(),
                });
            }
            return Ok(AgentDecision::Act(actions));
        }

        if let Some(captures) = FINAL_ANSWER_RE.captures(text) {
            let answer = captures
                .get(1)
                .map(|m| m.as_str().trim())
                .unwrap_or_default();
            let mut return_values = ChainValues::new();
            return_values.insert("output".to_string(), Value::String(answer.to_string()));
            return Ok(AgentDecision::Finish(AgentFinish {
                return_values,
                log: text.to_string(),
            }));
        }

        Err(Error::Parse {
            message: "expected a <tool> or <final_answer> element".to_string(),
            raw: text.to_string(),
        })
    }

    fn format_instructions(&self) -> String {
        indoc! {r#"
            To use a tool, reply with a <tool></tool> element holding the tool
            name and a <tool_input></tool_input> element holding the input.
            When you know the final answer, reply with it inside a
            <final_answer></final_answer> element."#}
        .to_string()
    }
}

fn extract_json(text: &str) -> &str {
    if let Some(captures) = FENCE_RE.captures(text) {
        if let Some(body) = captures.get(1) {
            return body.as_str().trim();
        }
    }
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text.trim(),
    }
}

/// Deserializes a JSON object (bare or fenced) into the declared shape.
///
/// A mismatch reports both the raw text and the shape violation.
pub struct JsonOutputParser<T> {
    marker: PhantomData<fn() -> T>,
}

impl<T> Default for JsonOutputParser<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonOutputParser<T> {
    pub fn new() -> Self {
        JsonOutputParser {
            marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> OutputParser<T> for JsonOutputParser<T> {
    fn parse(&self, text: &str) -> Result<T> {
        let candidate = extract_json(text);
        serde_json::from_str(candidate).map_err(|err| Error::Parse {
            message: format!("output does not match the expected shape: {err}"),
            raw: text.to_string(),
        })
    }

    fn format_instructions(&self) -> String {
        "Reply with a single JSON object matching the requested shape.".to_string()
    }
}
