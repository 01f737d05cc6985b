//! The tool contract: a named callable collaborator with a
//! string-in/string-out interface.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::errors::ToolResult;
use crate::models::tool::ToolSpec;

/// A capability the agent loop can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name used in planning output.
    fn name(&self) -> &str;

    /// What the tool does, surfaced to the model.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's input.
    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "input": {"type": "string"}
            },
            "required": ["input"]
        })
    }

    /// The spec offered to the model for this tool.
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(self.name(), self.description(), self.parameters())
    }

    /// Execute the tool and produce an observation.
    async fn invoke(&self, input: &str) -> ToolResult<String>;
}
