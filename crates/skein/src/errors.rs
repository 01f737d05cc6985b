use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failure raised by a tool invocation.
///
/// Tool failures are data, not control flow: they are embedded in message
/// content and fed back to the model as observations, so the type is
/// serializable and comparable.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid tool input: {0}")]
    InvalidInput(String),

    #[error("Tool execution failed: {0}")]
    Execution(String),
}

pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Error taxonomy for the execution core.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed configuration or missing required input keys.
    /// Raised before any network call is made.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The inference backend call itself failed, or a cache/memory backend
    /// returned an error that is not a miss.
    #[error("Backend error: {0}")]
    Backend(anyhow::Error),

    /// Model output did not match the expected shape. Carries the raw text
    /// for diagnostics.
    #[error("Failed to parse model output: {message}")]
    Parse { message: String, raw: String },

    /// The operation was aborted via a cancellation signal or timeout.
    #[error("Operation was cancelled")]
    Cancelled,

    /// A tool failed and the executor is configured to treat tool errors as
    /// fatal.
    #[error(transparent)]
    Tool(#[from] ToolError),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Backend(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_error_round_trip() {
        let err = ToolError::NotFound("calculator".to_string());
        let serialized = serde_json::to_string(&err).unwrap();
        let deserialized: ToolError = serde_json::from_str(&serialized).unwrap();
        assert_eq!(err, deserialized);
    }

    #[test]
    fn test_parse_error_keeps_raw_text() {
        let err = Error::Parse {
            message: "expected a <tool> element".to_string(),
            raw: "gibberish".to_string(),
        };
        match err {
            Error::Parse { raw, .. } => assert_eq!(raw, "gibberish"),
            _ => panic!("expected parse error"),
        }
    }
}
