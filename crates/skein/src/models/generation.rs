use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::message::Message;

/// One candidate output of a model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// The generated text, concatenated across content blocks.
    pub text: String,
    /// The full message, when the backend produced one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    /// Arbitrary backend-specific info, e.g. the finish reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_info: Option<Value>,
}

impl Generation {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Generation {
            text: text.into(),
            message: None,
            generation_info: None,
        }
    }

    pub fn from_message(message: Message) -> Self {
        Generation {
            text: message.text(),
            message: Some(message),
            generation_info: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.generation_info = Some(info);
        self
    }
}

/// An incremental fragment of a generation produced while streaming.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationChunk {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_info: Option<Value>,
}

impl GenerationChunk {
    pub fn new<S: Into<String>>(text: S) -> Self {
        GenerationChunk {
            text: text.into(),
            generation_info: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.generation_info = Some(info);
        self
    }

    /// Append a later fragment in arrival order. The latest non-empty
    /// generation info wins, matching how backends report a finish reason
    /// only on the final fragment.
    pub fn merge(&mut self, other: &GenerationChunk) {
        self.text.push_str(&other.text);
        if other.generation_info.is_some() {
            self.generation_info = other.generation_info.clone();
        }
    }
}

impl From<GenerationChunk> for Generation {
    fn from(chunk: GenerationChunk) -> Self {
        Generation {
            text: chunk.text,
            message: None,
            generation_info: chunk.generation_info,
        }
    }
}

/// Token accounting reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    pub total_tokens: Option<i32>,
}

impl Usage {
    pub fn new(
        input_tokens: Option<i32>,
        output_tokens: Option<i32>,
        total_tokens: Option<i32>,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens,
        }
    }

    /// Sum two usage reports, treating a missing count as zero only when the
    /// other side has one.
    pub fn add(&self, other: &Usage) -> Usage {
        fn sum(a: Option<i32>, b: Option<i32>) -> Option<i32> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
            }
        }
        Usage {
            input_tokens: sum(self.input_tokens, other.input_tokens),
            output_tokens: sum(self.output_tokens, other.output_tokens),
            total_tokens: sum(self.total_tokens, other.total_tokens),
        }
    }
}

/// The rectangular result of one generate call: one inner list of candidate
/// generations per input prompt, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmResult {
    pub generations: Vec<Vec<Generation>>,
    /// Aggregate backend output for the call, e.g. token usage totals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_output: Option<Value>,
    /// Correlation id of the run that produced this result. Attached for
    /// observers; not part of the serialized shape.
    #[serde(skip)]
    pub run_id: Option<Uuid>,
}

impl LlmResult {
    /// The text of the first generation for the first prompt, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.generations
            .first()
            .and_then(|generations| generations.first())
            .map(|generation| generation.text.as_str())
    }
}
