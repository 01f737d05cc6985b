//! Prompt template rendering.

use tera::{Context, Tera};

use crate::chain::ChainValues;
use crate::errors::{Error, Result};
use crate::models::message::Message;
use crate::models::role::Role;

/// A tera template over a declared set of input variables.
///
/// Formatting is a pure function of the template and the supplied values;
/// a missing declared variable is a validation error raised before any
/// model call.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
    input_variables: Vec<String>,
}

impl PromptTemplate {
    pub fn new<S: Into<String>>(template: S, input_variables: Vec<String>) -> Self {
        PromptTemplate {
            template: template.into(),
            input_variables,
        }
    }

    pub fn input_variables(&self) -> &[String] {
        &self.input_variables
    }

    pub fn format(&self, values: &ChainValues) -> Result<String> {
        for variable in &self.input_variables {
            if !values.contains_key(variable) {
                return Err(Error::Validation(format!(
                    "Missing prompt input variable: {variable}"
                )));
            }
        }

        let mut tera = Tera::default();
        tera.add_raw_template("inline_template", &self.template)
            .map_err(|err| Error::Validation(format!("Invalid prompt template: {err}")))?;
        let context = Context::from_serialize(values)
            .map_err(|err| Error::Validation(format!("Invalid prompt inputs: {err}")))?;
        tera.render("inline_template", &context)
            .map_err(|err| Error::Validation(format!("Failed to render prompt: {err}")))
    }
}

/// Render a message transcript as a readable buffer, one line per message.
///
/// This is the conversational form stored by buffer memory and stitched
/// into prompts.
pub fn buffer_string(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            let prefix = match message.role {
                Role::System => "System",
                Role::User => "Human",
                Role::Assistant => "AI",
                Role::Tool => "Tool",
            };
            format!("{}: {}", prefix, message.text())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_renders_variables() {
        let template = PromptTemplate::new(
            "Hello, {{ name }}! You are {{ age }} years old.",
            vec!["name".to_string(), "age".to_string()],
        );
        let mut values = ChainValues::new();
        values.insert("name".to_string(), json!("Alice"));
        values.insert("age".to_string(), json!(30));

        let result = template.format(&values).unwrap();
        assert_eq!(result, "Hello, Alice! You are 30 years old.");
    }

    #[test]
    fn test_format_missing_variable_fails_fast() {
        let template = PromptTemplate::new("Hello, {{ name }}!", vec!["name".to_string()]);
        let err = template.format(&ChainValues::new()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_buffer_string_prefixes_roles() {
        let messages = vec![
            Message::user().with_text("What is 2+2?"),
            Message::assistant().with_text("4"),
        ];
        assert_eq!(buffer_string(&messages), "Human: What is 2+2?\nAI: 4");
    }
}
