use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use skein::agent::{AgentExecutor, TagAgent};
use skein::backends::mock::MockBackend;
use skein::backends::ModelParams;
use skein::cache::InMemoryCache;
use skein::callbacks::CallbackManager;
use skein::chain::{Chain, ChainCallOptions, ChainValues, LlmChain};
use skein::memory::BufferMemory;
use skein::model::{CallOptions, ChatModel, Prompt};
use skein::models::message::Message;
use skein::models::tool::ToolSpec;
use skein::prompt::PromptTemplate;
use skein::tools::Tool;
use skein::ToolResult;

struct Calculator;

#[async_trait]
impl Tool for Calculator {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluates simple additions like '2+2'"
    }

    async fn invoke(&self, input: &str) -> ToolResult<String> {
        let sum: i64 = input
            .split('+')
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .sum();
        Ok(sum.to_string())
    }
}

#[tokio::test]
async fn test_generate_caches_identical_calls_end_to_end() {
    let backend = Arc::new(MockBackend::new(vec![Message::assistant().with_text("4")]));
    let model = ChatModel::new(backend.clone(), ModelParams::new("test-model"))
        .with_callbacks(CallbackManager::new())
        .with_cache(Arc::new(InMemoryCache::new()));

    let first = model
        .generate(&[Prompt::text("2+2")], CallOptions::default())
        .await
        .unwrap();
    assert_eq!(first.generations[0][0].text, "4");
    assert_eq!(first.generations.len(), 1);
    assert!(first.llm_output.is_some());

    let second = model
        .generate(&[Prompt::text("2+2")], CallOptions::default())
        .await
        .unwrap();
    assert_eq!(second.generations, first.generations);
    assert_eq!(backend.request_count(), 1);
}

#[tokio::test]
async fn test_conversational_chain_with_memory() {
    let backend = Arc::new(MockBackend::new(vec![
        Message::assistant().with_text("Nice to meet you, Ada."),
        Message::assistant().with_text("Your name is Ada."),
    ]));
    let prompt = PromptTemplate::new(
        "{{ history }}\nHuman: {{ input }}\nAI:",
        vec!["history".to_string(), "input".to_string()],
    );
    let model = ChatModel::new(backend.clone(), ModelParams::new("test-model"))
        .with_callbacks(CallbackManager::new());
    let chain = LlmChain::new(prompt, model)
        .with_callbacks(CallbackManager::new())
        .with_memory(Arc::new(BufferMemory::new().with_input_key("input")));

    chain.run(json!("My name is Ada.")).await.unwrap();
    let answer = chain.run(json!("What is my name?")).await.unwrap();
    assert_eq!(answer, "Your name is Ada.");

    let replay = backend.requests()[1].messages[0].text();
    assert!(replay.contains("Human: My name is Ada."));
    assert!(replay.contains("AI: Nice to meet you, Ada."));
}

#[tokio::test]
async fn test_agent_solves_with_tool_end_to_end() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let backend = Arc::new(MockBackend::new(vec![
        Message::assistant()
            .with_text("<tool>calculator</tool><tool_input>2+2</tool_input>"),
        Message::assistant().with_text("<final_answer>The answer is 4.</final_answer>"),
    ]));

    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(Calculator)];
    let specs: Vec<ToolSpec> = tools.iter().map(|tool| tool.spec()).collect();
    let model = ChatModel::new(backend.clone(), ModelParams::new("test-model"))
        .with_callbacks(CallbackManager::new());
    let executor = AgentExecutor::new(Arc::new(TagAgent::new(model, &specs)), tools)
        .with_callbacks(CallbackManager::new());

    let mut values = ChainValues::new();
    values.insert("input".to_string(), json!("What is 2+2?"));
    let output = executor
        .call(values, ChainCallOptions::default())
        .await
        .unwrap();

    assert_eq!(output.values["output"], json!("The answer is 4."));
    assert_eq!(backend.request_count(), 2);
    let replay = backend.requests()[1].messages[0].text();
    assert!(replay.contains("<observation>4</observation>"));
}
