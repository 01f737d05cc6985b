//! The model call path: option resolution, caching, callbacks,
//! cancellation, streaming and bounded batch fan-out around one inference
//! backend.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backends::{Backend, CompletionRequest, ModelParams};
use crate::cache::Cache;
use crate::callbacks::{self, CallbackManager};
use crate::errors::{Error, Result};
use crate::models::generation::{Generation, GenerationChunk, LlmResult, Usage};
use crate::models::message::Message;
use crate::models::tool::ToolSpec;
use crate::prompt::buffer_string;

/// Input to one model call: an ordered message transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub messages: Vec<Message>,
}

impl Prompt {
    /// A prompt holding a single user message.
    pub fn text<S: Into<String>>(text: S) -> Self {
        Prompt {
            messages: vec![Message::user().with_text(text)],
        }
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Prompt { messages }
    }

    /// Human-readable transcript, used for callback payloads.
    pub fn render(&self) -> String {
        buffer_string(&self.messages)
    }

    /// Deterministic cache identity: roles and content only, no
    /// timestamps.
    pub fn cache_string(&self) -> String {
        let mut out = String::new();
        for message in &self.messages {
            out.push_str(message.role.as_str());
            out.push(':');
            out.push_str(&serde_json::to_string(&message.content).unwrap_or_default());
            out.push('\n');
        }
        out
    }
}

/// Call-site overrides merged over the model's instance defaults.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub stop: Option<Vec<String>>,
    pub timeout: Option<Duration>,
    pub signal: Option<CancellationToken>,
    pub callbacks: Option<CallbackManager>,
}

/// Explicit retry configuration for backend failures. Nothing is retried
/// unless configured here.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 0,
            backoff: Duration::from_millis(500),
        }
    }
}

/// A token that cancels itself once the timeout elapses.
pub(crate) fn deadline_token(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        trigger.cancel();
    });
    token
}

/// A language model: one inference backend plus the surrounding call
/// machinery (cache, callbacks, retries, cancellation).
pub struct ChatModel {
    backend: Arc<dyn Backend>,
    params: ModelParams,
    system: Option<String>,
    tools: Vec<ToolSpec>,
    cache: Option<Arc<dyn Cache>>,
    callbacks: CallbackManager,
    retry: RetryPolicy,
    timeout: Option<Duration>,
}

impl ChatModel {
    pub fn new(backend: Arc<dyn Backend>, params: ModelParams) -> Self {
        ChatModel {
            backend,
            params,
            system: None,
            tools: Vec::new(),
            cache: None,
            callbacks: callbacks::default_manager(),
            retry: RetryPolicy::default(),
            timeout: None,
        }
    }

    pub fn with_system<S: Into<String>>(mut self, system: S) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_callbacks(mut self, callbacks: CallbackManager) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    /// Merge call-site overrides with instance defaults. A timeout with no
    /// supplied signal derives one.
    fn resolve(
        &self,
        opts: &CallOptions,
    ) -> (ModelParams, Option<CancellationToken>, CallbackManager) {
        let mut params = self.params.clone();
        if let Some(stop) = &opts.stop {
            params.stop = stop.clone();
        }
        let signal = match (&opts.signal, opts.timeout.or(self.timeout)) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(timeout)) => Some(deadline_token(timeout)),
            (None, None) => None,
        };
        let callbacks = CallbackManager::configure(opts.callbacks.as_ref(), &self.callbacks);
        (params, signal, callbacks)
    }

    /// Run the model on the given prompts, handling caching.
    ///
    /// Cached and freshly generated results are interleaved back into their
    /// original positions; prompts that miss the cache are batched into a
    /// single backend sub-call.
    pub async fn generate(&self, prompts: &[Prompt], opts: CallOptions) -> Result<LlmResult> {
        if prompts.is_empty() {
            return Err(Error::Validation(
                "generate requires at least one prompt".to_string(),
            ));
        }

        let (params, signal, callbacks) = self.resolve(&opts);
        let run = callbacks.start_run();
        let rendered: Vec<String> = prompts.iter().map(Prompt::render).collect();
        run.on_llm_start(&params.model, &rendered).await;

        match self.generate_inner(prompts, &params, signal.as_ref()).await {
            Ok(mut result) => {
                result.run_id = Some(run.run_id());
                run.on_llm_end(&result).await;
                Ok(result)
            }
            Err(err) => {
                run.on_llm_error(&err).await;
                Err(err)
            }
        }
    }

    async fn generate_inner(
        &self,
        prompts: &[Prompt],
        params: &ModelParams,
        signal: Option<&CancellationToken>,
    ) -> Result<LlmResult> {
        let Some(cache) = &self.cache else {
            return self.generate_uncached(prompts, params, signal).await;
        };

        let llm_key = params.llm_key();
        let cache_strings: Vec<String> =
            prompts.iter().map(|prompt| prompt.cache_string()).collect();
        let lookups = futures::future::try_join_all(
            cache_strings
                .iter()
                .map(|cache_string| cache.lookup(cache_string, &llm_key)),
        )
        .await?;

        let mut slots: Vec<Option<Vec<Generation>>> = lookups;
        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.is_none().then_some(index))
            .collect();

        let mut llm_output = None;
        if !missing.is_empty() {
            let missing_prompts: Vec<Prompt> =
                missing.iter().map(|&index| prompts[index].clone()).collect();
            let fresh = self
                .generate_uncached(&missing_prompts, params, signal)
                .await?;
            llm_output = fresh.llm_output;
            for (&index, generations) in missing.iter().zip(fresh.generations.into_iter()) {
                cache
                    .update(&prompts[index].cache_string(), &llm_key, &generations)
                    .await?;
                slots[index] = Some(generations);
            }
        }

        Ok(LlmResult {
            generations: slots
                .into_iter()
                .map(|slot| slot.unwrap_or_default())
                .collect(),
            llm_output,
            run_id: None,
        })
    }

    async fn generate_uncached(
        &self,
        prompts: &[Prompt],
        params: &ModelParams,
        signal: Option<&CancellationToken>,
    ) -> Result<LlmResult> {
        let requests: Vec<CompletionRequest> = prompts
            .iter()
            .map(|prompt| self.request_for(prompt, params))
            .collect();

        let replies = match signal {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                replies = self.complete_with_retry(&requests) => replies?,
            },
            None => self.complete_with_retry(&requests).await?,
        };

        let mut usage = Usage::default();
        let mut generations = Vec::with_capacity(replies.len());
        for reply in replies {
            usage = usage.add(&reply.usage);
            let mut generation = Generation::from_message(reply.message);
            generation.generation_info = reply.generation_info;
            generations.push(vec![generation]);
        }

        Ok(LlmResult {
            generations,
            llm_output: Some(json!({ "usage": usage })),
            run_id: None,
        })
    }

    fn request_for(&self, prompt: &Prompt, params: &ModelParams) -> CompletionRequest {
        CompletionRequest {
            params: params.clone(),
            system: self.system.clone(),
            tools: self.tools.clone(),
            messages: prompt.messages.clone(),
        }
    }

    async fn complete_with_retry(
        &self,
        requests: &[CompletionRequest],
    ) -> Result<Vec<crate::backends::BackendReply>> {
        let mut attempt = 0;
        loop {
            match self.backend.complete_batch(requests).await {
                Ok(replies) => return Ok(replies),
                Err(err) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    tracing::warn!(error = %err, attempt, "backend call failed, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(err) => return Err(Error::Backend(err)),
            }
        }
    }

    /// Convenience wrapper for `generate` with a single prompt, returning
    /// the generated text.
    pub async fn invoke(&self, prompt: Prompt, opts: CallOptions) -> Result<String> {
        let result = self.generate(std::slice::from_ref(&prompt), opts).await?;
        Ok(result.first_text().unwrap_or_default().to_string())
    }

    /// Stream one reply as ordered fragments, firing the new-token callback
    /// per fragment. Dropping the stream early releases the transport.
    pub async fn stream(
        &self,
        prompt: Prompt,
        opts: CallOptions,
    ) -> Result<BoxStream<'static, Result<GenerationChunk>>> {
        let (params, signal, callbacks) = self.resolve(&opts);
        let run = callbacks.start_run();
        run.on_llm_start(&params.model, &[prompt.render()]).await;

        let request = self.request_for(&prompt, &params);
        let setup = match &signal {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                inner = self.backend.stream(&request) => inner.map_err(Error::Backend),
            },
            None => self.backend.stream(&request).await.map_err(Error::Backend),
        };
        let mut inner = match setup {
            Ok(inner) => inner,
            Err(err) => {
                run.on_llm_error(&err).await;
                return Err(err);
            }
        };

        Ok(Box::pin(async_stream::stream! {
            let mut assembled = GenerationChunk::default();
            loop {
                let next = match &signal {
                    Some(token) => tokio::select! {
                        _ = token.cancelled() => Some(Err(Error::Cancelled)),
                        next = inner.next() => next.map(|item| item.map_err(Error::Backend)),
                    },
                    None => inner.next().await.map(|item| item.map_err(Error::Backend)),
                };
                match next {
                    Some(Ok(chunk)) => {
                        run.on_llm_new_token(&chunk.text).await;
                        assembled.merge(&chunk);
                        yield Ok(chunk);
                    }
                    Some(Err(err)) => {
                        run.on_llm_error(&err).await;
                        yield Err(err);
                        return;
                    }
                    None => break,
                }
            }
            let result = LlmResult {
                generations: vec![vec![Generation::from(assembled)]],
                llm_output: None,
                run_id: Some(run.run_id()),
            };
            run.on_llm_end(&result).await;
        }))
    }

    /// Run independent generate calls for each prompt with at most
    /// `max_concurrency` in flight; results come back in input order.
    pub async fn batch(
        &self,
        prompts: Vec<Prompt>,
        max_concurrency: usize,
        opts: CallOptions,
    ) -> Result<Vec<LlmResult>> {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let futures: Vec<_> = prompts
            .iter()
            .map(|prompt| {
                let semaphore = Arc::clone(&semaphore);
                let opts = opts.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    self.generate(std::slice::from_ref(prompt), opts).await
                }
            })
            .collect();
        futures::future::join_all(futures).await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::mock::MockBackend;
    use crate::backends::BackendReply;
    use crate::cache::InMemoryCache;
    use crate::callbacks::test_support::CollectingHandler;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn model_with(backend: Arc<MockBackend>) -> ChatModel {
        ChatModel::new(backend, ModelParams::new("test-model").with_temperature(0.0))
            .with_callbacks(CallbackManager::new())
    }

    struct SlowBackend;

    #[async_trait]
    impl Backend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }

        async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<BackendReply> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(BackendReply {
                message: Message::assistant().with_text("too late"),
                usage: Usage::default(),
                generation_info: None,
            })
        }
    }

    struct FlakyBackend {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<BackendReply> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                return Err(anyhow!("transient failure"));
            }
            Ok(BackendReply {
                message: Message::assistant().with_text("recovered"),
                usage: Usage::default(),
                generation_info: None,
            })
        }
    }

    #[tokio::test]
    async fn test_generate_returns_one_generation_per_prompt() {
        let backend = Arc::new(MockBackend::new(vec![
            Message::assistant().with_text("4"),
            Message::assistant().with_text("6"),
        ]));
        let model = model_with(backend);

        let result = model
            .generate(
                &[Prompt::text("2+2"), Prompt::text("3+3")],
                CallOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.generations.len(), 2);
        assert_eq!(result.generations[0][0].text, "4");
        assert_eq!(result.generations[1][0].text, "6");
        assert!(result.run_id.is_some());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let backend = Arc::new(MockBackend::new(vec![Message::assistant().with_text("4")]));
        let cache = Arc::new(InMemoryCache::new());
        let model = model_with(backend.clone()).with_cache(cache);

        let first = model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap();
        let second = model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap();

        assert_eq!(backend.request_count(), 1);
        assert_eq!(first.generations, second.generations);
        assert_eq!(second.generations[0][0].text, "4");
    }

    #[tokio::test]
    async fn test_parameter_change_is_a_cache_miss() {
        let backend = Arc::new(MockBackend::new(vec![
            Message::assistant().with_text("4"),
            Message::assistant().with_text("4!"),
        ]));
        let cache: Arc<InMemoryCache> = Arc::new(InMemoryCache::new());

        let cold = ChatModel::new(
            backend.clone(),
            ModelParams::new("test-model").with_temperature(0.0),
        )
        .with_callbacks(CallbackManager::new())
        .with_cache(cache.clone());
        cold.generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap();

        let warm = ChatModel::new(
            backend.clone(),
            ModelParams::new("test-model").with_temperature(0.5),
        )
        .with_callbacks(CallbackManager::new())
        .with_cache(cache);
        warm.generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap();

        assert_eq!(backend.request_count(), 2);
    }

    #[tokio::test]
    async fn test_misses_are_batched_and_interleaved_in_order() {
        let backend = Arc::new(MockBackend::new(vec![
            Message::assistant().with_text("cached-later"),
            Message::assistant().with_text("fresh-x"),
            Message::assistant().with_text("fresh-y"),
        ]));
        let cache = Arc::new(InMemoryCache::new());
        let model = model_with(backend.clone()).with_cache(cache);

        // Prime the cache for the middle prompt.
        model
            .generate(&[Prompt::text("a")], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(backend.batch_count(), 1);

        let result = model
            .generate(
                &[Prompt::text("x"), Prompt::text("a"), Prompt::text("y")],
                CallOptions::default(),
            )
            .await
            .unwrap();

        // The two misses went out as one backend sub-call.
        assert_eq!(backend.batch_count(), 2);
        assert_eq!(result.generations[0][0].text, "fresh-x");
        assert_eq!(result.generations[1][0].text, "cached-later");
        assert_eq!(result.generations[2][0].text, "fresh-y");
    }

    #[tokio::test]
    async fn test_cache_hit_still_fires_start_and_end() {
        let backend = Arc::new(MockBackend::new(vec![Message::assistant().with_text("4")]));
        let cache = Arc::new(InMemoryCache::new());
        let handler = Arc::new(CollectingHandler::default());
        let model = ChatModel::new(backend, ModelParams::new("test-model"))
            .with_cache(cache)
            .with_callbacks(CallbackManager::with_handler(handler.clone()));

        model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap();
        model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap();

        assert_eq!(handler.count("llm_start"), 2);
        assert_eq!(handler.count("llm_end"), 2);
        assert_eq!(handler.count("llm_error"), 0);
    }

    #[tokio::test]
    async fn test_backend_failure_fires_error_not_end() {
        let handler = Arc::new(CollectingHandler::default());
        let model = ChatModel::new(
            Arc::new(FlakyBackend {
                failures: AtomicUsize::new(usize::MAX),
            }),
            ModelParams::new("test-model"),
        )
        .with_callbacks(CallbackManager::with_handler(handler.clone()));

        let err = model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert_eq!(handler.count("llm_error"), 1);
        assert_eq!(handler.count("llm_end"), 0);
    }

    #[tokio::test]
    async fn test_failure_leaves_cache_unwritten() {
        let cache = Arc::new(InMemoryCache::new());
        let model = ChatModel::new(
            Arc::new(FlakyBackend {
                failures: AtomicUsize::new(usize::MAX),
            }),
            ModelParams::new("test-model"),
        )
        .with_callbacks(CallbackManager::new())
        .with_cache(cache.clone());

        let _ = model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await;
        let key = model.params().llm_key();
        assert_eq!(
            cache
                .lookup(&Prompt::text("2+2").cache_string(), &key)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_timeout_derives_cancellation() {
        let model = ChatModel::new(Arc::new(SlowBackend), ModelParams::new("test-model"))
            .with_callbacks(CallbackManager::new())
            .with_timeout(Duration::from_millis(50));

        let err = model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_explicit_signal_cancels() {
        let token = CancellationToken::new();
        token.cancel();
        let model = ChatModel::new(Arc::new(SlowBackend), ModelParams::new("test-model"))
            .with_callbacks(CallbackManager::new());

        let err = model
            .generate(
                &[Prompt::text("2+2")],
                CallOptions {
                    signal: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_retry_policy_recovers_configured_failures() {
        let model = ChatModel::new(
            Arc::new(FlakyBackend {
                failures: AtomicUsize::new(2),
            }),
            ModelParams::new("test-model"),
        )
        .with_callbacks(CallbackManager::new())
        .with_retry(RetryPolicy {
            max_retries: 2,
            backoff: Duration::from_millis(1),
        });

        let result = model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .unwrap();
        assert_eq!(result.generations[0][0].text, "recovered");
    }

    #[tokio::test]
    async fn test_no_retry_by_default() {
        let model = ChatModel::new(
            Arc::new(FlakyBackend {
                failures: AtomicUsize::new(1),
            }),
            ModelParams::new("test-model"),
        )
        .with_callbacks(CallbackManager::new());

        assert!(model
            .generate(&[Prompt::text("2+2")], CallOptions::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_batch_preserves_input_order_at_any_concurrency() {
        let prompts: Vec<Prompt> = (0..4).map(|i| Prompt::text(format!("p{i}"))).collect();
        let replies: Vec<Message> = (0..4)
            .map(|i| Message::assistant().with_text(format!("r{i}")))
            .collect();

        let serial_backend = Arc::new(MockBackend::new(replies.clone()));
        let serial = model_with(serial_backend)
            .batch(prompts.clone(), 1, CallOptions::default())
            .await
            .unwrap();

        let concurrent_backend = Arc::new(MockBackend::new(replies));
        let concurrent = model_with(concurrent_backend)
            .batch(prompts, 4, CallOptions::default())
            .await
            .unwrap();

        let texts = |results: &[LlmResult]| {
            results
                .iter()
                .map(|result| result.first_text().unwrap_or_default().to_string())
                .collect::<Vec<_>>()
        };
        assert_eq!(texts(&serial), vec!["r0", "r1", "r2", "r3"]);
        assert_eq!(texts(&serial), texts(&concurrent));
    }

    #[tokio::test]
    async fn test_stream_emits_tokens_and_end() {
        let handler = Arc::new(CollectingHandler::default());
        let backend = Arc::new(MockBackend::new(vec![Message::assistant().with_text("4")]));
        let model = ChatModel::new(backend, ModelParams::new("test-model"))
            .with_callbacks(CallbackManager::with_handler(handler.clone()));

        let mut stream = model
            .stream(Prompt::text("2+2"), CallOptions::default())
            .await
            .unwrap();
        let mut assembled = GenerationChunk::default();
        while let Some(chunk) = stream.next().await {
            assembled.merge(&chunk.unwrap());
        }

        assert_eq!(assembled.text, "4");
        assert_eq!(handler.count("token:4"), 1);
        assert_eq!(handler.count("llm_end"), 1);
        assert_eq!(handler.count("llm_error"), 0);
    }

    #[tokio::test]
    async fn test_invoke_returns_first_text() {
        let backend = Arc::new(MockBackend::new(vec![Message::assistant().with_text("4")]));
        let model = model_with(backend);
        let text = model
            .invoke(Prompt::text("2+2"), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "4");
    }
}
