use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{Backend, BackendReply, CompletionRequest};
use crate::models::generation::Usage;
use crate::models::message::Message;

/// A backend that replays pre-configured messages, for tests.
///
/// Records every request it sees so tests can assert how many backend
/// calls (and batch sub-calls) actually happened.
#[derive(Default)]
pub struct MockBackend {
    replies: Mutex<Vec<Message>>,
    requests: Mutex<Vec<CompletionRequest>>,
    batches: AtomicUsize,
}

impl MockBackend {
    /// Create a new mock backend with a sequence of replies
    pub fn new(replies: Vec<Message>) -> Self {
        Self {
            replies: Mutex::new(replies),
            requests: Mutex::new(Vec::new()),
            batches: AtomicUsize::new(0),
        }
    }

    /// Number of individual completions served so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Number of batch sub-calls served so far.
    pub fn batch_count(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_reply(&self) -> Message {
        let mut replies = self.replies.lock().unwrap();
        if replies.is_empty() {
            // Keep replying once the script runs out, like a model would
            Message::assistant().with_text("")
        } else {
            replies.remove(0)
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<BackendReply> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(BackendReply {
            message: self.next_reply(),
            usage: Usage::default(),
            generation_info: None,
        })
    }

    async fn complete_batch(
        &self,
        requests: &[CompletionRequest],
    ) -> Result<Vec<BackendReply>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        // Sequential on purpose: the scripted replies must pop in input
        // order.
        let mut replies = Vec::with_capacity(requests.len());
        for request in requests {
            replies.push(self.complete(request).await?);
        }
        Ok(replies)
    }
}
