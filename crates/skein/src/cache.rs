//! Generation cache keyed by (prompt, model signature).
//!
//! The key is a deterministic function of the literal prompt text and the
//! model's sorted, serialized identifying parameters, so changing any
//! parameter invalidates the entry. Eviction belongs to the backing store;
//! this layer only performs lookup and update.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::models::generation::Generation;

/// A lookup/update store for generations.
///
/// A lookup that returns `Ok(None)` is a miss; an `Err` is a backend
/// failure and propagates as-is so callers can tell the two apart.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn lookup(&self, prompt: &str, llm_key: &str) -> Result<Option<Vec<Generation>>>;

    async fn update(&self, prompt: &str, llm_key: &str, generations: &[Generation]) -> Result<()>;
}

/// Digest of the (prompt, model signature) pair, usable as a compact store
/// key.
pub fn cache_key(prompt: &str, llm_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(llm_key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Process-local cache over a hash map. No eviction, no single-flight
/// de-duplication: concurrent misses for the same key may both compute and
/// both write, last write wins.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Vec<Generation>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn lookup(&self, prompt: &str, llm_key: &str) -> Result<Option<Vec<Generation>>> {
        let entries = self.entries.lock().await;
        Ok(entries.get(&cache_key(prompt, llm_key)).cloned())
    }

    async fn update(&self, prompt: &str, llm_key: &str, generations: &[Generation]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(cache_key(prompt, llm_key), generations.to_vec());
        Ok(())
    }
}
