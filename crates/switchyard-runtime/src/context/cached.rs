//! Read-through cache over any context store.
//!
//! Reads are served from a moka cache when possible. Successful appends
//! replace the cached entry with the store's returned context unless a newer
//! version is already cached; conflicts invalidate it so the next read goes
//! to the store.

use async_trait::async_trait;
use moka::future::Cache;
use moka::ops::compute::Op;
use std::time::Duration;

use switchyard_core::{ConversationContext, Message};

use super::{ContextError, ContextStore};

/// Caching wrapper around a [`ContextStore`].
pub struct CachedContextStore<S> {
    inner: S,
    cache: Cache<String, ConversationContext>,
}

impl<S: ContextStore> CachedContextStore<S> {
    pub fn new(inner: S, max_entries: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self { inner, cache }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Drop every cached conversation.
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Cache `context` unless a newer version is already cached.
    ///
    /// Concurrent appends may finish out of order; the cached version must
    /// never move backwards.
    async fn remember_newer(&self, conversation_id: &str, context: &ConversationContext) {
        self.cache
            .entry_by_ref(conversation_id)
            .and_compute_with(|cached| {
                let op = match cached {
                    Some(entry) if entry.value().version >= context.version => Op::Nop,
                    _ => Op::Put(context.clone()),
                };
                std::future::ready(op)
            })
            .await;
    }
}

impl<S: ContextStore + Default> Default for CachedContextStore<S> {
    fn default() -> Self {
        Self::new(S::default(), 10_000, Duration::from_secs(3600))
    }
}

#[async_trait]
impl<S: ContextStore> ContextStore for CachedContextStore<S> {
    async fn get_or_create(
        &self,
        conversation_id: &str,
        project_id: Option<&str>,
    ) -> Result<ConversationContext, ContextError> {
        if let Some(context) = self.cache.get(conversation_id).await {
            return Ok(context);
        }
        let context = self.inner.get_or_create(conversation_id, project_id).await?;
        self.cache
            .insert(conversation_id.to_string(), context.clone())
            .await;
        Ok(context)
    }

    async fn append_all(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        expected_version: u64,
    ) -> Result<ConversationContext, ContextError> {
        match self
            .inner
            .append_all(conversation_id, messages, expected_version)
            .await
        {
            Ok(context) => {
                self.remember_newer(conversation_id, &context).await;
                Ok(context)
            }
            Err(e) => {
                self.cache.invalidate(conversation_id).await;
                Err(e)
            }
        }
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationContext>, ContextError> {
        if let Some(context) = self.cache.get(conversation_id).await {
            return Ok(Some(context));
        }
        let context = self.inner.load(conversation_id).await?;
        if let Some(context) = &context {
            self.cache
                .insert(conversation_id.to_string(), context.clone())
                .await;
        }
        Ok(context)
    }
}
