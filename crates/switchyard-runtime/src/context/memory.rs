//! In-memory context store for tests and ephemeral deployments.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use switchyard_core::{ConversationContext, Message};

use super::{ContextError, ContextStore};

/// Context store backed by a `HashMap`. Contents are lost on drop.
#[derive(Default)]
pub struct MemoryContextStore {
    contexts: RwLock<HashMap<String, ConversationContext>>,
}

impl MemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }
}

#[async_trait]
impl ContextStore for MemoryContextStore {
    async fn get_or_create(
        &self,
        conversation_id: &str,
        project_id: Option<&str>,
    ) -> Result<ConversationContext, ContextError> {
        let mut contexts = self.contexts.write();
        let context = contexts
            .entry(conversation_id.to_string())
            .or_insert_with(|| {
                ConversationContext::new(conversation_id, project_id.map(str::to_string))
            });
        Ok(context.clone())
    }

    async fn append_all(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        expected_version: u64,
    ) -> Result<ConversationContext, ContextError> {
        let mut contexts = self.contexts.write();
        let context = contexts
            .get_mut(conversation_id)
            .ok_or_else(|| ContextError::NotFound(conversation_id.to_string()))?;

        if context.version != expected_version {
            return Err(ContextError::VersionConflict {
                expected: expected_version,
                actual: context.version,
            });
        }

        context.version += messages.len() as u64;
        context.messages.extend(messages);
        context.updated_at = Utc::now();
        Ok(context.clone())
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationContext>, ContextError> {
        Ok(self.contexts.read().get(conversation_id).cloned())
    }
}
