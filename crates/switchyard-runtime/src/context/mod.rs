//! Durable conversation context.
//!
//! Stores apply optimistic concurrency: every append names the version it
//! was computed against, and a stale version is rejected without touching
//! stored state. No lock is held across a backend call, so conversations
//! never contend with each other.

use async_trait::async_trait;
use thiserror::Error;

use switchyard_core::{ConversationContext, Message};

mod cached;
mod memory;
mod sqlite;

pub use cached::CachedContextStore;
pub use memory::MemoryContextStore;
pub use sqlite::SqliteContextStore;

/// Errors from a context store.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Corrupt stored data: {0}")]
    Corrupt(String),
}

/// Persistence for conversation contexts.
#[async_trait]
pub trait ContextStore: Send + Sync {
    /// Load a conversation, creating an empty one at version 0 if absent.
    ///
    /// Idempotent: an existing conversation is returned unchanged and its
    /// project is not overwritten.
    async fn get_or_create(
        &self,
        conversation_id: &str,
        project_id: Option<&str>,
    ) -> Result<ConversationContext, ContextError>;

    /// Append messages in order, all or none, if the stored version still
    /// equals `expected_version`. The version advances by one per message.
    /// Returns the updated context.
    async fn append_all(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        expected_version: u64,
    ) -> Result<ConversationContext, ContextError>;

    /// Append one message if the stored version still equals
    /// `expected_version`.
    async fn append(
        &self,
        conversation_id: &str,
        message: Message,
        expected_version: u64,
    ) -> Result<ConversationContext, ContextError> {
        self.append_all(conversation_id, vec![message], expected_version)
            .await
    }

    /// Read a conversation without creating it.
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationContext>, ContextError>;
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every store must share.

    use super::*;

    pub async fn get_or_create_is_idempotent(store: &dyn ContextStore) {
        let first = store.get_or_create("c1", Some("proj")).await.unwrap();
        assert_eq!(first.version, 0);
        assert!(first.messages.is_empty());
        assert_eq!(first.project_id.as_deref(), Some("proj"));

        let second = store.get_or_create("c1", Some("other")).await.unwrap();
        assert_eq!(second.version, 0);
        assert_eq!(second.project_id.as_deref(), Some("proj"));
    }

    pub async fn sequential_appends_bump_version(store: &dyn ContextStore) {
        store.get_or_create("c1", None).await.unwrap();

        let v1 = store.append("c1", Message::user("hello"), 0).await.unwrap();
        assert_eq!(v1.version, 1);

        let v2 = store
            .append("c1", Message::assistant("hi there"), 1)
            .await
            .unwrap();
        assert_eq!(v2.version, 2);

        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[0].content, "hello");
        assert_eq!(loaded.messages[1].content, "hi there");
    }

    pub async fn stale_append_conflicts(store: &dyn ContextStore) {
        store.get_or_create("c1", None).await.unwrap();
        store.append("c1", Message::user("first"), 0).await.unwrap();
        let before = store.load("c1").await.unwrap().unwrap();

        for stale in [0, 2, 7] {
            match store.append("c1", Message::user("late"), stale).await {
                Err(ContextError::VersionConflict { expected, actual }) => {
                    assert_eq!(expected, stale);
                    assert_eq!(actual, 1);
                }
                other => panic!("Expected VersionConflict, got {:?}", other),
            }
        }

        let after = store.load("c1").await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.messages, before.messages);
    }

    pub async fn append_all_is_all_or_nothing(store: &dyn ContextStore) {
        store.get_or_create("c1", None).await.unwrap();

        let exchange = vec![Message::user("question"), Message::assistant("answer")];
        let stored = store.append_all("c1", exchange.clone(), 0).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.messages.len(), 2);

        assert!(matches!(
            store.append_all("c1", exchange, 1).await,
            Err(ContextError::VersionConflict {
                expected: 1,
                actual: 2
            })
        ));

        let loaded = store.load("c1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        let contents: Vec<_> = loaded.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["question", "answer"]);
    }

    pub async fn append_to_unknown_is_not_found(store: &dyn ContextStore) {
        assert!(matches!(
            store.append("missing", Message::user("x"), 0).await,
            Err(ContextError::NotFound(_))
        ));
        assert!(store.load("missing").await.unwrap().is_none());
    }

    pub async fn pinned_flag_round_trips(store: &dyn ContextStore) {
        store.get_or_create("c1", None).await.unwrap();
        store
            .append("c1", Message::system("be terse"), 0)
            .await
            .unwrap();

        let loaded = store.load("c1").await.unwrap().unwrap();
        assert!(loaded.messages[0].pinned);
        assert_eq!(loaded.messages[0].role, switchyard_core::Role::System);
    }
}
