//! Conversation context model and read-time windowing.
//!
//! The context itself is durable state owned by a store in
//! `switchyard-runtime`. This module only defines its shape and the pure
//! operations over it.

mod tokens;
mod window;

pub use tokens::{estimate_tokens, message_tokens, MESSAGE_OVERHEAD_TOKENS};
pub use window::window;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: '{}'", other)),
        }
    }
}

/// One entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    pub content: String,

    pub timestamp: DateTime<Utc>,

    /// Pinned messages survive windowing ahead of everything else
    #[serde(default)]
    pub pinned: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            pinned: false,
        }
    }

    /// Create a system message. System messages are pinned.
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content).pinned()
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Mark this message as pinned.
    pub fn pinned(mut self) -> Self {
        self.pinned = true;
        self
    }

    /// Estimated tokens this message costs in a window.
    pub fn tokens(&self) -> u32 {
        message_tokens(self)
    }
}

/// Durable conversation state keyed by `conversation_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,

    #[serde(default)]
    pub project_id: Option<String>,

    /// Ordered history. Only ever appended to through a store.
    #[serde(default)]
    pub messages: Vec<Message>,

    /// Incremented on every mutation; used for optimistic concurrency
    pub version: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    /// Create an empty context at version 0.
    pub fn new(conversation_id: impl Into<String>, project_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            conversation_id: conversation_id.into(),
            project_id,
            messages: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Estimated tokens across the whole history.
    pub fn token_budget_used(&self) -> u32 {
        self.messages.iter().map(message_tokens).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_is_empty_at_version_zero() {
        let ctx = ConversationContext::new("c1", Some("p1".to_string()));
        assert_eq!(ctx.version, 0);
        assert!(ctx.is_empty());
        assert_eq!(ctx.token_budget_used(), 0);
        assert_eq!(ctx.project_id.as_deref(), Some("p1"));
    }

    #[test]
    fn test_system_messages_are_pinned() {
        assert!(Message::system("be terse").pinned);
        assert!(!Message::user("hi").pinned);
        assert!(Message::assistant("noted").pinned().pinned);
    }

    #[test]
    fn test_token_budget_used_sums_messages() {
        let mut ctx = ConversationContext::new("c1", None);
        ctx.messages.push(Message::user("a".repeat(40)));
        ctx.messages.push(Message::assistant("b".repeat(80)));
        // 10 + 4 and 20 + 4
        assert_eq!(ctx.token_budget_used(), 38);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("assistant".parse::<Role>().unwrap(), Role::Assistant);
        assert!("robot".parse::<Role>().is_err());
    }
}
