//! Token estimation.
//!
//! Backends tokenize differently, so this is a deliberately rough
//! character-based estimate: about four characters per token.

use super::Message;

/// Fixed per-message cost for role markers and separators.
pub const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

/// Estimate tokens for a piece of text.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count() / 4) as u32
}

/// Estimate tokens a message occupies in a context window.
pub fn message_tokens(message: &Message) -> u32 {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD_TOKENS
}
