//! Read-time context windowing.

use super::{message_tokens, ConversationContext};

/// Project a context onto a token budget.
///
/// Pinned messages are kept first, newest first, until they alone would
/// exceed the budget. The remaining budget goes to the most recent
/// non-pinned messages; the walk stops at the first message that does not
/// fit, so the kept history is always a contiguous recent tail. Original
/// order is preserved in the result.
///
/// The input is never modified. The returned context carries the same id
/// and version as the stored one.
pub fn window(context: &ConversationContext, token_budget: u32) -> ConversationContext {
    let messages = &context.messages;
    let mut keep = vec![false; messages.len()];
    let mut used: u32 = 0;

    for (idx, msg) in messages.iter().enumerate().rev().filter(|(_, m)| m.pinned) {
        let cost = message_tokens(msg);
        if used + cost > token_budget {
            break;
        }
        used += cost;
        keep[idx] = true;
    }

    for (idx, msg) in messages.iter().enumerate().rev().filter(|(_, m)| !m.pinned) {
        let cost = message_tokens(msg);
        if used + cost > token_budget {
            break;
        }
        used += cost;
        keep[idx] = true;
    }

    let kept: Vec<_> = messages
        .iter()
        .zip(keep)
        .filter_map(|(msg, kept)| kept.then(|| msg.clone()))
        .collect();

    if kept.len() < messages.len() {
        tracing::debug!(
            conversation_id = %context.conversation_id,
            kept = kept.len(),
            dropped = messages.len() - kept.len(),
            token_budget,
            "Windowed conversation context"
        );
    }

    ConversationContext {
        messages: kept,
        ..context.clone()
    }
}
