//! Keyword-based task classification.
//!
//! Patterns are checked in a fixed priority order and the first match wins.
//! Keywords match at a word start, so "tests" and "debugging" count but
//! "prefix" does not match "fix".

use lazy_static::lazy_static;
use regex::Regex;

use crate::types::TaskKind;

lazy_static! {
    /// Editing, fixing or reasoning about existing code
    static ref CODE_EDIT_PATTERN: Regex = Regex::new(
        r"(?i)\b(refactor|edit|fix|bug|function|class|import|code|file|module|package|syntax|error|compile|test|debug|implement|rewrite|optimi[sz]e)"
    ).unwrap();

    /// Looking things up or asking for explanations
    static ref RESEARCH_PATTERN: Regex = Regex::new(
        r"(?i)\b(research|find|search|what is|explain|how does|information|article|paper|source|citation|reference|learn about|tell me about|investigate)"
    ).unwrap();

    /// Shell and workflow automation
    static ref TERMINAL_PATTERN: Regex = Regex::new(
        r"(?i)\b(run|execute|command|terminal|shell|script|automate|workflow|cli|bash|zsh)\b"
    ).unwrap();

    /// Producing something new
    static ref GENERATION_PATTERN: Regex = Regex::new(
        r"(?i)\b(generate|create|write|make|build|new|scaffold|boilerplate|template)"
    ).unwrap();
}

/// Classify a payload into a [`TaskKind`].
pub fn classify(payload: &str) -> TaskKind {
    let kind = if CODE_EDIT_PATTERN.is_match(payload) {
        TaskKind::CodeEdit
    } else if RESEARCH_PATTERN.is_match(payload) {
        TaskKind::Research
    } else if TERMINAL_PATTERN.is_match(payload) {
        TaskKind::TerminalAutomation
    } else if GENERATION_PATTERN.is_match(payload) {
        TaskKind::CodeGeneration
    } else {
        TaskKind::GeneralChat
    };

    tracing::trace!(kind = %kind, "Classified task payload");
    kind
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_edit_keywords() {
        assert_eq!(classify("Fix the bug in the login handler"), TaskKind::CodeEdit);
        assert_eq!(classify("Why are my tests failing?"), TaskKind::CodeEdit);
        assert_eq!(classify("please OPTIMIZE this loop"), TaskKind::CodeEdit);
    }

    #[test]
    fn test_research_keywords() {
        assert_eq!(classify("Explain how TCP slow start works"), TaskKind::Research);
        assert_eq!(classify("tell me about the history of Rome"), TaskKind::Research);
    }

    #[test]
    fn test_terminal_keywords() {
        assert_eq!(classify("run the deploy script"), TaskKind::TerminalAutomation);
        assert_eq!(classify("automate my backup workflow"), TaskKind::TerminalAutomation);
    }

    #[test]
    fn test_generation_keywords() {
        assert_eq!(classify("Scaffold a new web service"), TaskKind::CodeGeneration);
        assert_eq!(classify("write a haiku"), TaskKind::CodeGeneration);
    }

    #[test]
    fn test_code_takes_priority_over_generation() {
        // "write" is a generation keyword but "function" wins
        assert_eq!(classify("write a function that sorts"), TaskKind::CodeEdit);
    }

    #[test]
    fn test_keywords_match_at_word_start_only() {
        assert_eq!(classify("add a prefix to greetings"), TaskKind::GeneralChat);
        assert_eq!(classify("the truncated running total"), TaskKind::GeneralChat);
    }

    #[test]
    fn test_fallback_is_general_chat() {
        assert_eq!(classify("hello there"), TaskKind::GeneralChat);
        assert_eq!(classify(""), TaskKind::GeneralChat);
    }
}
