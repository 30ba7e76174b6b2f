//! Dot-separated topic names and subscription patterns.
//!
//! `*` matches exactly one token, `>` matches one or more trailing tokens.

use anyhow::{anyhow, Result};

pub const DEFAULT_TOPIC_PREFIX: &str = "stream";

/// A single topic token: non-empty, no separators, wildcards or whitespace.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}

pub fn validate_pattern(pattern: &str) -> Result<()> {
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (idx, token) in tokens.iter().enumerate() {
        match *token {
            "*" => {}
            ">" if idx + 1 == tokens.len() => {}
            ">" => return Err(anyhow!("'>' must be the last token in '{}'", pattern)),
            t if is_valid_token(t) => {}
            _ => return Err(anyhow!("invalid topic pattern '{}'", pattern)),
        }
    }
    Ok(())
}

pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut topic_tokens = topic.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return topic_tokens.next().is_some(),
            "*" => {
                if topic_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if topic_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    topic_tokens.next().is_none()
}
