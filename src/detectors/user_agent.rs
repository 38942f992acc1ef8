//! User-Agent analysis detector.
//!
//! Matches the User-Agent against the current bot signatures and recognizes
//! the engine tokens real browsers carry.

use crate::patterns::{PatternEntry, PatternSet};

/// Engine tokens that follow the `Mozilla/` product token in browser UAs.
const ENGINE_TOKENS: &[&str] = &[
    "AppleWebKit/",
    "Gecko/",
    "Chrome/",
    "Firefox/",
    "Safari/",
    "Edg/",
];

/// User-Agent analyzer detector.
#[derive(Debug, Clone, Default)]
pub struct UserAgentAnalyzer;

impl UserAgentAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// First signature matching the User-Agent.
    pub fn known_bot<'a>(&self, ua: &str, patterns: &'a PatternSet) -> Option<&'a PatternEntry> {
        if ua.is_empty() {
            return None;
        }
        patterns.find_match(ua)
    }

    /// A `Mozilla/` product token followed by a recognized engine token.
    /// `Mozilla/5.0 (compatible)` alone does not count.
    pub fn has_engine_token(&self, ua: &str) -> bool {
        let Some(idx) = ua.find("Mozilla/") else {
            return false;
        };
        let rest = &ua[idx..];
        ENGINE_TOKENS.iter().any(|token| rest.contains(token))
    }
}
