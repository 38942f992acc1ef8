//! Bot-signature patterns.
//!
//! Signatures arrive as untrusted text from a remote document. Each one is
//! compiled on its own; a signature that cannot be compiled is dropped
//! without affecting the rest of the batch.

pub mod source;
pub mod store;

pub use source::{HttpPatternSource, PatternSource, SourceError};
pub use store::PatternStore;

use regex::{Regex, RegexBuilder, RegexSet, RegexSetBuilder};
use serde::Deserialize;
use std::collections::HashSet;
use tracing::debug;

/// Compiled program size limit for a single signature.
const PATTERN_SIZE_LIMIT: usize = 256 * 1024;

/// Well-known bot, crawler and link-preview identifiers that are always
/// matched, even when the remote document is empty or unreachable.
const BUILTIN_SIGNATURES: &[&str] = &[
    "bot",
    "crawl",
    "spider",
    "slurp",
    "googlebot",
    "bingbot",
    "yandex",
    "baiduspider",
    "duckduckbot",
    "telegrambot",
    "twitterbot",
    "facebookexternalhit",
    "facebot",
    "linkedinbot",
    "slackbot",
    "discordbot",
    "whatsapp",
    "skypeuripreview",
    "vkshare",
    "embedly",
    "pinterest",
    "redditbot",
    "applebot",
    "headlesschrome",
    "phantomjs",
    "curl/",
    "wget/",
    "python-requests",
    "python-urllib",
    "go-http-client",
    "okhttp",
    "node-fetch",
    "axios/",
    "libwww-perl",
    "uptimerobot",
    "pingdom",
];

/// Matching flags. Case-insensitive matching is always on.
#[derive(Debug, Clone, Copy, Default, Hash, PartialEq, Eq)]
pub struct PatternFlags {
    /// `m`: `^`/`$` match at line boundaries
    pub multi_line: bool,
    /// `s`: `.` matches newlines
    pub dot_all: bool,
}

impl PatternFlags {
    /// Parse a delimited-notation flag suffix. Flags without a matching
    /// equivalent (`g`, `u`, `y`, `d`, `v`) are accepted and ignored; any
    /// other character makes the suffix invalid.
    fn parse(suffix: &str) -> Option<Self> {
        let mut flags = Self::default();
        for c in suffix.chars() {
            match c {
                'i' | 'g' | 'u' | 'y' | 'd' | 'v' => {}
                'm' => flags.multi_line = true,
                's' => flags.dot_all = true,
                _ => return None,
            }
        }
        Some(flags)
    }

    /// Canonical flag string used in the identity key.
    pub fn as_str(&self) -> &'static str {
        match (self.multi_line, self.dot_all) {
            (false, false) => "i",
            (true, false) => "im",
            (false, true) => "is",
            (true, true) => "ims",
        }
    }
}

/// Identity of a pattern, used to de-duplicate merged sets.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct PatternKey {
    pub pattern: String,
    pub flags: PatternFlags,
}

/// A compiled bot-signature matcher.
#[derive(Debug, Clone)]
pub struct PatternEntry {
    pattern: String,
    flags: PatternFlags,
    regex: Regex,
}

impl PatternEntry {
    /// Compile a pattern under the given flags.
    pub fn compile(pattern: &str, flags: PatternFlags) -> Option<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(flags.multi_line)
            .dot_matches_new_line(flags.dot_all)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .ok()?;

        Some(Self {
            pattern: pattern.to_string(),
            flags,
            regex,
        })
    }

    /// Interpret a raw signature, trying each [`SignatureForm`] in order.
    pub fn from_signature(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            return None;
        }
        SignatureForm::candidates(raw)
            .into_iter()
            .find_map(|form| form.compile())
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn flags(&self) -> PatternFlags {
        self.flags
    }

    pub fn key(&self) -> PatternKey {
        PatternKey {
            pattern: self.pattern.clone(),
            flags: self.flags,
        }
    }

    pub fn is_match(&self, haystack: &str) -> bool {
        self.regex.is_match(haystack)
    }

    /// Inline-flag form for building a combined [`RegexSet`].
    fn inline(&self) -> String {
        let mut prefix = String::from("(?i");
        if self.flags.multi_line {
            prefix.push('m');
        }
        if self.flags.dot_all {
            prefix.push('s');
        }
        format!("{prefix}:{})", self.pattern)
    }
}

/// The ways a raw signature can be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureForm {
    /// `/body/flags`
    Delimited { body: String, flags: PatternFlags },
    /// The whole text as a pattern
    Bare(String),
    /// The whole text matched literally
    Literal(String),
}

impl SignatureForm {
    /// Interpretations of `raw`, in the order they should be tried.
    pub fn candidates(raw: &str) -> Vec<Self> {
        let mut forms = Vec::with_capacity(3);
        if let Some(rest) = raw.strip_prefix('/') {
            if let Some(last) = rest.rfind('/') {
                if let Some(flags) = PatternFlags::parse(&rest[last + 1..]) {
                    let body = &rest[..last];
                    if !body.is_empty() {
                        forms.push(SignatureForm::Delimited {
                            body: body.to_string(),
                            flags,
                        });
                    }
                }
            }
        }
        forms.push(SignatureForm::Bare(raw.to_string()));
        forms.push(SignatureForm::Literal(regex::escape(raw)));
        forms
    }

    fn compile(self) -> Option<PatternEntry> {
        match self {
            SignatureForm::Delimited { body, flags } => PatternEntry::compile(&body, flags),
            SignatureForm::Bare(pattern) | SignatureForm::Literal(pattern) => {
                PatternEntry::compile(&pattern, PatternFlags::default())
            }
        }
    }
}

/// One element of the remote signature document.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawSignature {
    Text(String),
    Pattern { pattern: String },
    UserAgent { ua: String },
}

impl RawSignature {
    pub fn as_str(&self) -> &str {
        match self {
            RawSignature::Text(s) => s,
            RawSignature::Pattern { pattern } => pattern,
            RawSignature::UserAgent { ua } => ua,
        }
    }
}

/// Compile every usable signature in a fetched document.
///
/// Elements of an unknown shape and signatures that fail every
/// interpretation are skipped.
pub fn compile_signatures(document: &[serde_json::Value]) -> Vec<PatternEntry> {
    document
        .iter()
        .filter_map(|value| {
            let raw = RawSignature::deserialize(value).ok()?;
            let entry = PatternEntry::from_signature(raw.as_str());
            if entry.is_none() {
                debug!(signature = %raw.as_str(), "Dropping uncompilable signature");
            }
            entry
        })
        .collect()
}

/// The built-in minimum signature list.
pub fn builtin_entries() -> Vec<PatternEntry> {
    BUILTIN_SIGNATURES
        .iter()
        .filter_map(|s| PatternEntry::compile(&regex::escape(s), PatternFlags::default()))
        .collect()
}

/// An ordered, de-duplicated set of patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    entries: Vec<PatternEntry>,
    combined: Option<RegexSet>,
}

impl PatternSet {
    /// Build a set, keeping the first entry for each identity key.
    pub fn new(entries: impl IntoIterator<Item = PatternEntry>) -> Self {
        let mut seen = HashSet::new();
        let entries: Vec<PatternEntry> = entries
            .into_iter()
            .filter(|e| seen.insert(e.key()))
            .collect();

        let combined = if entries.is_empty() {
            None
        } else {
            RegexSetBuilder::new(entries.iter().map(PatternEntry::inline))
                .size_limit(PATTERN_SIZE_LIMIT * 64)
                .build()
                .ok()
        };

        Self { entries, combined }
    }

    /// Merge the built-in list with fetched entries.
    pub fn merged(builtin: &[PatternEntry], fetched: Vec<PatternEntry>) -> Self {
        Self::new(builtin.iter().cloned().chain(fetched))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PatternEntry> {
        self.entries.iter()
    }

    /// First entry matching `user_agent`, if any.
    pub fn find_match(&self, user_agent: &str) -> Option<&PatternEntry> {
        match &self.combined {
            Some(set) => set
                .matches(user_agent)
                .iter()
                .next()
                .and_then(|i| self.entries.get(i)),
            None => self.entries.iter().find(|e| e.is_match(user_agent)),
        }
    }
}
