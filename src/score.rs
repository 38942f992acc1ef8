//! Classification result and human-likelihood scoring.

use crate::config::ScoreWeights;
use crate::detectors::{HeaderAnalyzer, RequestContext, UserAgentAnalyzer};
use crate::patterns::PatternSet;
use serde::{Deserialize, Serialize};

/// Signals computed for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// User-Agent matched a bot signature
    pub known_bot: bool,

    /// The matching signature, as `/pattern/flags`
    pub matched_pattern: Option<String>,

    /// Points from browser-typical headers
    pub human_score: u32,

    /// Score met the threshold or the User-Agent has a browser engine token
    pub likely_human: bool,

    /// Prefetch, preview or prerender fetch
    pub is_preview_fetch: bool,

    /// HEAD without a referer
    pub suspicious_head: bool,
}

/// Combines the header and User-Agent detectors into a [`Classification`].
///
/// Classification is a pure function of the context and the pattern set.
#[derive(Debug, Clone)]
pub struct HeuristicClassifier {
    headers: HeaderAnalyzer,
    user_agent: UserAgentAnalyzer,
    human_threshold: u32,
}

impl HeuristicClassifier {
    pub fn new(weights: ScoreWeights, human_threshold: u32) -> Self {
        Self {
            headers: HeaderAnalyzer::new(weights),
            user_agent: UserAgentAnalyzer::new(),
            human_threshold,
        }
    }

    pub fn human_threshold(&self) -> u32 {
        self.human_threshold
    }

    /// Whether a score alone is enough to present as human.
    pub fn score_sufficient(&self, score: u32) -> bool {
        score >= self.human_threshold
    }

    pub fn classify(&self, ctx: &RequestContext, patterns: &PatternSet) -> Classification {
        let matched = self.user_agent.known_bot(&ctx.user_agent, patterns);
        let human_score = self.headers.human_score(ctx);
        let likely_human = self.score_sufficient(human_score)
            || self.user_agent.has_engine_token(&ctx.user_agent);

        Classification {
            known_bot: matched.is_some(),
            matched_pattern: matched.map(|e| format!("/{}/{}", e.pattern(), e.flags().as_str())),
            human_score,
            likely_human,
            is_preview_fetch: self.headers.is_preview_fetch(ctx),
            suspicious_head: self.headers.is_suspicious_head(ctx),
        }
    }
}

impl Default for HeuristicClassifier {
    fn default() -> Self {
        Self::new(ScoreWeights::default(), 3)
    }
}
