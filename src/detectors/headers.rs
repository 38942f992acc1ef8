//! Header analysis detector.
//!
//! Awards points for headers that browsers reliably send and automated
//! clients rarely do, and flags fetches that are not end-user navigation:
//! - Prefetch/preview/prerender purpose hints
//! - `sec-fetch-dest: empty`
//! - HEAD probes without a referer

use super::RequestContext;
use crate::config::ScoreWeights;

/// Purpose-header values that mark a speculative or preview fetch.
const PREVIEW_PURPOSES: &[&str] = &["prefetch", "preview", "prerender"];

/// Header analyzer detector.
#[derive(Debug, Clone, Default)]
pub struct HeaderAnalyzer {
    weights: ScoreWeights,
}

impl HeaderAnalyzer {
    pub fn new(weights: ScoreWeights) -> Self {
        Self { weights }
    }

    /// Human-likelihood points for the headers present on the request.
    pub fn human_score(&self, ctx: &RequestContext) -> u32 {
        let w = &self.weights;
        let mut score = 0;

        if !ctx.user_agent.trim().is_empty() {
            score += w.user_agent;
        }
        if ctx.accept.is_some() {
            score += w.accept;
        }
        if ctx.accept_language.is_some() {
            score += w.accept_language;
        }
        if ctx.client_hints.is_some() {
            score += w.client_hints;
        }
        if ctx.sec_fetch_site.is_some() {
            score += w.fetch_site;
        }
        if ctx.cookie.is_some() {
            score += w.cookie;
        }

        score
    }

    /// Link-preview and speculative fetchers.
    pub fn is_preview_fetch(&self, ctx: &RequestContext) -> bool {
        let purpose_hint = ctx.purpose.as_deref().is_some_and(|p| {
            let p = p.to_ascii_lowercase();
            PREVIEW_PURPOSES.iter().any(|marker| p.contains(marker))
        });

        let empty_dest = ctx
            .sec_fetch_dest
            .as_deref()
            .is_some_and(|d| d.eq_ignore_ascii_case("empty"));

        purpose_hint || empty_dest
    }

    /// Uptime and crawler probing pattern.
    pub fn is_suspicious_head(&self, ctx: &RequestContext) -> bool {
        ctx.method == "HEAD" && ctx.referer.is_none()
    }
}
