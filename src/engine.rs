//! Request decision engine.
//!
//! Rules are evaluated in a fixed priority order and the first one that
//! applies ends evaluation:
//!
//! 1. Empty or missing User-Agent: block.
//! 2. Live bot verdict for the client: block, without classifying.
//! 3. Known bot signature with an insufficient human score: block.
//! 4. Preview fetch, HEAD probe, or a configured policy rule: block.
//! 5. Challenge cookie present: allow.
//! 6. Inconclusive: challenge, unless a pending challenge went unanswered
//!    (block) or the client was recently allowed as human (allow).
//! 7. Otherwise: allow.
//!
//! Only known-bot and unanswered-challenge blocks record a bot verdict for the
//! client; the other blocks apply to the single request. Every block and
//! challenge is also handed to the notification dispatcher.

use crate::cache::{ClientVerdict, VerdictCache, VerdictKind};
use crate::challenge::{ChallengeIssuer, ChallengePage};
use crate::config::{GateConfig, RuleConfig};
use crate::detectors::RequestContext;
use crate::notify::{NotificationDispatcher, NotificationEvent};
use crate::patterns::{HttpPatternSource, PatternStore};
use crate::score::{Classification, HeuristicClassifier};
use ipnet::IpNet;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// What to do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Block,
    Challenge(ChallengePage),
    Allow,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Block => "block",
            Action::Challenge(_) => "challenge",
            Action::Allow => "allow",
        }
    }
}

/// The rule that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    EmptyUserAgent,
    CachedBot,
    KnownBot,
    PreviewFetch,
    SuspiciousHead,
    Ipv6Client,
    BlockedNetwork,
    BlockedMarker,
    ChallengeIgnored,
    Inconclusive,
    ChallengePassed,
    CachedHuman,
    LikelyHuman,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::EmptyUserAgent => "empty_user_agent",
            Reason::CachedBot => "cached_bot",
            Reason::KnownBot => "known_bot",
            Reason::PreviewFetch => "preview_fetch",
            Reason::SuspiciousHead => "suspicious_head",
            Reason::Ipv6Client => "ipv6_client",
            Reason::BlockedNetwork => "blocked_network",
            Reason::BlockedMarker => "blocked_marker",
            Reason::ChallengeIgnored => "challenge_ignored",
            Reason::Inconclusive => "inconclusive",
            Reason::ChallengePassed => "challenge_passed",
            Reason::CachedHuman => "cached_human",
            Reason::LikelyHuman => "likely_human",
        }
    }

    /// Whether the reason describes the client rather than one request.
    /// Only these blocks are remembered in the verdict cache.
    pub fn marks_client(&self) -> bool {
        matches!(self, Reason::KnownBot | Reason::ChallengeIgnored)
    }
}

/// Final outcome for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reason: Reason,
    /// Absent when the request was decided before classification
    pub classification: Option<Classification>,
}

impl Decision {
    pub fn is_block(&self) -> bool {
        matches!(self.action, Action::Block)
    }

    pub fn is_challenge(&self) -> bool {
        matches!(self.action, Action::Challenge(_))
    }

    pub fn is_allow(&self) -> bool {
        matches!(self.action, Action::Allow)
    }
}

/// Decision counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    blocked: AtomicU64,
    challenged: AtomicU64,
    allowed: AtomicU64,
    classifications: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub blocked: u64,
    pub challenged: u64,
    pub allowed: u64,
    pub classifications: u64,
}

impl EngineStats {
    fn record(&self, action: &Action) {
        let counter = match action {
            Action::Block => &self.blocked,
            Action::Challenge(_) => &self.challenged,
            Action::Allow => &self.allowed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            blocked: self.blocked.load(Ordering::Relaxed),
            challenged: self.challenged.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            classifications: self.classifications.load(Ordering::Relaxed),
        }
    }
}

/// Environment-specific block rules.
#[derive(Debug, Clone, Default)]
struct PolicyRules {
    block_ipv6: bool,
    networks: Vec<IpNet>,
    markers: Vec<String>,
}

impl PolicyRules {
    fn new(config: &RuleConfig) -> Self {
        Self {
            block_ipv6: config.block_ipv6,
            networks: config.networks(),
            markers: config
                .blocked_markers
                .iter()
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    fn check(&self, ctx: &RequestContext) -> Option<Reason> {
        if let Some(ip) = ctx.client.ip().map(canonical) {
            if self.block_ipv6 && ip.is_ipv6() {
                return Some(Reason::Ipv6Client);
            }
            if self.networks.iter().any(|net| net.contains(&ip)) {
                return Some(Reason::BlockedNetwork);
            }
        }

        if !self.markers.is_empty() {
            let path = ctx.path.to_ascii_lowercase();
            let referer = ctx.referer.as_deref().unwrap_or_default().to_ascii_lowercase();
            if self
                .markers
                .iter()
                .any(|m| path.contains(m.as_str()) || referer.contains(m.as_str()))
            {
                return Some(Reason::BlockedMarker);
            }
        }

        None
    }
}

/// IPv4-mapped IPv6 addresses compare as IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Orchestrates classification, verdict caching, challenges and
/// notifications into one [`Decision`] per request.
pub struct DecisionEngine {
    patterns: PatternStore,
    classifier: HeuristicClassifier,
    verdicts: VerdictCache,
    challenge: ChallengeIssuer,
    notifier: NotificationDispatcher,
    rules: PolicyRules,
    escalate_unanswered: bool,
    stats: EngineStats,
}

impl DecisionEngine {
    /// Assemble an engine around injected stateful parts; the rest is taken
    /// from `config`.
    pub fn new(
        patterns: PatternStore,
        verdicts: VerdictCache,
        notifier: NotificationDispatcher,
        config: &GateConfig,
    ) -> Self {
        Self {
            patterns,
            classifier: HeuristicClassifier::new(
                config.thresholds.weights.clone(),
                config.thresholds.human_score,
            ),
            verdicts,
            challenge: ChallengeIssuer::new(&config.challenge),
            notifier,
            rules: PolicyRules::new(&config.rules),
            escalate_unanswered: config.challenge.escalate_unanswered,
            stats: EngineStats::default(),
        }
    }

    /// Build the production engine: HTTP pattern source and the configured
    /// notifier. Must be called inside a tokio runtime.
    pub fn from_config(config: &GateConfig) -> anyhow::Result<Self> {
        let source = HttpPatternSource::new(
            config.patterns.source_url.clone(),
            config.patterns.fetch_timeout(),
        )?;
        let patterns = PatternStore::new(Arc::new(source), &config.patterns);
        let verdicts = VerdictCache::new(&config.verdicts);
        let notifier = NotificationDispatcher::from_config(&config.notify)?;

        Ok(Self::new(patterns, verdicts, notifier, config))
    }

    pub fn patterns(&self) -> &PatternStore {
        &self.patterns
    }

    pub fn verdicts(&self) -> &VerdictCache {
        &self.verdicts
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Decide what to do with a request. Never fails.
    pub async fn decide(&self, ctx: &RequestContext) -> Decision {
        let decision = self.evaluate(ctx).await;
        self.stats.record(&decision.action);

        info!(
            client = %ctx.client,
            method = %ctx.method,
            path = %ctx.path,
            action = decision.action.as_str(),
            reason = decision.reason.as_str(),
            human_score = ?decision.classification.as_ref().map(|c| c.human_score),
            "Bot decision"
        );

        if !decision.is_allow() {
            self.notifier.emit(NotificationEvent {
                action: decision.action.as_str().to_string(),
                reason: decision.reason.as_str().to_string(),
                user_agent: ctx.user_agent.clone(),
                client: ctx.client.to_string(),
                method: ctx.method.clone(),
                path: ctx.path.clone(),
                referer: ctx.referer.clone(),
                host: ctx.host.clone(),
            });
        }

        decision
    }

    async fn evaluate(&self, ctx: &RequestContext) -> Decision {
        if ctx.user_agent.trim().is_empty() {
            return self.block(ctx, Reason::EmptyUserAgent, None).await;
        }

        let cached = self.verdicts.lookup(&ctx.client).await;
        if cached.as_ref().is_some_and(ClientVerdict::is_bot) {
            return Decision {
                action: Action::Block,
                reason: Reason::CachedBot,
                classification: None,
            };
        }

        let patterns = self.patterns.get_patterns().await;
        let classification = self.classifier.classify(ctx, &patterns);
        self.stats.classifications.fetch_add(1, Ordering::Relaxed);

        debug!(
            client = %ctx.client,
            known_bot = classification.known_bot,
            matched = ?classification.matched_pattern,
            human_score = classification.human_score,
            likely_human = classification.likely_human,
            preview = classification.is_preview_fetch,
            suspicious_head = classification.suspicious_head,
            "Classified request"
        );

        if classification.known_bot && !self.classifier.score_sufficient(classification.human_score)
        {
            return self.block(ctx, Reason::KnownBot, Some(classification)).await;
        }
        if classification.is_preview_fetch {
            return self.block(ctx, Reason::PreviewFetch, Some(classification)).await;
        }
        if classification.suspicious_head {
            return self.block(ctx, Reason::SuspiciousHead, Some(classification)).await;
        }
        if let Some(reason) = self.rules.check(ctx) {
            return self.block(ctx, reason, Some(classification)).await;
        }

        if self.challenge.is_challenged(ctx) {
            return self.allow(ctx, Reason::ChallengePassed, classification).await;
        }

        if !classification.likely_human {
            return match cached.map(|v| v.kind) {
                Some(VerdictKind::PendingChallenge) if self.escalate_unanswered => {
                    self.block(ctx, Reason::ChallengeIgnored, Some(classification)).await
                }
                Some(VerdictKind::Human) => Decision {
                    action: Action::Allow,
                    reason: Reason::CachedHuman,
                    classification: Some(classification),
                },
                _ => {
                    self.verdicts
                        .store(&ctx.client, VerdictKind::PendingChallenge)
                        .await;
                    Decision {
                        action: Action::Challenge(self.challenge.issue(ctx)),
                        reason: Reason::Inconclusive,
                        classification: Some(classification),
                    }
                }
            };
        }

        self.allow(ctx, Reason::LikelyHuman, classification).await
    }

    async fn block(
        &self,
        ctx: &RequestContext,
        reason: Reason,
        classification: Option<Classification>,
    ) -> Decision {
        if reason.marks_client() {
            self.verdicts.store(&ctx.client, VerdictKind::Bot).await;
        }
        Decision {
            action: Action::Block,
            reason,
            classification,
        }
    }

    async fn allow(
        &self,
        ctx: &RequestContext,
        reason: Reason,
        classification: Classification,
    ) -> Decision {
        self.verdicts.store(&ctx.client, VerdictKind::Human).await;
        Decision {
            action: Action::Allow,
            reason,
            classification: Some(classification),
        }
    }
}
