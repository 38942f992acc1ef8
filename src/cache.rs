//! Short-lived per-client verdicts.
//!
//! A time-bounded memo of recent outcomes keyed by client address. It only
//! saves repeated classification and repeated challenges; it is not a
//! security boundary.

use crate::config::VerdictConfig;
use crate::detectors::ClientKey;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};

/// Outcome recorded for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictKind {
    /// Classified as a bot
    Bot,
    /// Challenged, proof not yet seen
    PendingChallenge,
    /// Allowed as human
    Human,
}

impl VerdictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictKind::Bot => "bot",
            VerdictKind::PendingChallenge => "pending_challenge",
            VerdictKind::Human => "human",
        }
    }
}

/// A cached verdict.
#[derive(Debug, Clone)]
pub struct ClientVerdict {
    pub client_key: String,
    pub kind: VerdictKind,
    pub expires_at: Instant,
}

impl ClientVerdict {
    pub fn is_bot(&self) -> bool {
        self.kind == VerdictKind::Bot
    }
}

/// Per-entry expiry taken from the verdict itself.
struct VerdictExpiry;

impl Expiry<String, ClientVerdict> for VerdictExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &ClientVerdict,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(created_at))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &ClientVerdict,
        updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.expires_at.saturating_duration_since(updated_at))
    }
}

/// Client address to verdict, with a TTL chosen per outcome.
pub struct VerdictCache {
    inner: Cache<String, ClientVerdict>,
    bot_ttl: Duration,
    pending_ttl: Duration,
    human_ttl: Duration,
}

impl VerdictCache {
    pub fn new(config: &VerdictConfig) -> Self {
        Self::with_ttls(
            config.max_entries,
            Duration::from_secs(config.bot_ttl_seconds),
            Duration::from_secs(config.pending_ttl_seconds),
            Duration::from_secs(config.human_ttl_seconds),
        )
    }

    pub fn with_ttls(
        max_capacity: u64,
        bot_ttl: Duration,
        pending_ttl: Duration,
        human_ttl: Duration,
    ) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(VerdictExpiry)
            .build();

        Self {
            inner,
            bot_ttl,
            pending_ttl,
            human_ttl,
        }
    }

    /// TTL applied to an outcome.
    pub fn ttl_for(&self, kind: VerdictKind) -> Duration {
        match kind {
            VerdictKind::Bot => self.bot_ttl,
            VerdictKind::PendingChallenge => self.pending_ttl,
            VerdictKind::Human => self.human_ttl,
        }
    }

    /// Live verdict for the client, if any. Expired entries read as absent.
    pub async fn lookup(&self, key: &ClientKey) -> Option<ClientVerdict> {
        let ClientKey::Ip(ip) = key else {
            return None;
        };

        let verdict = self.inner.get(ip).await?;
        if verdict.expires_at <= Instant::now() {
            self.inner.invalidate(ip).await;
            return None;
        }
        Some(verdict)
    }

    /// Record an outcome with its default TTL.
    pub async fn store(&self, key: &ClientKey, kind: VerdictKind) {
        self.store_for(key, kind, self.ttl_for(kind)).await;
    }

    /// Record an outcome with an explicit TTL. Unknown clients are skipped.
    pub async fn store_for(&self, key: &ClientKey, kind: VerdictKind, ttl: Duration) {
        let ClientKey::Ip(ip) = key else {
            return;
        };

        let verdict = ClientVerdict {
            client_key: ip.clone(),
            kind,
            expires_at: Instant::now() + ttl,
        };
        self.inner.insert(ip.clone(), verdict).await;
    }

    /// Run pending expiry and eviction work.
    pub async fn expire_stale(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Approximate number of cached clients.
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

impl Default for VerdictCache {
    fn default() -> Self {
        Self::new(&VerdictConfig::default())
    }
}
