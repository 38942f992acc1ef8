//! Configuration types for the bot gate.
//!
//! The surrounding application reads these once at startup and hands them to
//! the constructors; nothing in the library reads the environment.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Main configuration for the bot gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Bot-signature source and refresh policy
    pub patterns: PatternConfig,

    /// Human-score threshold and header weights
    pub thresholds: ThresholdConfig,

    /// Per-client verdict cache
    pub verdicts: VerdictConfig,

    /// Script challenge settings
    pub challenge: ChallengeConfig,

    /// Environment-specific block rules
    pub rules: RuleConfig,

    /// Operator notifications
    pub notify: NotifyConfig,

    /// HTTP front-end settings (binary only)
    pub server: ServerConfig,
}

/// Bot-signature source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// URL of the JSON signature document
    pub source_url: String,

    /// How long a fetched set stays fresh
    pub refresh_ttl_seconds: u64,

    /// Time budget for a single fetch
    pub fetch_timeout_ms: u64,

    /// Quiet period after a failed refresh
    pub failure_backoff_seconds: u64,

    /// Merge the built-in signature list into every set
    pub include_builtin: bool,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            source_url:
                "https://raw.githubusercontent.com/arcjet/well-known-bots/main/well-known-bots.json"
                    .to_string(),
            refresh_ttl_seconds: 3600,
            fetch_timeout_ms: 2700,
            failure_backoff_seconds: 60,
            include_builtin: true,
        }
    }
}

impl PatternConfig {
    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_seconds)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_seconds)
    }
}

/// Human-score threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Score at or above which a request presents as human
    pub human_score: u32,

    /// Points awarded per header signal
    pub weights: ScoreWeights,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            human_score: 3,
            weights: ScoreWeights::default(),
        }
    }
}

/// Points per header that browsers reliably send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub user_agent: u32,
    pub accept: u32,
    pub accept_language: u32,
    pub client_hints: u32,
    pub fetch_site: u32,
    pub cookie: u32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            user_agent: 1,
            accept: 1,
            accept_language: 1,
            client_hints: 2,
            fetch_site: 1,
            cookie: 1,
        }
    }
}

/// Verdict cache TTLs per outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdictConfig {
    /// Positive bot verdict lifetime
    pub bot_ttl_seconds: u64,

    /// Pending-challenge verdict lifetime
    pub pending_ttl_seconds: u64,

    /// Confirmed-human verdict lifetime
    pub human_ttl_seconds: u64,

    /// Upper bound on tracked clients
    pub max_entries: u64,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            bot_ttl_seconds: 600,
            pending_ttl_seconds: 10,
            human_ttl_seconds: 3600,
            max_entries: 100_000,
        }
    }
}

/// Script challenge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Cookie name carrying the proof
    pub cookie_name: String,

    /// Fixed cookie value
    pub cookie_value: String,

    /// Cookie lifetime in seconds
    pub cookie_max_age_seconds: u64,

    /// Delay between setting the cookie and navigating, in milliseconds
    pub script_delay_ms: u64,

    /// Meta-refresh delay for clients without script, in seconds
    pub fallback_refresh_seconds: u64,

    /// Block a client that returns without the cookie while its
    /// pending-challenge verdict is still live
    pub escalate_unanswered: bool,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            cookie_name: "_zentinel_js".to_string(),
            cookie_value: "1".to_string(),
            cookie_max_age_seconds: 7 * 24 * 3600,
            script_delay_ms: 300,
            fallback_refresh_seconds: 2,
            escalate_unanswered: true,
        }
    }
}

/// Optional, environment-specific block rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Block every IPv6 client
    pub block_ipv6: bool,

    /// Client networks to block (CIDR notation)
    pub blocked_networks: Vec<String>,

    /// Case-insensitive substrings that block when found in referer or path
    pub blocked_markers: Vec<String>,
}

impl RuleConfig {
    /// Parse `blocked_networks`, skipping entries that are not valid CIDRs.
    pub fn networks(&self) -> Vec<IpNet> {
        self.blocked_networks
            .iter()
            .filter_map(|raw| match raw.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!(network = %raw, error = %e, "Ignoring invalid blocked network");
                    None
                }
            })
            .collect()
    }
}

/// Operator notification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Send notifications at all
    pub enabled: bool,

    /// Messaging-bot token for direct delivery
    pub telegram_bot_token: Option<String>,

    /// Destination chat
    pub telegram_chat_id: Option<String>,

    /// Intermediary endpoint holding the credential; preferred when set
    pub relay_url: Option<String>,

    /// Site name reported to the intermediary as `mainDomain`
    pub main_domain: Option<String>,

    /// Messaging API base URL
    pub api_base: String,

    /// Time budget per notification
    pub timeout_ms: u64,

    /// Events buffered before new ones are dropped
    pub queue_capacity: usize,

    /// Concurrent sends in flight
    pub max_concurrency: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            telegram_bot_token: None,
            telegram_chat_id: None,
            relay_url: None,
            main_domain: None,
            api_base: "https://api.telegram.org".to_string(),
            timeout_ms: 2700,
            queue_capacity: 256,
            max_concurrency: 4,
        }
    }
}

impl NotifyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// HTTP front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,

    /// Redirect target for blocked traffic; 403 when unset
    pub block_redirect: Option<String>,

    /// Redirect target for allowed traffic; 200 when unset
    pub allow_redirect: Option<String>,

    /// Emit X-Bot-* decision headers
    pub decision_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            block_redirect: None,
            allow_redirect: None,
            decision_headers: true,
        }
    }
}

impl ServerConfig {
    /// Check that redirect targets can be sent as a `Location` header.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, target) in [
            ("block_redirect", &self.block_redirect),
            ("allow_redirect", &self.allow_redirect),
        ] {
            if let Some(target) = target {
                if http::HeaderValue::from_str(target).is_err() {
                    anyhow::bail!("{name} is not a valid Location value: {target:?}");
                }
            }
        }
        Ok(())
    }
}
