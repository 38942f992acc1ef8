//! Edge bot gate for Zentinel
//!
//! Classifies inbound HTTP requests as automated or human-like before they
//! reach the application and blocks, challenges, or allows them.
//!
//! # Features
//!
//! - Bot-signature list fetched remotely, cached under a TTL with
//!   single-flight refresh and merged with a built-in list
//! - Header-presence scoring and browser-engine token recognition
//! - Short-lived per-client verdict cache
//! - Stateless script-execution challenge (cookie proof)
//! - Fire-and-forget operator notifications for blocks and challenges
//!
//! # Example
//!
//! ```ignore
//! use zentinel_bot_gate::{DecisionEngine, GateConfig, RequestContext};
//!
//! let engine = DecisionEngine::from_config(&GateConfig::default())?;
//! let ctx = RequestContext::from_headers(&headers, "GET", "/", Some(peer));
//! let decision = engine.decide(&ctx).await;
//! ```

pub mod cache;
pub mod challenge;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod notify;
pub mod patterns;
pub mod score;
pub mod server;

pub use cache::{ClientVerdict, VerdictCache, VerdictKind};
pub use challenge::{ChallengeIssuer, ChallengePage};
pub use config::GateConfig;
pub use detectors::{ClientKey, HeaderAccessor, RequestContext};
pub use engine::{Action, Decision, DecisionEngine, Reason, StatsSnapshot};
pub use notify::{NotificationDispatcher, NotificationEvent, Notifier, NotifyError};
pub use patterns::{HttpPatternSource, PatternEntry, PatternSet, PatternSource, PatternStore, SourceError};
pub use score::{Classification, HeuristicClassifier};
