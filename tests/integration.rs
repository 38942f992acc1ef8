//! Integration tests for the Zentinel bot gate.
//!
//! These tests drive the public API end to end: configuration parsing, the
//! pattern store against stub and HTTP sources, the decision engine
//! scenarios, notifications, and the HTTP front-end.

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zentinel_bot_gate::config::PatternConfig;
use zentinel_bot_gate::notify::RelayNotifier;
use zentinel_bot_gate::{
    server, Action, DecisionEngine, GateConfig, HttpPatternSource, NotificationDispatcher,
    NotificationEvent, Notifier, NotifyError, PatternSource, PatternStore, Reason,
    RequestContext, SourceError, VerdictCache,
};

const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const HEADLESS: &str = "Mozilla/5.0 (compatible)";

// =============================================================================
// Test Doubles
// =============================================================================

/// Serves a fixed document and counts fetches.
struct StubSource {
    document: Vec<Value>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubSource {
    fn new(document: Vec<Value>) -> Arc<Self> {
        Self::slow(document, Duration::ZERO)
    }

    fn slow(document: Vec<Value>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            document,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PatternSource for StubSource {
    async fn fetch(&self) -> Result<Vec<Value>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.document.clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    async fn wait_for(&self, count: usize) {
        for _ in 0..100 {
            if self.sent.lock().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }
}

fn remote_document() -> Vec<Value> {
    vec![
        json!("/ahrefsbot/i"),
        json!({ "pattern": "SemrushBot" }),
        json!({ "ua": "MJ12bot" }),
        json!("bot"),
    ]
}

fn pattern_config(ttl_seconds: u64, include_builtin: bool) -> PatternConfig {
    PatternConfig {
        refresh_ttl_seconds: ttl_seconds,
        include_builtin,
        ..Default::default()
    }
}

fn engine_with(source: Arc<dyn PatternSource>, notifier: NotificationDispatcher) -> DecisionEngine {
    let config = GateConfig::default();
    DecisionEngine::new(
        PatternStore::new(source, &config.patterns),
        VerdictCache::new(&config.verdicts),
        notifier,
        &config,
    )
}

fn engine() -> DecisionEngine {
    engine_with(StubSource::new(remote_document()), NotificationDispatcher::disabled())
}

fn request(ip: &str, headers: &[(&str, &str)]) -> RequestContext {
    let map: HashMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let peer: Option<IpAddr> = ip.parse().ok();
    RequestContext::from_headers(&map, "GET", "/landing?ref=ad", peer)
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

// =============================================================================
// Configuration Tests
// =============================================================================

#[test]
fn test_default_config() {
    let config = GateConfig::default();

    assert_eq!(config.patterns.refresh_ttl_seconds, 3600);
    assert_eq!(config.patterns.fetch_timeout_ms, 2700);
    assert_eq!(config.thresholds.human_score, 3);
    assert_eq!(config.verdicts.bot_ttl_seconds, 600);
    assert_eq!(config.challenge.cookie_max_age_seconds, 604_800);
    assert!(!config.notify.enabled);
    assert!(config.server.decision_headers);
}

#[test]
fn test_config_from_json() {
    let raw = r#"{
        "patterns": { "source_url": "http://127.0.0.1:1/bots.json", "include_builtin": false },
        "thresholds": { "human_score": 5, "weights": { "client_hints": 3 } },
        "rules": { "block_ipv6": true, "blocked_markers": ["wp-admin"] },
        "notify": { "enabled": true, "relay_url": "https://relay.example/notify" }
    }"#;

    let config: GateConfig = serde_json::from_str(raw).unwrap();

    assert_eq!(config.patterns.source_url, "http://127.0.0.1:1/bots.json");
    assert!(!config.patterns.include_builtin);
    assert_eq!(config.patterns.refresh_ttl_seconds, 3600);
    assert_eq!(config.thresholds.human_score, 5);
    assert_eq!(config.thresholds.weights.client_hints, 3);
    assert_eq!(config.thresholds.weights.accept, 1);
    assert!(config.rules.block_ipv6);
    assert_eq!(config.notify.relay_url.as_deref(), Some("https://relay.example/notify"));
}

#[test]
fn test_config_from_yaml() {
    let raw = r#"
verdicts:
  pending_ttl_seconds: 30
challenge:
  cookie_name: proof
  escalate_unanswered: false
server:
  listen: "127.0.0.1:9000"
  block_redirect: "https://example.com/"
"#;

    let config: GateConfig = serde_yaml::from_str(raw).unwrap();

    assert_eq!(config.verdicts.pending_ttl_seconds, 30);
    assert_eq!(config.verdicts.human_ttl_seconds, 3600);
    assert_eq!(config.challenge.cookie_name, "proof");
    assert!(!config.challenge.escalate_unanswered);
    assert_eq!(config.server.listen, "127.0.0.1:9000");
    assert_eq!(config.server.block_redirect.as_deref(), Some("https://example.com/"));
}

// =============================================================================
// Pattern Store Tests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_ttl_respected() {
    let source = StubSource::new(remote_document());
    let store = PatternStore::new(source.clone(), &pattern_config(60, true));

    store.get_patterns().await;
    store.get_patterns().await;
    assert_eq!(source.calls(), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    store.get_patterns().await;
    assert_eq!(source.calls(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    store.get_patterns().await;
    store.get_patterns().await;
    assert_eq!(source.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_flight_under_concurrent_miss() {
    let source = StubSource::slow(remote_document(), Duration::from_millis(100));
    let store = PatternStore::new(source.clone(), &pattern_config(3600, true));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.get_patterns().await })
        })
        .collect();

    let mut sets = Vec::new();
    for handle in handles {
        sets.push(handle.await.unwrap());
    }

    assert_eq!(source.calls(), 1);
    assert!(sets.iter().all(|s| Arc::ptr_eq(s, &sets[0])));
    assert!(store.fetched_at().is_some());
    assert!(!store.is_refreshing());
}

#[tokio::test]
async fn test_merge_is_idempotent() {
    let source = StubSource::new(remote_document());
    let store = PatternStore::new(source.clone(), &pattern_config(3600, true));

    let first = store.refresh().await.len();
    let second = store.refresh().await.len();

    assert_eq!(source.calls(), 2);
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_malformed_entry_is_dropped() {
    let mut document: Vec<Value> = (0..9).map(|i| json!(format!("scanner-{i}"))).collect();
    document.insert(4, json!({ "pattern": "   " }));
    assert_eq!(document.len(), 10);

    let store = PatternStore::new(StubSource::new(document), &pattern_config(3600, false));
    let set = store.get_patterns().await;

    assert_eq!(set.len(), 9);
    assert!(store.fetched_at().is_some());
}

#[tokio::test]
async fn test_http_source_reads_document() {
    let stub = Router::new()
        .route("/bots.json", get(|| async { Json(json!(["/ahrefsbot/i", { "pattern": "SemrushBot" }, 7])) }))
        .route("/object.json", get(|| async { Json(json!({ "bots": [] })) }))
        .route(
            "/broken.json",
            get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
    let addr = serve(stub).await;

    let source = HttpPatternSource::new(format!("http://{addr}/bots.json"), Duration::from_secs(2)).unwrap();
    let elements = source.fetch().await.unwrap();
    assert_eq!(elements.len(), 3);

    let source = HttpPatternSource::new(format!("http://{addr}/object.json"), Duration::from_secs(2)).unwrap();
    assert!(matches!(source.fetch().await, Err(SourceError::NotAnArray)));

    let source = HttpPatternSource::new(format!("http://{addr}/broken.json"), Duration::from_secs(2)).unwrap();
    assert!(matches!(source.fetch().await, Err(SourceError::Status(_))));
}

#[tokio::test]
async fn test_unreachable_source_keeps_builtins() {
    let source = HttpPatternSource::new("http://127.0.0.1:1/bots.json", Duration::from_millis(500)).unwrap();
    let store = PatternStore::new(Arc::new(source), &pattern_config(3600, true));

    let before = store.snapshot().len();
    let set = store.get_patterns().await;

    assert!(before > 0);
    assert_eq!(set.len(), before);
    assert!(store.fetched_at().is_none());
}

// =============================================================================
// Decision Scenarios
// =============================================================================

#[tokio::test]
async fn test_scenario_known_bot_blocked() {
    let engine = engine();
    let decision = engine
        .decide(&request("203.0.113.1", &[("user-agent", "TelegramBot (like TwitterBot)")]))
        .await;

    assert_eq!(decision.action, Action::Block);
    assert_eq!(decision.reason, Reason::KnownBot);
    let classification = decision.classification.unwrap();
    assert!(classification.known_bot);
    assert!(classification.matched_pattern.is_some());
}

#[tokio::test]
async fn test_scenario_remote_signature_blocks() {
    let engine = engine();
    let decision = engine
        .decide(&request("203.0.113.2", &[("user-agent", "Mozilla/5.0 (compatible; AhrefsBot/7.0)")]))
        .await;

    assert_eq!(decision.reason, Reason::KnownBot);
}

#[tokio::test]
async fn test_scenario_plain_browser_allowed() {
    let engine = engine();
    let decision = engine
        .decide(&request(
            "198.51.100.1",
            &[
                ("user-agent", CHROME),
                ("accept-language", "en-US,en;q=0.9"),
                ("sec-ch-ua", "\"Chromium\";v=\"120\""),
            ],
        ))
        .await;

    assert_eq!(decision.action, Action::Allow);
    let classification = decision.classification.unwrap();
    assert!(classification.human_score >= 3);
    assert!(!classification.known_bot);
}

#[tokio::test]
async fn test_scenario_headless_challenge_then_allow() {
    let engine = engine();
    let ip = "198.51.100.2";

    let first = engine.decide(&request(ip, &[("user-agent", HEADLESS)])).await;
    let Action::Challenge(page) = &first.action else {
        panic!("expected challenge, got {:?}", first.action);
    };
    assert_eq!(first.reason, Reason::Inconclusive);
    assert!(page.body.contains("document.cookie"));
    assert!(page.body.contains("/landing?ref=ad"));

    let cookie = page.set_cookie.split(';').next().unwrap().to_string();
    let second = engine
        .decide(&request(ip, &[("user-agent", HEADLESS), ("cookie", &cookie)]))
        .await;

    assert_eq!(second.action, Action::Allow);
    assert_eq!(second.reason, Reason::ChallengePassed);
}

#[tokio::test]
async fn test_scenario_empty_user_agent_blocked() {
    let engine = engine();
    let decision = engine
        .decide(&request(
            "198.51.100.3",
            &[
                ("user-agent", ""),
                ("accept", "text/html"),
                ("accept-language", "en-US"),
                ("sec-ch-ua", "\"Chromium\";v=\"120\""),
                ("cookie", "_zentinel_js=1"),
            ],
        ))
        .await;

    assert_eq!(decision.action, Action::Block);
    assert_eq!(decision.reason, Reason::EmptyUserAgent);
    assert!(decision.classification.is_none());
}

#[tokio::test]
async fn test_scenario_cached_bot_skips_classification() {
    let engine = engine();
    let ip = "203.0.113.3";

    let first = engine.decide(&request(ip, &[("user-agent", "curl/8.4.0")])).await;
    assert_eq!(first.reason, Reason::KnownBot);
    let classified = engine.stats().snapshot().classifications;

    let second = engine
        .decide(&request(
            ip,
            &[
                ("user-agent", CHROME),
                ("accept-language", "en-US"),
                ("sec-ch-ua", "\"Chromium\";v=\"120\""),
            ],
        ))
        .await;

    assert_eq!(second.action, Action::Block);
    assert_eq!(second.reason, Reason::CachedBot);
    assert_eq!(engine.stats().snapshot().classifications, classified);
}

#[tokio::test]
async fn test_classification_is_deterministic() {
    let engine = engine();
    let ctx = request(
        "198.51.100.4",
        &[("user-agent", "python-requests/2.31"), ("accept", "*/*")],
    );
    let patterns = engine.patterns().get_patterns().await;
    let classifier = zentinel_bot_gate::HeuristicClassifier::default();

    let first = classifier.classify(&ctx, &patterns);
    for _ in 0..5 {
        assert_eq!(classifier.classify(&ctx, &patterns), first);
    }
}

// =============================================================================
// Notification Tests
// =============================================================================

#[tokio::test]
async fn test_block_and_challenge_are_notified() {
    let recording = Arc::new(RecordingNotifier::default());
    let dispatcher =
        NotificationDispatcher::spawn(recording.clone(), 16, 2, Duration::from_secs(1));
    let engine = engine_with(StubSource::new(remote_document()), dispatcher);

    engine
        .decide(&request("203.0.113.5", &[("user-agent", "TelegramBot (like TwitterBot)")]))
        .await;
    engine
        .decide(&request("198.51.100.5", &[("user-agent", HEADLESS)]))
        .await;
    engine
        .decide(&request("198.51.100.6", &[("user-agent", CHROME)]))
        .await;

    recording.wait_for(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sent = recording.sent();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().any(|t| t.contains("BLOCK (known_bot)") && t.contains("IP: 203.0.113.5")));
    assert!(sent.iter().any(|t| t.contains("CHALLENGE (inconclusive)")));
    assert!(sent.iter().all(|t| t.contains("GET /landing?ref=ad")));
}

#[tokio::test]
async fn test_relay_reports_request_host() {
    let received: Arc<Mutex<Vec<Value>>> = Arc::default();
    let sink = received.clone();
    let relay = Router::new().route(
        "/notify",
        post(move |Json(body): Json<Value>| {
            let sink = sink.clone();
            async move {
                sink.lock().push(body);
                "ok"
            }
        }),
    );
    let addr = serve(relay).await;

    let notifier = RelayNotifier::new(
        format!("http://{addr}/notify"),
        "fallback.example",
        Duration::from_secs(2),
    )
    .unwrap();

    let mut event = NotificationEvent {
        action: "block".to_string(),
        reason: "known_bot".to_string(),
        user_agent: "curl/8.4.0".to_string(),
        client: "203.0.113.8".to_string(),
        method: "GET".to_string(),
        path: "/".to_string(),
        referer: None,
        host: Some("shop.example".to_string()),
    };
    notifier.send_event(&event).await.unwrap();
    event.host = None;
    notifier.send_event(&event).await.unwrap();

    let bodies = received.lock().clone();
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0]["mainDomain"], "shop.example");
    assert_eq!(bodies[1]["mainDomain"], "fallback.example");
    assert!(bodies[0]["text"].as_str().unwrap().starts_with("BLOCK (known_bot)"));
}

// =============================================================================
// HTTP Front-end Tests
// =============================================================================

#[tokio::test]
async fn test_gate_over_http() {
    let bots = Router::new().route("/bots.json", get(|| async { Json(json!(["/ahrefsbot/i"])) }));
    let bots_addr = serve(bots).await;

    let mut config = GateConfig::default();
    config.patterns.source_url = format!("http://{bots_addr}/bots.json");
    let engine = Arc::new(DecisionEngine::from_config(&config).unwrap());
    let gate_addr = serve(server::router(engine.clone(), config.server.clone())).await;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let url = format!("http://{gate_addr}/article/7?utm=x");

    let blocked = client
        .get(&url)
        .header("user-agent", "AhrefsBot/7.0")
        .header("x-forwarded-for", "203.0.113.9")
        .send()
        .await
        .unwrap();
    assert_eq!(blocked.status(), reqwest::StatusCode::FORBIDDEN);
    assert_eq!(blocked.headers()["x-bot-reason"], "known_bot");

    let challenged = client
        .get(&url)
        .header("user-agent", HEADLESS)
        .header("x-forwarded-for", "198.51.100.9")
        .send()
        .await
        .unwrap();
    assert_eq!(challenged.status(), reqwest::StatusCode::OK);
    assert_eq!(challenged.headers()["x-bot-decision"], "challenge");
    let cookie = challenged.headers()["set-cookie"]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let body = challenged.text().await.unwrap();
    assert!(body.contains("/article/7?utm=x"));

    let allowed = client
        .get(&url)
        .header("user-agent", HEADLESS)
        .header("x-forwarded-for", "198.51.100.9")
        .header("cookie", cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), reqwest::StatusCode::OK);
    assert_eq!(allowed.headers()["x-bot-decision"], "allow");

    let stats: Value = client
        .get(format!("http://{gate_addr}/_gate/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["blocked"], 1);
    assert_eq!(stats["challenged"], 1);
    assert_eq!(stats["allowed"], 1);
}
