//! Edge bot gate for Zentinel
//!
//! Serves every request through the decision engine.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zentinel_bot_gate::{server, DecisionEngine, GateConfig};

/// How often the verdict cache runs its expiry and eviction work.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "zentinel-bot-gate")]
#[command(author, version, about = "Edge bot gate for Zentinel")]
struct Args {
    /// Path to configuration file (JSON or YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(short, long, env = "LISTEN")]
    listen: Option<String>,

    /// Bot-signature document URL
    #[arg(long, env = "BOT_LIST_URL")]
    bot_list_url: Option<String>,

    /// Messaging-bot token for notifications
    #[arg(long, env = "TG_BOT_TOKEN", hide_env_values = true)]
    tg_bot_token: Option<String>,

    /// Chat that receives notifications
    #[arg(long, env = "TG_CHAT_ID")]
    tg_chat_id: Option<String>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(json: bool, level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

fn load_config(path: &Path) -> Result<GateConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let config = if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
        serde_yaml::from_str(&content)?
    } else {
        serde_json::from_str(&content)?
    };
    Ok(config)
}

/// Command-line and environment values win over the file.
fn apply_overrides(config: &mut GateConfig, args: &Args) {
    if let Some(listen) = &args.listen {
        config.server.listen = listen.clone();
    }
    if let Some(url) = &args.bot_list_url {
        config.patterns.source_url = url.clone();
    }
    if let Some(token) = &args.tg_bot_token {
        config.notify.telegram_bot_token = Some(token.clone());
    }
    if let Some(chat_id) = &args.tg_chat_id {
        config.notify.telegram_chat_id = Some(chat_id.clone());
    }
    if args.tg_bot_token.is_some() && args.tg_chat_id.is_some() {
        config.notify.enabled = true;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, &args.log_level);

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => GateConfig::default(),
    };
    apply_overrides(&mut config, &args);
    config.server.validate()?;

    let engine = Arc::new(DecisionEngine::from_config(&config)?);

    let warm = engine.patterns().refresh().await;
    if engine.patterns().fetched_at().is_none() {
        warn!(
            url = %config.patterns.source_url,
            entries = warm.len(),
            "Starting without remote signatures"
        );
    }

    let maintenance = Arc::clone(&engine);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            interval.tick().await;
            maintenance.verdicts().expire_stale().await;
        }
    });

    let addr: SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(
        address = %addr,
        signatures = warm.len(),
        notifications = config.notify.enabled,
        "Starting bot gate"
    );

    let app = server::router(engine, config.server.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
