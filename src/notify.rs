//! Operator notifications for blocked and challenged traffic.
//!
//! Decisions hand events to a [`NotificationDispatcher`], which queues them
//! and delivers them from a background worker. Emitting never waits on the
//! network; a full queue drops the event.

use crate::config::NotifyConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Why a notification could not be delivered.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("notifier misconfigured: {0}")]
    Misconfigured(String),
}

/// Best-effort text delivery to an operator channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;

    /// Deliver an event. Notifiers that report more than the text override
    /// this.
    async fn send_event(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.send(&event.summary()).await
    }
}

/// Direct delivery through the messaging-bot `sendMessage` call.
pub struct TelegramNotifier {
    client: Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(
        api_base: &str,
        token: &str,
        chat_id: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", api_base.trim_end_matches('/'), token),
            chat_id: chat_id.into(),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "chat_id": self.chat_id, "text": text }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}

/// Delivery through an intermediary endpoint that holds the credential.
///
/// `mainDomain` is the host the event's request was addressed to, or the
/// configured fallback when the request carried none.
pub struct RelayNotifier {
    client: Client,
    url: String,
    main_domain: String,
}

impl RelayNotifier {
    pub fn new(
        url: impl Into<String>,
        main_domain: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            main_domain: main_domain.into(),
        })
    }

    async fn post(&self, text: &str, main_domain: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text, "mainDomain": main_domain }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        self.post(text, &self.main_domain).await
    }

    async fn send_event(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let domain = event.host.as_deref().unwrap_or(&self.main_domain);
        self.post(&event.summary(), domain).await
    }
}

/// What happened to a request, for the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub action: String,
    pub reason: String,
    pub user_agent: String,
    pub client: String,
    pub method: String,
    pub path: String,
    pub referer: Option<String>,
    pub host: Option<String>,
}

impl NotificationEvent {
    /// Plain-text message body.
    pub fn summary(&self) -> String {
        let ua = if self.user_agent.is_empty() {
            "(none)"
        } else {
            self.user_agent.as_str()
        };

        let mut text = format!(
            "{} ({})\nIP: {}\nUA: {}\n{} {}",
            self.action.to_uppercase(),
            self.reason,
            self.client,
            ua,
            self.method,
            self.path,
        );
        if let Some(host) = &self.host {
            text.push_str(&format!("\nHost: {host}"));
        }
        if let Some(referer) = &self.referer {
            text.push_str(&format!("\nReferer: {referer}"));
        }
        text
    }
}

/// Fire-and-forget queue in front of a [`Notifier`].
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: Option<mpsc::Sender<NotificationEvent>>,
}

impl NotificationDispatcher {
    /// A dispatcher that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Start the delivery worker. Must be called inside a tokio runtime.
    pub fn spawn(
        notifier: Arc<dyn Notifier>,
        capacity: usize,
        max_concurrency: usize,
        timeout: Duration,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<NotificationEvent>(capacity.max(1));
        let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let notifier = Arc::clone(&notifier);

                tokio::spawn(async move {
                    let _permit = permit;
                    match tokio::time::timeout(timeout, notifier.send_event(&event)).await {
                        Ok(Ok(())) => {
                            debug!(client = %event.client, action = %event.action, "Notification sent");
                        }
                        Ok(Err(e)) => {
                            warn!(client = %event.client, error = %e, "Notification failed");
                        }
                        Err(_) => {
                            warn!(
                                client = %event.client,
                                timeout_ms = timeout.as_millis() as u64,
                                "Notification timed out"
                            );
                        }
                    }
                });
            }
            debug!("Notification worker stopped");
        });

        Self { tx: Some(tx) }
    }

    /// Build the dispatcher described by the config. The relay is preferred
    /// over direct delivery; anything incomplete yields a disabled dispatcher.
    pub fn from_config(config: &NotifyConfig) -> anyhow::Result<Self> {
        if !config.enabled {
            return Ok(Self::disabled());
        }

        let notifier: Arc<dyn Notifier> = if let Some(url) = &config.relay_url {
            let domain = config.main_domain.clone().unwrap_or_default();
            Arc::new(RelayNotifier::new(url.clone(), domain, config.timeout())?)
        } else if let (Some(token), Some(chat_id)) =
            (&config.telegram_bot_token, &config.telegram_chat_id)
        {
            Arc::new(TelegramNotifier::new(
                &config.api_base,
                token,
                chat_id.clone(),
                config.timeout(),
            )?)
        } else {
            let e = NotifyError::Misconfigured(
                "set relay_url or both telegram_bot_token and telegram_chat_id".to_string(),
            );
            warn!(error = %e, "Notifications disabled");
            return Ok(Self::disabled());
        };

        Ok(Self::spawn(
            notifier,
            config.queue_capacity,
            config.max_concurrency,
            config.timeout(),
        ))
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue an event without waiting. Returns whether it was accepted.
    pub fn emit(&self, event: NotificationEvent) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(client = %event.client, "Notification queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(client = %event.client, "Notification worker gone, dropping event");
                false
            }
        }
    }
}
