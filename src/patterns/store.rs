//! Process-wide bot-signature cache.
//!
//! The store hands out the current [`PatternSet`] and refreshes it from a
//! [`PatternSource`] once it goes stale. Concurrent misses share a single
//! refresh: the first caller spawns it and installs a shared handle, every
//! other caller awaits that same handle.

use super::{builtin_entries, compile_signatures, PatternEntry, PatternSet, PatternSource, SourceError};
use crate::config::PatternConfig;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

type InFlight = Shared<BoxFuture<'static, ()>>;

/// Shared handle to the bot-signature cache.
#[derive(Clone)]
pub struct PatternStore {
    inner: Arc<Inner>,
}

struct Inner {
    source: Arc<dyn PatternSource>,
    builtin: Vec<PatternEntry>,
    ttl: Duration,
    fetch_timeout: Duration,
    failure_backoff: Duration,
    state: RwLock<Snapshot>,
    in_flight: Mutex<Option<InFlight>>,
}

struct Snapshot {
    entries: Arc<PatternSet>,
    fetched_at: Option<Instant>,
    failed_at: Option<Instant>,
}

impl PatternStore {
    /// Create a cold store. Until the first refresh succeeds it serves the
    /// built-in list (or nothing, when built-ins are disabled).
    pub fn new(source: Arc<dyn PatternSource>, config: &PatternConfig) -> Self {
        let builtin = if config.include_builtin {
            builtin_entries()
        } else {
            Vec::new()
        };

        let entries = Arc::new(PatternSet::new(builtin.iter().cloned()));

        Self {
            inner: Arc::new(Inner {
                source,
                builtin,
                ttl: config.refresh_ttl(),
                fetch_timeout: config.fetch_timeout(),
                failure_backoff: config.failure_backoff(),
                state: RwLock::new(Snapshot {
                    entries,
                    fetched_at: None,
                    failed_at: None,
                }),
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Current patterns, refreshing first when the set is stale.
    ///
    /// Never fails: a failed refresh leaves the previous set in place.
    pub async fn get_patterns(&self) -> Arc<PatternSet> {
        if let Some(set) = self.inner.fresh(Instant::now()) {
            return set;
        }

        let refresh = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(running) => running.clone(),
                None => {
                    // A refresh may have finished between the check above and
                    // taking the lock.
                    let now = Instant::now();
                    if let Some(set) = self.inner.fresh(now) {
                        return set;
                    }
                    if self.inner.backing_off(now) {
                        return self.inner.current();
                    }
                    let started = self.spawn_refresh();
                    *slot = Some(started.clone());
                    started
                }
            }
        };

        refresh.await;
        self.inner.current()
    }

    /// Refresh now, ignoring freshness and backoff. Joins a refresh that is
    /// already running instead of starting another.
    pub async fn refresh(&self) -> Arc<PatternSet> {
        let refresh = {
            let mut slot = self.inner.in_flight.lock();
            match slot.as_ref() {
                Some(running) => running.clone(),
                None => {
                    let started = self.spawn_refresh();
                    *slot = Some(started.clone());
                    started
                }
            }
        };

        refresh.await;
        self.inner.current()
    }

    /// Current patterns without any I/O.
    pub fn snapshot(&self) -> Arc<PatternSet> {
        self.inner.current()
    }

    /// When the current set was last fetched successfully.
    pub fn fetched_at(&self) -> Option<Instant> {
        self.inner.state.read().fetched_at
    }

    /// Whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.inner.in_flight.lock().is_some()
    }

    /// Spawn the refresh task. Must be called with the in-flight slot locked.
    fn spawn_refresh(&self) -> InFlight {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let _clear = ClearInFlight(Arc::clone(&inner));
            inner.refresh_once().await;
        });

        task.map(|_| ()).boxed().shared()
    }
}

impl Inner {
    fn current(&self) -> Arc<PatternSet> {
        Arc::clone(&self.state.read().entries)
    }

    fn fresh(&self, now: Instant) -> Option<Arc<PatternSet>> {
        let state = self.state.read();
        let fetched_at = state.fetched_at?;
        if now.duration_since(fetched_at) < self.ttl && !state.entries.is_empty() {
            Some(Arc::clone(&state.entries))
        } else {
            None
        }
    }

    fn backing_off(&self, now: Instant) -> bool {
        self.state
            .read()
            .failed_at
            .is_some_and(|failed| now.duration_since(failed) < self.failure_backoff)
    }

    async fn refresh_once(&self) {
        debug!("Refreshing bot signatures");

        let result = match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(self.fetch_timeout)),
        };

        match result {
            Ok(document) => {
                let fetched = compile_signatures(&document);
                let remote = fetched.len();
                let set = PatternSet::merged(&self.builtin, fetched);

                info!(
                    elements = document.len(),
                    remote = remote,
                    entries = set.len(),
                    "Bot signatures refreshed"
                );

                let mut state = self.state.write();
                state.entries = Arc::new(set);
                state.fetched_at = Some(Instant::now());
                state.failed_at = None;
            }
            Err(e) => {
                let mut state = self.state.write();
                warn!(
                    error = %e,
                    retained = state.entries.len(),
                    "Bot signature refresh failed, keeping previous set"
                );
                state.failed_at = Some(Instant::now());
            }
        }
    }
}

/// Clears the in-flight slot when the refresh task ends, including by panic.
struct ClearInFlight(Arc<Inner>);

impl Drop for ClearInFlight {
    fn drop(&mut self) {
        *self.0.in_flight.lock() = None;
    }
}
