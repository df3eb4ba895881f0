use std::{collections::HashSet, sync::Arc, time::Duration};

use courier_models::core::{ConnectionSettings, ReconnectSettings};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;

use crate::{BrokerError, ConnectionFactory, ConnectionRegistry, SharedConnection};

/// Capped exponential backoff with additive random jitter.
///
/// After `n` failed attempts the supervisor waits
/// `base * 2^min(n, max_exponent)` plus a jitter drawn from `1..jitter_ms`
/// milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_exponent: u32,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSettings::default())
    }
}

impl From<&ReconnectSettings> for BackoffPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            base: Duration::from_millis(settings.base_delay_ms),
            max_exponent: settings.max_exponent,
            jitter_ms: settings.jitter_ms,
        }
    }
}

impl BackoffPolicy {
    /// Delay before jitter after `failures` consecutive failed attempts.
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.max_exponent);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let jitter = if self.jitter_ms > 1 {
            rand::rng().random_range(1..self.jitter_ms)
        } else {
            0
        };
        self.base_delay(failures) + Duration::from_millis(jitter)
    }
}

/// Rebuilds failed connections until they pass a health check.
///
/// Loops run until they succeed or the shutdown flag flips to `true`; there
/// is no attempt limit. At most one loop runs per connection name.
pub struct ReconnectSupervisor {
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<ConnectionRegistry>,
    policy: BackoffPolicy,
    shutdown: watch::Receiver<bool>,
    active: Mutex<HashSet<String>>,
}

struct ActiveGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.lock().remove(&self.name);
    }
}

impl ReconnectSupervisor {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        registry: Arc<ConnectionRegistry>,
        policy: BackoffPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            factory,
            registry,
            policy,
            shutdown,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// True while a reconnect loop for `name` is running.
    pub fn is_reconnecting(&self, name: &str) -> bool {
        self.active.lock().contains(name)
    }

    /// Build a healthy replacement for `connection`.
    ///
    /// Marks the failed instance as reconnecting and retries with backoff.
    /// Returns `None` only when shutdown was requested first.
    pub async fn reconnect(&self, connection: &SharedConnection) -> Option<SharedConnection> {
        let settings = connection.settings();
        connection.state().set_connected(false);
        connection.state().set_reconnecting(true);

        let mut shutdown = self.shutdown.clone();
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                debug!("Abandoning reconnect of '{}' on shutdown", settings.name);
                return None;
            }

            let outcome = tokio::select! {
                outcome = self.attempt(&settings) => outcome,
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!("Abandoning reconnect of '{}' on shutdown", settings.name);
                    return None;
                }
            };

            match outcome {
                Ok(fresh) => {
                    fresh.state().set_connected(true);
                    fresh.state().set_reconnecting(false);
                    info!(
                        "Reconnected '{}' after {} failed attempt(s)",
                        settings.name, failures
                    );
                    return Some(fresh);
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = self.policy.delay(failures);
                    debug!(
                        "Reconnect attempt {} for '{}' failed: {}; retrying in {:?}",
                        failures, settings.name, err, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait_for(|stop| *stop) => {
                            debug!("Abandoning reconnect of '{}' on shutdown", settings.name);
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Reconnect whatever is registered under `name` and install the result.
    ///
    /// The replaced instance is stopped after the swap. Returns `None` when the
    /// name is unknown, another loop already owns it, or shutdown intervened.
    pub async fn reconnect_and_install(&self, name: &str) -> Option<SharedConnection> {
        let _guard = {
            let mut active = self.active.lock();
            if !active.insert(name.to_string()) {
                debug!("Reconnect of '{}' already in progress", name);
                return None;
            }
            ActiveGuard {
                active: &self.active,
                name: name.to_string(),
            }
        };

        let current = match self.registry.get(name) {
            Ok(connection) => connection,
            Err(err) => {
                warn!("Skipping reconnect: {}", err);
                return None;
            }
        };

        let fresh = self.reconnect(&current).await?;
        if let Some(previous) = self.registry.put(name, Arc::clone(&fresh)) {
            if !Arc::ptr_eq(&previous, &fresh) {
                previous.stop().await;
            }
        }
        Some(fresh)
    }

    async fn attempt(&self, settings: &ConnectionSettings) -> Result<SharedConnection, BrokerError> {
        let fresh = self.factory.create(settings).await?;
        if let Err(err) = fresh.check_health().await {
            fresh.stop().await;
            return Err(err);
        }
        Ok(fresh)
    }
}
