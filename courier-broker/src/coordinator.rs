use std::{
    collections::HashSet,
    fmt,
    future::Future,
    path::Path,
    sync::Arc,
    time::Duration,
};

use courier_config::BrokerConfig;
use courier_models::core::{BrokerKind, ConnectionSettings, Properties, RetrySettings};
use futures::{future, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, task::JoinSet, time::MissedTickBehavior};

use crate::{
    BackendFactory, BackoffPolicy, BrokerDelivery, BrokerError, BrokerMessage, ConnectionFactory,
    ConnectionRegistry, FailureEntry, FailureLog, ReconnectSupervisor, Severity, SharedConnection,
};

/// Which part of the failure log a retry sweep covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SweepScope {
    All,
    Connection(String),
}

impl fmt::Display for SweepScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepScope::All => f.write_str("all connections"),
            SweepScope::Connection(name) => write!(f, "connection '{name}'"),
        }
    }
}

/// Outcome of one retry sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scope: SweepScope,
    /// Entries a resend was attempted for.
    pub attempted: usize,
    pub resent: usize,
    /// Lines dropped from the log.
    pub removed: usize,
    /// Set when a conflicting sweep was already running. The sweep is run
    /// again once that one finishes.
    pub skipped: bool,
}

impl SweepReport {
    fn new(scope: SweepScope) -> Self {
        Self {
            scope,
            attempted: 0,
            resent: 0,
            removed: 0,
            skipped: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub name: String,
    pub kind: BrokerKind,
    pub connected: bool,
    pub reconnecting: bool,
}

struct Inner {
    registry: Arc<ConnectionRegistry>,
    factory: Arc<dyn ConnectionFactory>,
    supervisor: Arc<ReconnectSupervisor>,
    failure_log: Arc<FailureLog>,
    retry: RetrySettings,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    sweeps: Mutex<SweepClaims>,
}

/// Which sweeps are running and which were turned away meanwhile.
///
/// A scoped sweep cannot start while a global one runs. A global sweep can
/// start next to scoped ones but leaves their connections alone.
#[derive(Default)]
struct SweepClaims {
    global: bool,
    connections: HashSet<String>,
    deferred: HashSet<SweepScope>,
}

impl SweepClaims {
    fn is_free(&self, scope: &SweepScope) -> bool {
        match scope {
            SweepScope::All => !self.global,
            SweepScope::Connection(name) => !self.global && !self.connections.contains(name),
        }
    }
}

/// Held for the length of a sweep. On release, sweeps that were turned away
/// and can now run are spawned again.
struct SweepGuard {
    coordinator: DeliveryCoordinator,
    scope: SweepScope,
    /// Connections a global sweep must skip because scoped sweeps own them.
    excluded: HashSet<String>,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        let ready: Vec<SweepScope> = {
            let mut claims = self.coordinator.inner.sweeps.lock();
            match &self.scope {
                SweepScope::All => claims.global = false,
                SweepScope::Connection(name) => {
                    claims.connections.remove(name);
                }
            }
            let ready: Vec<SweepScope> = claims
                .deferred
                .iter()
                .filter(|scope| claims.is_free(scope))
                .cloned()
                .collect();
            for scope in &ready {
                claims.deferred.remove(scope);
            }
            ready
        };

        if !ready.is_empty() && tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        for scope in ready {
            debug!("Running deferred retry sweep over {}", scope);
            match scope {
                SweepScope::All => self.coordinator.spawn_retry_all(),
                SweepScope::Connection(name) => self.coordinator.spawn_retry_connection(&name),
            }
        }
    }
}

/// Entry point for sending and receiving through named connections.
///
/// A failed send is written to the failure log and answered with an error
/// straight away; recovery (reconnecting, resending the backlog) happens on
/// background tasks owned by the coordinator. Cloning is cheap and every
/// clone drives the same state.
#[derive(Clone)]
pub struct DeliveryCoordinator {
    inner: Arc<Inner>,
}

impl DeliveryCoordinator {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        failure_log: Arc<FailureLog>,
        retry: RetrySettings,
        backoff: BackoffPolicy,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = Arc::new(ReconnectSupervisor::new(
            Arc::clone(&factory),
            Arc::clone(&registry),
            backoff,
            shutdown_rx,
        ));

        Self {
            inner: Arc::new(Inner {
                registry,
                factory,
                supervisor,
                failure_log,
                retry,
                shutdown,
                tasks: Mutex::new(JoinSet::new()),
                sweeps: Mutex::new(SweepClaims::default()),
            }),
        }
    }

    /// Open the failure log and register every enabled connection of `config`.
    pub async fn from_config(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let failure_log = FailureLog::open(&config.logs, config.retry.threshold).await?;
        let factory = BackendFactory::new()?;
        let coordinator = Self::new(
            Arc::new(factory),
            Arc::new(failure_log),
            config.retry.clone(),
            BackoffPolicy::from(&config.reconnect),
        );
        coordinator.register_all(config.enabled_connections()).await?;
        Ok(coordinator)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.inner.registry
    }

    pub fn failure_log(&self) -> &Arc<FailureLog> {
        &self.inner.failure_log
    }

    pub fn supervisor(&self) -> &Arc<ReconnectSupervisor> {
        &self.inner.supervisor
    }

    pub fn retry_settings(&self) -> &RetrySettings {
        &self.inner.retry
    }

    pub fn failure_log_path(&self) -> &Path {
        self.inner.failure_log.path()
    }

    pub fn pending_failures(&self) -> u64 {
        self.inner.failure_log.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn is_reconnecting(&self, name: &str) -> bool {
        self.inner.supervisor.is_reconnecting(name)
    }

    /// Build a connection from `settings` and install it under its name.
    ///
    /// An unhealthy broker does not fail registration; the first failed send
    /// starts the reconnect loop.
    pub async fn register(&self, settings: &ConnectionSettings) -> Result<SharedConnection, BrokerError> {
        let connection = self.inner.factory.create(settings).await?;
        match connection.check_health().await {
            Ok(()) => connection.state().set_connected(true),
            Err(err) => warn!("Registered '{}' but it is not reachable yet: {}", settings.name, err),
        }
        if let Some(previous) = self
            .inner
            .registry
            .put(settings.name.clone(), Arc::clone(&connection))
        {
            previous.stop().await;
        }
        info!("Registered {} connection '{}'", settings.kind, settings.name);
        Ok(connection)
    }

    pub async fn register_all<'a, I>(&self, settings: I) -> Result<usize, BrokerError>
    where
        I: IntoIterator<Item = &'a ConnectionSettings>,
    {
        let mut count = 0;
        for connection in settings {
            self.register(connection).await?;
            count += 1;
        }
        Ok(count)
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<ConnectionStatus> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .map(|connection| ConnectionStatus {
                name: connection.name().to_string(),
                kind: connection.kind(),
                connected: connection.state().is_connected(),
                reconnecting: connection.state().is_reconnecting()
                    || self.inner.supervisor.is_reconnecting(connection.name()),
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Publish `message` through connection `name`.
    ///
    /// Unknown names fail with [`BrokerError::NotConfigured`] and leave no
    /// trace. Any other failure is logged, a reconnect is started, a full
    /// sweep is started when the log grew past its threshold, and the caller
    /// gets [`BrokerError::SendFailed`]. If the entry cannot be written the
    /// caller gets [`BrokerError::NotRecorded`] instead.
    pub async fn send(
        &self,
        name: &str,
        message: &Properties,
        configuration: &Properties,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }
        let connection = self.inner.registry.get(name)?;

        match deliver(&connection, message, configuration).await {
            Ok(receipts) => {
                if self.inner.retry.drain_on_success && !self.inner.failure_log.is_empty() {
                    self.spawn_retry_connection(name);
                }
                Ok(receipts)
            }
            Err(err) => {
                let log_path = self.inner.failure_log.path().to_path_buf();
                let recorded = self
                    .inner
                    .failure_log
                    .record(Severity::Error, name, message.clone(), configuration.clone())
                    .await;

                self.spawn_reconnect(name);

                if let Err(log_err) = recorded {
                    error!(
                        "Send to '{}' failed ({}) and could not be recorded in {}: {}",
                        name,
                        err,
                        log_path.display(),
                        log_err
                    );
                    return Err(BrokerError::NotRecorded {
                        connection: name.to_string(),
                        log_path,
                        send_error: Box::new(err),
                        source: log_err,
                    });
                }

                warn!(
                    "Send to '{}' failed ({}); recorded in {}",
                    name,
                    err,
                    log_path.display()
                );
                if self.inner.failure_log.is_at_threshold() {
                    self.spawn_retry_all();
                }

                Err(BrokerError::SendFailed {
                    connection: name.to_string(),
                    log_path,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Fetch from connection `name`. Failures are returned as they are.
    pub async fn receive(
        &self,
        name: &str,
        configuration: &Properties,
    ) -> Result<Vec<BrokerDelivery>, BrokerError> {
        if self.is_shutting_down() {
            return Err(BrokerError::ShuttingDown);
        }
        let connection = self.inner.registry.get(name)?;
        connection.receive(configuration).await
    }

    /// Logged failures, optionally only those of one connection.
    pub async fn failures(&self, connection: Option<&str>) -> Result<Vec<FailureEntry>, BrokerError> {
        let entries = match connection {
            Some(name) => self.inner.failure_log.entries_for(name).await?,
            None => self.inner.failure_log.entries().await?,
        };
        Ok(entries)
    }

    /// Resend every logged entry for `name` and drop the ones that went through.
    pub async fn retry_connection(&self, name: &str) -> Result<SweepReport, BrokerError> {
        self.sweep(SweepScope::Connection(name.to_string())).await
    }

    /// Resend the whole failure log.
    pub async fn retry_all(&self) -> Result<SweepReport, BrokerError> {
        self.sweep(SweepScope::All).await
    }

    pub fn spawn_reconnect(&self, name: &str) {
        let this = self.clone();
        let name = name.to_string();
        self.spawn(async move {
            if this.inner.supervisor.reconnect_and_install(&name).await.is_some() {
                this.report_sweep(this.retry_connection(&name).await);
            }
        });
    }

    pub fn spawn_retry_connection(&self, name: &str) {
        let this = self.clone();
        let name = name.to_string();
        self.spawn(async move {
            this.report_sweep(this.retry_connection(&name).await);
        });
    }

    pub fn spawn_retry_all(&self) {
        let this = self.clone();
        self.spawn(async move {
            this.report_sweep(this.retry_all().await);
        });
    }

    /// Sweep the whole log every `every` while it holds entries.
    pub fn spawn_periodic_sweep(&self, every: Duration) {
        if every.is_zero() {
            return;
        }
        let this = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        self.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                let stopped = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = shutdown.wait_for(|stop| *stop) => true,
                };
                if stopped {
                    break;
                }
                if !this.inner.failure_log.is_empty() {
                    this.report_sweep(this.retry_all().await);
                }
            }
            debug!("Periodic sweep stopped");
        });
    }

    /// Wait until every background task, including those spawned while
    /// waiting, has finished.
    pub async fn join_background(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.inner.tasks.lock());
            if tasks.is_empty() {
                return;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(err) = result {
                    if !err.is_cancelled() {
                        error!("Background task failed: {}", err);
                    }
                }
            }
        }
    }

    /// Stop background work and close every connection.
    ///
    /// Reconnect loops and the periodic sweep observe the stop signal; sweeps
    /// already running finish their current batch. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("Stopping broker coordinator");
        self.join_background().await;
        let closed = self.inner.registry.remove_all().await;
        info!(
            "Broker coordinator stopped; closed {} connection(s), {} failure(s) pending",
            closed,
            self.inner.failure_log.len()
        );
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return;
        }
        let mut tasks = self.inner.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    fn report_sweep(&self, result: Result<SweepReport, BrokerError>) {
        match result {
            Ok(report) if report.skipped => {
                debug!("Retry sweep over {} already running", report.scope)
            }
            Ok(report) => info!(
                "Retry sweep over {} resent {} of {} entr{}; {} pending",
                report.scope,
                report.resent,
                report.attempted,
                if report.attempted == 1 { "y" } else { "ies" },
                self.inner.failure_log.len()
            ),
            Err(err) => error!("Retry sweep failed: {}", err),
        }
    }

    /// Reserve `scope` for one sweep, or remember it to run once the
    /// conflicting sweep finishes.
    fn claim(&self, scope: &SweepScope) -> Option<SweepGuard> {
        let mut claims = self.inner.sweeps.lock();
        if !claims.is_free(scope) {
            claims.deferred.insert(scope.clone());
            return None;
        }
        let excluded = match scope {
            SweepScope::All => {
                claims.global = true;
                claims.connections.clone()
            }
            SweepScope::Connection(name) => {
                claims.connections.insert(name.clone());
                HashSet::new()
            }
        };
        Some(SweepGuard {
            coordinator: self.clone(),
            scope: scope.clone(),
            excluded,
        })
    }

    async fn sweep(&self, scope: SweepScope) -> Result<SweepReport, BrokerError> {
        let mut report = SweepReport::new(scope.clone());
        let Some(guard) = self.claim(&scope) else {
            report.skipped = true;
            return Ok(report);
        };

        let (entries, batch_size) = match &scope {
            SweepScope::All => (
                self.inner.failure_log.stream_all().await?,
                self.inner.retry.global_batch_size,
            ),
            SweepScope::Connection(name) => (
                self.inner.failure_log.stream_for(name).await?,
                self.inner.retry.scoped_batch_size,
            ),
        };
        let batch_size = batch_size.max(1);
        info!("Starting retry sweep over {}", scope);

        let excluded = &guard.excluded;
        let mut results = entries
            .filter_map(|item| {
                future::ready(match item {
                    Ok(entry) if excluded.contains(&entry.connection_name) => None,
                    Ok(entry) => Some(entry),
                    Err(err) => {
                        warn!("Skipping failure log entry: {}", err);
                        None
                    }
                })
            })
            .map(|entry| {
                let this = self.clone();
                async move {
                    let delivered = this.resend(&entry).await;
                    (entry, delivered)
                }
            })
            .buffer_unordered(self.inner.retry.sweep_concurrency.max(1));

        let mut delivered = Vec::with_capacity(batch_size);
        while let Some((entry, ok)) = results.next().await {
            report.attempted += 1;
            if ok {
                report.resent += 1;
                delivered.push(entry);
                if delivered.len() >= batch_size {
                    report.removed += self.inner.failure_log.remove_batch(&delivered).await?;
                    delivered.clear();
                }
            }
            if self.is_shutting_down() {
                debug!("Cutting retry sweep over {} short on shutdown", scope);
                break;
            }
        }
        report.removed += self.inner.failure_log.remove_batch(&delivered).await?;

        Ok(report)
    }

    /// One resend attempt. Never logs a new failure entry.
    async fn resend(&self, entry: &FailureEntry) -> bool {
        let connection = match self.inner.registry.get(&entry.connection_name) {
            Ok(connection) => connection,
            Err(err) => {
                debug!("Cannot resend: {}", err);
                return false;
            }
        };
        match deliver(&connection, &entry.message, &entry.configuration).await {
            Ok(_) => true,
            Err(err) => {
                debug!("Resend to '{}' failed: {}", entry.connection_name, err);
                false
            }
        }
    }
}

async fn deliver(
    connection: &SharedConnection,
    message: &Properties,
    configuration: &Properties,
) -> Result<Vec<BrokerMessage>, BrokerError> {
    connection.check_health().await?;
    connection.send(message, configuration).await
}
