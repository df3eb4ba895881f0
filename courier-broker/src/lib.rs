pub mod adapters;
pub mod coordinator;
mod errors;
pub mod factory;
pub mod failure_log;
pub mod http;
pub mod in_memory;
pub mod registry;
pub mod supervisor;
mod types;

pub use coordinator::{ConnectionStatus, DeliveryCoordinator, SweepReport, SweepScope};
pub use errors::{BrokerError, FailureLogError};
pub use factory::{BackendFactory, ConnectionFactory};
pub use failure_log::{FailureEntry, FailureLog, Severity};
pub use registry::ConnectionRegistry;
pub use supervisor::{BackoffPolicy, ReconnectSupervisor};
pub use types::{BrokerDelivery, BrokerMessage};

use async_trait::async_trait;
use courier_models::core::{BrokerKind, ConnectionSettings, Properties};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Handle to a live connection as stored in the registry.
pub type SharedConnection = Arc<dyn BrokerConnection>;

/// `connected` / `reconnecting` flags carried by every connection instance.
#[derive(Debug, Default)]
pub struct ConnectionState {
    connected: AtomicBool,
    reconnecting: AtomicBool,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    pub fn set_reconnecting(&self, reconnecting: bool) {
        self.reconnecting.store(reconnecting, Ordering::Release);
    }
}

/// Capability every broker backend implements.
///
/// Implementations never retry: any transport problem surfaces as a single
/// [`BrokerError`] and recovery is left to the [`DeliveryCoordinator`].
#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn kind(&self) -> BrokerKind;

    /// Backend parameters the connection was created from.
    fn configuration(&self) -> &Properties;

    fn state(&self) -> &ConnectionState;

    /// Publish one message.
    async fn send(
        &self,
        message: &Properties,
        configuration: &Properties,
    ) -> Result<Vec<BrokerMessage>, BrokerError>;

    /// Fetch whatever the backend has ready for this connection.
    async fn receive(&self, configuration: &Properties) -> Result<Vec<BrokerDelivery>, BrokerError>;

    /// Fails when the underlying transport is unreachable.
    async fn check_health(&self) -> Result<(), BrokerError>;

    /// Release transport resources. Calling it more than once is harmless.
    async fn stop(&self);

    /// Snapshot sufficient to build an equivalent connection.
    fn settings(&self) -> ConnectionSettings {
        ConnectionSettings::new(self.name(), self.kind(), self.configuration().clone())
    }
}
