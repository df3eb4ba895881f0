use crate::{BrokerConnection, BrokerDelivery, BrokerError, BrokerMessage, ConnectionState};
use async_trait::async_trait;
use courier_models::core::{BrokerKind, Properties};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const MAX_MESSAGES_KEY: &str = "maxMessages";

struct BrokerState {
    queue: VecDeque<Properties>,
    available: bool,
}

/// In-process queue standing in for a remote broker.
///
/// Clones share the same queue, so connections rebuilt after an outage see
/// what was published before it. Availability can be switched off to simulate
/// an unreachable broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    published: Arc<AtomicU64>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                queue: VecDeque::new(),
                available: true,
            })),
            published: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// Messages waiting to be received.
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().queue.is_empty()
    }

    /// Total messages accepted since creation.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Copy of the queued messages in arrival order.
    pub fn queued(&self) -> Vec<Properties> {
        self.state.lock().queue.iter().cloned().collect()
    }

    fn publish(&self, message: Properties) -> bool {
        let mut guard = self.state.lock();
        if !guard.available {
            return false;
        }
        guard.queue.push_back(message);
        drop(guard);
        self.published.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn take(&self, max: usize) -> Option<Vec<Properties>> {
        let mut guard = self.state.lock();
        if !guard.available {
            return None;
        }
        let count = max.min(guard.queue.len());
        Some(guard.queue.drain(..count).collect())
    }
}

pub struct InMemoryConnection {
    name: String,
    configuration: Properties,
    broker: InMemoryBroker,
    state: ConnectionState,
    stopped: AtomicBool,
}

impl InMemoryConnection {
    pub fn new(name: &str, configuration: Properties, broker: InMemoryBroker) -> Self {
        Self {
            name: name.to_string(),
            configuration,
            broker,
            state: ConnectionState::default(),
            stopped: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BrokerError::transport(&self.name, "connection has been stopped"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::InMemory
    }

    fn configuration(&self) -> &Properties {
        &self.configuration
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn send(
        &self,
        message: &Properties,
        configuration: &Properties,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        self.ensure_open()?;
        if !self.broker.publish(message.clone()) {
            return Err(BrokerError::transport(&self.name, "broker unavailable"));
        }
        Ok(vec![BrokerMessage::new(&self.name, message, configuration)])
    }

    async fn receive(&self, configuration: &Properties) -> Result<Vec<BrokerDelivery>, BrokerError> {
        self.ensure_open()?;
        let max = configuration
            .get(MAX_MESSAGES_KEY)
            .and_then(|value| value.as_u64())
            .unwrap_or(1) as usize;
        let messages = self
            .broker
            .take(max)
            .ok_or_else(|| BrokerError::transport(&self.name, "broker unavailable"))?;
        Ok(messages
            .into_iter()
            .map(|message| BrokerDelivery::new(&self.name, message))
            .collect())
    }

    async fn check_health(&self) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if self.broker.is_available() {
            Ok(())
        } else {
            Err(BrokerError::transport(&self.name, "broker unavailable"))
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.state.set_connected(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn send_then_receive_in_order() {
        let broker = InMemoryBroker::new();
        let connection = InMemoryConnection::new("orders", Properties::new(), broker.clone());

        let first = props(json!({ "id": 1 }));
        let second = props(json!({ "id": 2 }));
        let receipt = connection.send(&first, &Properties::new()).await.unwrap();
        assert_eq!(receipt[0].connection_name, "orders");
        assert_eq!(receipt[0].message, first);
        connection.send(&second, &Properties::new()).await.unwrap();

        let deliveries = connection
            .receive(&props(json!({ "maxMessages": 5 })))
            .await
            .unwrap();
        let bodies: Vec<_> = deliveries.into_iter().map(|d| d.message).collect();
        assert_eq!(bodies, vec![first, second]);
        assert!(broker.is_empty());
        assert_eq!(broker.published(), 2);
    }

    #[tokio::test]
    async fn receive_defaults_to_one_message() {
        let broker = InMemoryBroker::new();
        let connection = InMemoryConnection::new("orders", Properties::new(), broker.clone());
        for id in 0..3 {
            connection
                .send(&props(json!({ "id": id })), &Properties::new())
                .await
                .unwrap();
        }

        let deliveries = connection.receive(&Properties::new()).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(broker.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_broker_fails_every_operation() {
        let broker = InMemoryBroker::new();
        let connection = InMemoryConnection::new("orders", Properties::new(), broker.clone());
        broker.set_available(false);

        assert!(connection.check_health().await.is_err());
        assert!(matches!(
            connection.send(&Properties::new(), &Properties::new()).await,
            Err(BrokerError::Transport { .. })
        ));
        assert!(connection.receive(&Properties::new()).await.is_err());
        assert_eq!(broker.published(), 0);

        broker.set_available(true);
        assert!(connection.check_health().await.is_ok());
    }

    #[tokio::test]
    async fn stopped_connection_rejects_sends_but_broker_survives() {
        let broker = InMemoryBroker::new();
        let stale = InMemoryConnection::new("orders", Properties::new(), broker.clone());
        stale.stop().await;
        stale.stop().await;

        assert!(stale.send(&Properties::new(), &Properties::new()).await.is_err());

        let fresh = InMemoryConnection::new("orders", Properties::new(), broker.clone());
        assert!(fresh.send(&Properties::new(), &Properties::new()).await.is_ok());
    }
}
