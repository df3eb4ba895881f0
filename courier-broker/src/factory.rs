use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use courier_config::validate_connection_name;
use courier_models::core::{BrokerKind, ConnectionSettings};
use parking_lot::Mutex;
use reqwest::Client;

use crate::{
    adapters::{KafkaConnection, RabbitMqConnection, SqsConnection},
    in_memory::{InMemoryBroker, InMemoryConnection},
    BrokerError, SharedConnection,
};

/// Builds connection instances from their settings.
///
/// Used both at startup and by the reconnect path, so an implementation must
/// produce a fresh, independent instance on every call.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn create(&self, settings: &ConnectionSettings) -> Result<SharedConnection, BrokerError>;
}

/// Factory for every [`BrokerKind`] this crate ships.
///
/// In-memory connections with the same name share one [`InMemoryBroker`], so a
/// rebuilt connection sees the queue its predecessor wrote to.
pub struct BackendFactory {
    http: Client,
    in_memory: Mutex<HashMap<String, InMemoryBroker>>,
}

impl BackendFactory {
    pub fn new() -> Result<Self, BrokerError> {
        let http = Client::builder()
            .build()
            .map_err(|err| BrokerError::Internal(format!("unable to build HTTP client: {err}")))?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: Client) -> Self {
        Self {
            http,
            in_memory: Mutex::new(HashMap::new()),
        }
    }

    /// The in-process broker behind in-memory connection `name`, created on first use.
    pub fn in_memory_broker(&self, name: &str) -> InMemoryBroker {
        self.in_memory
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl ConnectionFactory for BackendFactory {
    async fn create(&self, settings: &ConnectionSettings) -> Result<SharedConnection, BrokerError> {
        validate_connection_name(&settings.name)
            .map_err(|err| BrokerError::invalid_configuration(&settings.name, err))?;

        let connection: SharedConnection = match settings.kind {
            BrokerKind::RabbitMq => Arc::new(RabbitMqConnection::from_settings(settings)?),
            BrokerKind::Kafka => Arc::new(KafkaConnection::from_settings(settings)?),
            BrokerKind::Sqs => Arc::new(SqsConnection::from_settings(settings, self.http.clone())?),
            BrokerKind::InMemory => Arc::new(InMemoryConnection::new(
                &settings.name,
                settings.parameters.clone(),
                self.in_memory_broker(&settings.name),
            )),
        };
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_models::core::Properties;
    use serde_json::json;

    fn settings(name: &str, kind: BrokerKind, parameters: serde_json::Value) -> ConnectionSettings {
        ConnectionSettings::new(name, kind, parameters.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn builds_each_kind() {
        let factory = BackendFactory::with_client(Client::new());
        let cases = [
            settings("orders", BrokerKind::RabbitMq, json!({ "host": "mq.local" })),
            settings("events", BrokerKind::Kafka, json!({ "bootstrapServers": "k1:9092" })),
            settings("jobs", BrokerKind::Sqs, json!({ "queueUrl": "http://queue.local/jobs" })),
            settings("local", BrokerKind::InMemory, json!({})),
        ];
        for case in &cases {
            let connection = factory.create(case).await.unwrap();
            assert_eq!(connection.name(), case.name);
            assert_eq!(connection.kind(), case.kind);
            assert_eq!(connection.configuration(), &case.parameters);
        }
    }

    #[tokio::test]
    async fn rebuilt_in_memory_connections_share_a_queue() {
        let factory = BackendFactory::with_client(Client::new());
        let local = settings("local", BrokerKind::InMemory, json!({}));

        let first = factory.create(&local).await.unwrap();
        first
            .send(&json!({ "id": 1 }).as_object().cloned().unwrap(), &Properties::new())
            .await
            .unwrap();
        first.stop().await;

        let second = factory.create(&local).await.unwrap();
        assert_eq!(second.receive(&Properties::new()).await.unwrap().len(), 1);
        assert_eq!(factory.in_memory_broker("local").published(), 1);
    }

    #[tokio::test]
    async fn rejects_bad_settings() {
        let factory = BackendFactory::with_client(Client::new());
        let missing_host = settings("orders", BrokerKind::RabbitMq, json!({}));
        assert!(matches!(
            factory.create(&missing_host).await,
            Err(BrokerError::InvalidConfiguration { .. })
        ));

        let bad_name = settings("my orders", BrokerKind::InMemory, json!({}));
        assert!(factory.create(&bad_name).await.is_err());
    }
}
