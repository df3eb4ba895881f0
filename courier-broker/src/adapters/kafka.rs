use std::time::Duration;

use async_trait::async_trait;
use courier_models::core::{BrokerKind, ConnectionSettings, Properties};

use super::{connect_timeout, probe_tcp, required_str};
use crate::{BrokerConnection, BrokerDelivery, BrokerError, BrokerMessage, ConnectionState};

/// Log-structured broker reached through a list of bootstrap servers.
pub struct KafkaConnection {
    name: String,
    configuration: Properties,
    bootstrap_servers: Vec<String>,
    connect_timeout: Duration,
    state: ConnectionState,
}

impl KafkaConnection {
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self, BrokerError> {
        let name = settings.name.as_str();
        let parameters = &settings.parameters;
        let bootstrap_servers: Vec<String> = required_str(name, parameters, "bootstrapServers")?
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();
        if bootstrap_servers.is_empty() {
            return Err(BrokerError::invalid_configuration(
                name,
                "bootstrapServers lists no servers",
            ));
        }

        Ok(Self {
            name: name.to_string(),
            configuration: parameters.clone(),
            bootstrap_servers,
            connect_timeout: connect_timeout(name, parameters)?,
            state: ConnectionState::default(),
        })
    }

    pub fn bootstrap_servers(&self) -> &[String] {
        &self.bootstrap_servers
    }
}

#[async_trait]
impl BrokerConnection for KafkaConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Kafka
    }

    fn configuration(&self) -> &Properties {
        &self.configuration
    }

    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn send(
        &self,
        _message: &Properties,
        _configuration: &Properties,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        Err(BrokerError::NotImplemented("kafka send"))
    }

    async fn receive(&self, _configuration: &Properties) -> Result<Vec<BrokerDelivery>, BrokerError> {
        Err(BrokerError::NotImplemented("kafka receive"))
    }

    /// Healthy as soon as any bootstrap server accepts a connection.
    async fn check_health(&self) -> Result<(), BrokerError> {
        let mut last_error = None;
        for server in &self.bootstrap_servers {
            match probe_tcp(&self.name, server, self.connect_timeout).await {
                Ok(()) => return Ok(()),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error
            .unwrap_or_else(|| BrokerError::transport(&self.name, "no bootstrap servers")))
    }

    async fn stop(&self) {
        self.state.set_connected(false);
    }
}
