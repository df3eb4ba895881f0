use std::time::Duration;

use async_trait::async_trait;
use courier_models::core::{BrokerKind, ConnectionSettings, Properties};

use super::{connect_timeout, optional_str, optional_u64, required_str, probe_tcp};
use crate::{BrokerConnection, BrokerDelivery, BrokerError, BrokerMessage, ConnectionState};

const DEFAULT_PORT: u64 = 5672;

/// AMQP-style queue broker. Health is a TCP probe of `host:port`; the AMQP
/// wire protocol itself is not spoken.
pub struct RabbitMqConnection {
    name: String,
    configuration: Properties,
    address: String,
    vhost: String,
    connect_timeout: Duration,
    state: ConnectionState,
}

impl RabbitMqConnection {
    pub fn from_settings(settings: &ConnectionSettings) -> Result<Self, BrokerError> {
        let name = settings.name.as_str();
        let parameters = &settings.parameters;
        let host = required_str(name, parameters, "host")?;
        let port = optional_u64(name, parameters, "port", DEFAULT_PORT)?;
        if port == 0 || port > u16::MAX as u64 {
            return Err(BrokerError::invalid_configuration(
                name,
                format!("port {port} is out of range"),
            ));
        }
        let vhost = optional_str(name, parameters, "vhost")?.unwrap_or_else(|| "/".to_string());

        Ok(Self {
            name: name.to_string(),
            configuration: parameters.clone(),
            address: format!("{host}:{port}"),
            vhost,
            connect_timeout: connect_timeout(name, parameters)?,
            state: ConnectionState::default(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn vhost(&self) -> &str {
        &self.vhost
    }
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::RabbitMq
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
        Err(BrokerError::NotImplemented("rabbitmq send"))
    }

    async fn receive(&self, _configuration: &Properties) -> Result<Vec<BrokerDelivery>, BrokerError> {
        Err(BrokerError::NotImplemented("rabbitmq receive"))
    }

    async fn check_health(&self) -> Result<(), BrokerError> {
        probe_tcp(&self.name, &self.address, self.connect_timeout).await
    }

    async fn stop(&self) {
        self.state.set_connected(false);
    }
}
