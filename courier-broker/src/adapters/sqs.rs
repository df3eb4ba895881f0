use std::time::Duration;

use async_trait::async_trait;
use courier_models::core::{BrokerKind, ConnectionSettings, Properties};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};

use super::{optional_u64, required_str};
use crate::{BrokerConnection, BrokerDelivery, BrokerError, BrokerMessage, ConnectionState};

const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
const MAX_MESSAGES_KEY: &str = "maxMessages";

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SendMessageRequest {
    pub message: Properties,
    #[serde(default)]
    pub attributes: Properties,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReceiveMessagesRequest {
    pub max_messages: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct ReceiveMessagesResponse {
    #[serde(default)]
    pub messages: Vec<Properties>,
}

/// Cloud queue spoken to over its JSON HTTP API.
pub struct SqsConnection {
    name: String,
    configuration: Properties,
    client: Client,
    queue_url: Url,
    request_timeout: Duration,
    state: ConnectionState,
}

impl SqsConnection {
    pub fn from_settings(settings: &ConnectionSettings, client: Client) -> Result<Self, BrokerError> {
        let name = settings.name.as_str();
        let parameters = &settings.parameters;
        let mut raw_url = required_str(name, parameters, "queueUrl")?;
        if !raw_url.ends_with('/') {
            raw_url.push('/');
        }
        let queue_url = Url::parse(&raw_url).map_err(|err| {
            BrokerError::invalid_configuration(name, format!("queueUrl '{raw_url}': {err}"))
        })?;
        let request_timeout = Duration::from_millis(optional_u64(
            name,
            parameters,
            "requestTimeoutMs",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?);

        Ok(Self {
            name: name.to_string(),
            configuration: parameters.clone(),
            client,
            queue_url,
            request_timeout,
            state: ConnectionState::default(),
        })
    }

    pub fn queue_url(&self) -> &Url {
        &self.queue_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, BrokerError> {
        self.queue_url
            .join(path)
            .map_err(|err| BrokerError::Internal(err.to_string()))
    }

    fn transport(&self, err: impl ToString) -> BrokerError {
        BrokerError::transport(&self.name, err)
    }
}

#[async_trait]
impl BrokerConnection for SqsConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Sqs
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
        let url = self.endpoint("messages")?;
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&SendMessageRequest {
                message: message.clone(),
                attributes: configuration.clone(),
            })
            .send()
            .await
            .map_err(|err| self.transport(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport(format!("unexpected send status: {status}")));
        }
        Ok(vec![BrokerMessage::new(&self.name, message, configuration)])
    }

    async fn receive(&self, configuration: &Properties) -> Result<Vec<BrokerDelivery>, BrokerError> {
        let max_messages = optional_u64(&self.name, configuration, MAX_MESSAGES_KEY, 1)?;
        let url = self.endpoint("messages/receive")?;
        let response = self
            .client
            .post(url)
            .timeout(self.request_timeout)
            .json(&ReceiveMessagesRequest { max_messages })
            .send()
            .await
            .map_err(|err| self.transport(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport(format!("unexpected receive status: {status}")));
        }
        let payload = response
            .json::<ReceiveMessagesResponse>()
            .await
            .map_err(|err| self.transport(err))?;
        Ok(payload
            .messages
            .into_iter()
            .map(|message| BrokerDelivery::new(&self.name, message))
            .collect())
    }

    async fn check_health(&self) -> Result<(), BrokerError> {
        let url = self.endpoint("health")?;
        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|err| self.transport(err))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(self.transport(format!("unexpected health status: {status}")))
        }
    }

    async fn stop(&self) {
        self.state.set_connected(false);
    }
}
