use courier_models::core::Properties;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::{
    http::types::{ErrorResponse, HealthResponse, ReceiveRequest, SendRequest},
    BrokerDelivery, BrokerError, BrokerMessage, FailureEntry,
};

/// Client for a remote courier broker's HTTP surface.
#[derive(Clone)]
pub struct HttpCourierClient {
    client: Client,
    base_url: Url,
}

impl HttpCourierClient {
    pub fn new(base_url: Url, client: Client) -> Self {
        Self { client, base_url }
    }

    fn endpoint(&self, path: &str) -> Result<Url, BrokerError> {
        self.base_url
            .join(path)
            .map_err(|err| BrokerError::Internal(err.to_string()))
    }

    pub async fn send(
        &self,
        connection_name: &str,
        message: &Properties,
        configuration: &Properties,
    ) -> Result<Vec<BrokerMessage>, BrokerError> {
        let url = self.endpoint("send")?;
        let response = self
            .client
            .post(url)
            .json(&SendRequest {
                connection_name: connection_name.to_string(),
                message: message.clone(),
                configuration: configuration.clone(),
            })
            .send()
            .await
            .map_err(|err| BrokerError::transport(connection_name, err))?;
        read_json(connection_name, response).await
    }

    pub async fn receive(
        &self,
        connection_name: &str,
        configuration: &Properties,
    ) -> Result<Vec<BrokerDelivery>, BrokerError> {
        let url = self.endpoint("receive")?;
        let response = self
            .client
            .post(url)
            .json(&ReceiveRequest {
                connection_name: connection_name.to_string(),
                configuration: configuration.clone(),
            })
            .send()
            .await
            .map_err(|err| BrokerError::transport(connection_name, err))?;
        read_json(connection_name, response).await
    }

    pub async fn failures(&self, connection_name: Option<&str>) -> Result<Vec<FailureEntry>, BrokerError> {
        let mut url = self.endpoint("failures")?;
        if let Some(name) = connection_name {
            url.query_pairs_mut().append_pair("connection", name);
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| BrokerError::Internal(err.to_string()))?;
        read_json(connection_name.unwrap_or("*"), response).await
    }

    /// Ask the broker to sweep its failure log, all of it or one connection's share.
    pub async fn retry(&self, connection_name: Option<&str>) -> Result<(), BrokerError> {
        let mut url = self.endpoint("retry")?;
        if let Some(name) = connection_name {
            url.query_pairs_mut().append_pair("connection", name);
        }
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|err| BrokerError::Internal(err.to_string()))?;
        match response.status() {
            StatusCode::ACCEPTED => Ok(()),
            _ => Err(read_error(connection_name.unwrap_or("*"), response).await),
        }
    }

    pub async fn health(&self) -> Result<HealthResponse, BrokerError> {
        let url = self.endpoint("health")?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| BrokerError::Internal(err.to_string()))?;
        read_json("*", response).await
    }
}

async fn read_json<T>(connection_name: &str, response: Response) -> Result<T, BrokerError>
where
    T: DeserializeOwned,
{
    if response.status() != StatusCode::OK {
        return Err(read_error(connection_name, response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|err| BrokerError::Internal(err.to_string()))
}

async fn read_error(connection_name: &str, response: Response) -> BrokerError {
    let status = response.status();
    let body = response.json::<ErrorResponse>().await.ok();
    let message = body
        .as_ref()
        .map(|body| body.message.clone())
        .unwrap_or_else(|| format!("unexpected status: {status}"));

    match (status, body.as_ref().map(|body| body.code.as_str())) {
        (StatusCode::NOT_FOUND, _) => BrokerError::NotConfigured(connection_name.to_string()),
        (_, Some("shutting_down")) => BrokerError::ShuttingDown,
        (_, Some("send_failed" | "transport")) => BrokerError::transport(connection_name, message),
        (_, Some("invalid_configuration")) => {
            BrokerError::invalid_configuration(connection_name, message)
        }
        _ => BrokerError::Internal(format!("{status}: {message}")),
    }
}
