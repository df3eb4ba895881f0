use courier_models::core::Properties;
use serde::{Deserialize, Serialize};

use crate::coordinator::ConnectionStatus;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub connection_name: String,
    #[serde(default)]
    pub message: Properties,
    #[serde(default)]
    pub configuration: Properties,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveRequest {
    pub connection_name: String,
    #[serde(default)]
    pub configuration: Properties,
}

/// `?connection=<name>` filter shared by `/failures` and `/retry`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConnectionQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryAccepted {
    pub scope: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub connections: Vec<ConnectionStatus>,
    pub pending_failures: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}
