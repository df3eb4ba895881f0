use chrono::{DateTime, Utc};
use courier_models::core::Properties;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Record returned for every message a connection accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerMessage {
    pub connection_name: String,
    pub message: Properties,
    pub configuration: Properties,
}

/// Message handed back by `receive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerDelivery {
    pub delivery_id: Uuid,
    pub connection_name: String,
    pub message: Properties,
    #[serde(default = "utc_now")]
    pub received_at: DateTime<Utc>,
}

impl BrokerMessage {
    pub fn new(connection_name: &str, message: &Properties, configuration: &Properties) -> Self {
        Self {
            connection_name: connection_name.to_string(),
            message: message.clone(),
            configuration: configuration.clone(),
        }
    }
}

impl BrokerDelivery {
    pub fn new(connection_name: &str, message: Properties) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            connection_name: connection_name.to_string(),
            message,
            received_at: utc_now(),
        }
    }
}

fn utc_now() -> DateTime<Utc> {
    Utc::now()
}
