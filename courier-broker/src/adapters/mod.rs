//! Backend adapters for the remote broker kinds.
//!
//! Each adapter reads its parameters from the connection settings and does no
//! retrying of its own.

pub mod kafka;
pub mod rabbitmq;
pub mod sqs;

pub use kafka::KafkaConnection;
pub use rabbitmq::RabbitMqConnection;
pub use sqs::SqsConnection;

use std::time::Duration;

use courier_models::core::Properties;
use serde_json::Value;
use tokio::net::TcpStream;

use crate::BrokerError;

pub(crate) const CONNECT_TIMEOUT_KEY: &str = "connectTimeoutMs";
pub(crate) const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// String parameter that must be present and non-empty.
pub(crate) fn required_str(
    connection: &str,
    parameters: &Properties,
    key: &str,
) -> Result<String, BrokerError> {
    match optional_str(connection, parameters, key)? {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(BrokerError::invalid_configuration(
            connection,
            format!("missing required parameter '{key}'"),
        )),
    }
}

pub(crate) fn optional_str(
    connection: &str,
    parameters: &Properties,
    key: &str,
) -> Result<Option<String>, BrokerError> {
    match parameters.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(other) => Err(BrokerError::invalid_configuration(
            connection,
            format!("parameter '{key}' must be a string, got {other}"),
        )),
    }
}

/// Unsigned parameter given either as a JSON number or as a numeric string,
/// which is how the flat properties form delivers every value.
pub(crate) fn optional_u64(
    connection: &str,
    parameters: &Properties,
    key: &str,
    default: u64,
) -> Result<u64, BrokerError> {
    let invalid = || {
        BrokerError::invalid_configuration(
            connection,
            format!("parameter '{key}' must be a non-negative integer"),
        )
    };
    match parameters.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Number(value)) => value.as_u64().ok_or_else(invalid),
        Some(Value::String(value)) => value.trim().parse().map_err(|_| invalid()),
        Some(_) => Err(invalid()),
    }
}

pub(crate) fn connect_timeout(connection: &str, parameters: &Properties) -> Result<Duration, BrokerError> {
    optional_u64(connection, parameters, CONNECT_TIMEOUT_KEY, DEFAULT_CONNECT_TIMEOUT_MS)
        .map(Duration::from_millis)
}

/// Succeeds when a TCP connection to `address` opens within `timeout`.
pub(crate) async fn probe_tcp(
    connection: &str,
    address: &str,
    timeout: Duration,
) -> Result<(), BrokerError> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(err)) => Err(BrokerError::transport(
            connection,
            format!("{address} unreachable: {err}"),
        )),
        Err(_) => Err(BrokerError::transport(
            connection,
            format!("{address} did not answer within {timeout:?}"),
        )),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::net::TcpListener;

    /// Address of a listener that accepts connections for the test's lifetime.
    pub async fn open_port() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        (listener, address)
    }

    /// Address nothing listens on.
    pub async fn closed_port() -> String {
        let (listener, address) = open_port().await;
        drop(listener);
        address
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn numbers_accept_strings_and_json_numbers() {
        let parameters = props(json!({ "a": 10, "b": " 20 ", "c": "x", "d": -1 }));
        assert_eq!(optional_u64("q", &parameters, "a", 0).unwrap(), 10);
        assert_eq!(optional_u64("q", &parameters, "b", 0).unwrap(), 20);
        assert_eq!(optional_u64("q", &parameters, "missing", 7).unwrap(), 7);
        assert!(optional_u64("q", &parameters, "c", 0).is_err());
        assert!(optional_u64("q", &parameters, "d", 0).is_err());
    }

    #[test]
    fn required_parameters_must_be_non_empty() {
        let parameters = props(json!({ "host": "", "port": 5672, "flags": [1] }));
        assert!(matches!(
            required_str("q", &parameters, "host"),
            Err(BrokerError::InvalidConfiguration { .. })
        ));
        assert_eq!(required_str("q", &parameters, "port").unwrap(), "5672");
        assert!(required_str("q", &parameters, "flags").is_err());
    }

    #[tokio::test]
    async fn tcp_probe_reports_reachability() {
        let (_listener, open) = test_support::open_port().await;
        assert!(probe_tcp("q", &open, Duration::from_secs(2)).await.is_ok());

        let closed = test_support::closed_port().await;
        assert!(matches!(
            probe_tcp("q", &closed, Duration::from_secs(2)).await,
            Err(BrokerError::Transport { .. })
        ));
    }
}
