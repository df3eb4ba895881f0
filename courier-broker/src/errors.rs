use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection '{0}' is not a configured broker connection")]
    NotConfigured(String),
    #[error("invalid configuration for connection '{connection}': {message}")]
    InvalidConfiguration { connection: String, message: String },
    #[error("transport failure on connection '{connection}': {message}")]
    Transport { connection: String, message: String },
    #[error("unable to send message to connection '{connection}'; logged in '{}'", .log_path.display())]
    SendFailed {
        connection: String,
        log_path: PathBuf,
        #[source]
        source: Box<BrokerError>,
    },
    #[error(
        "unable to send message to connection '{connection}' ({send_error}); it was NOT recorded in '{}': {source}",
        .log_path.display()
    )]
    NotRecorded {
        connection: String,
        log_path: PathBuf,
        send_error: Box<BrokerError>,
        #[source]
        source: FailureLogError,
    },
    #[error("failure log error: {0}")]
    Persistence(#[from] FailureLogError),
    #[error("operation not implemented: {0}")]
    NotImplemented(&'static str),
    #[error("broker coordinator is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn transport(connection: &str, message: impl ToString) -> Self {
        BrokerError::Transport {
            connection: connection.to_string(),
            message: message.to_string(),
        }
    }

    pub fn invalid_configuration(connection: &str, message: impl ToString) -> Self {
        BrokerError::InvalidConfiguration {
            connection: connection.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FailureLogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unable to encode failure entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt failure log line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}
