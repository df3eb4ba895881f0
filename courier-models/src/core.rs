use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

/// Flat key/value mapping used for messages and backend configuration.
///
/// Backed by an ordered map, so two mappings with the same contents serialize
/// identically and compare equal regardless of insertion order.
pub type Properties = serde_json::Map<String, serde_json::Value>;

/// Backend family a named connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BrokerKind {
    /// AMQP-style queue broker.
    RabbitMq,
    /// Cloud queue service.
    Sqs,
    /// Log-structured pub/sub broker.
    Kafka,
    /// In-process broker, used for local runs and tests.
    InMemory,
}

impl BrokerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerKind::RabbitMq => "rabbitmq",
            BrokerKind::Sqs => "sqs",
            BrokerKind::Kafka => "kafka",
            BrokerKind::InMemory => "in-memory",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rabbitmq" => Ok(BrokerKind::RabbitMq),
            "sqs" => Ok(BrokerKind::Sqs),
            "kafka" => Ok(BrokerKind::Kafka),
            "in-memory" | "in_memory" | "inmemory" => Ok(BrokerKind::InMemory),
            other => Err(format!("unknown broker type '{other}'")),
        }
    }
}

impl TryFrom<String> for BrokerKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BrokerKind> for String {
    fn from(kind: BrokerKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Everything needed to (re)create a named broker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: BrokerKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub parameters: Properties,
}

impl ConnectionSettings {
    pub fn new(name: impl Into<String>, kind: BrokerKind, parameters: Properties) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureLogSettings {
    #[serde(default = "default_log_dir")]
    pub dir_path: PathBuf,
    #[serde(default = "default_log_name")]
    pub log_name: String,
}

impl FailureLogSettings {
    pub fn path(&self) -> PathBuf {
        self.dir_path.join(&self.log_name)
    }
}

impl Default for FailureLogSettings {
    fn default() -> Self {
        Self {
            dir_path: default_log_dir(),
            log_name: default_log_name(),
        }
    }
}

/// Knobs for the retry sweeps over the failure log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySettings {
    /// A send failure triggers a full-log sweep once more than this many entries are pending.
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    #[serde(default = "default_scoped_batch_size")]
    pub scoped_batch_size: usize,
    #[serde(default = "default_global_batch_size")]
    pub global_batch_size: usize,
    #[serde(default = "default_sweep_concurrency")]
    pub sweep_concurrency: usize,
    /// Zero disables the periodic sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_true")]
    pub drain_on_success: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            scoped_batch_size: default_scoped_batch_size(),
            global_batch_size: default_global_batch_size(),
            sweep_concurrency: default_sweep_concurrency(),
            sweep_interval_secs: default_sweep_interval_secs(),
            drain_on_success: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectSettings {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_exponent")]
    pub max_exponent: u32,
    /// Upper bound (exclusive) of the random jitter added to every delay.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_exponent: default_max_exponent(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_name() -> String {
    "broker.log".to_string()
}

fn default_threshold() -> u64 {
    3
}

fn default_scoped_batch_size() -> usize {
    1
}

fn default_global_batch_size() -> usize {
    10
}

fn default_sweep_concurrency() -> usize {
    8
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_exponent() -> u32 {
    4
}

fn default_jitter_ms() -> u64 {
    1000
}
