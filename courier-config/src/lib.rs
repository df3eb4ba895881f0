pub mod cli;

use std::{
    collections::BTreeMap,
    env, fs, io,
    path::{Path, PathBuf},
};

use courier_models::core::{
    BrokerKind, ConnectionSettings, FailureLogSettings, Properties, ReconnectSettings,
    RetrySettings,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

pub use cli::Cli;

/// Reserved connection name that configures the failure log in the flat form.
pub const LOGS_SECTION: &str = "logs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionSettings>,
    #[serde(default)]
    pub logs: FailureLogSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

impl BrokerConfig {
    /// Build a configuration from `<name>.<key> = value` pairs.
    ///
    /// Keys under [`LOGS_SECTION`] configure the failure log; every other
    /// prefix names a connection whose `type` and `enabled` keys are lifted out
    /// and whose remaining keys become backend parameters.
    pub fn from_properties<I, K, V>(properties: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (key, value) in properties {
            let key = key.as_ref();
            let (section, field) = key.split_once('.').ok_or_else(|| {
                ConfigError::Invalid(format!("property '{key}' is not of the form <name>.<key>"))
            })?;
            sections
                .entry(section.to_string())
                .or_default()
                .insert(field.to_string(), value.into());
        }

        let mut config = BrokerConfig::default();
        for (section, mut fields) in sections {
            if section == LOGS_SECTION {
                if let Some(dir) = fields.remove("dirPath") {
                    config.logs.dir_path = PathBuf::from(dir);
                }
                if let Some(name) = fields.remove("logName") {
                    config.logs.log_name = name;
                }
                continue;
            }

            let kind = fields
                .remove("type")
                .ok_or_else(|| ConfigError::Invalid(format!("connection '{section}' has no type")))?
                .parse::<BrokerKind>()
                .map_err(|err| ConfigError::Invalid(format!("connection '{section}': {err}")))?;
            let enabled = match fields.remove("enabled") {
                Some(raw) => raw.trim().parse::<bool>().map_err(|_| {
                    ConfigError::Invalid(format!(
                        "connection '{section}': enabled must be true or false, got '{raw}'"
                    ))
                })?,
                None => false,
            };
            let parameters: Properties = fields
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect();

            config.connections.insert(
                section.clone(),
                ConnectionSettings {
                    name: section,
                    kind,
                    enabled,
                    parameters,
                },
            );
        }

        config.validate()?;
        Ok(config)
    }

    /// Connections that should be registered at startup.
    pub fn enabled_connections(&self) -> impl Iterator<Item = &ConnectionSettings> {
        self.connections.values().filter(|settings| settings.enabled)
    }

    pub fn failure_log_path(&self) -> PathBuf {
        self.logs.path()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for name in self.connections.keys() {
            validate_connection_name(name)?;
        }
        if self.retry.scoped_batch_size == 0 || self.retry.global_batch_size == 0 {
            return Err(ConfigError::Invalid("retry batch sizes must be at least 1".into()));
        }
        if self.retry.sweep_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "retry.sweepConcurrency must be at least 1".into(),
            ));
        }
        if self.logs.log_name.trim().is_empty() {
            return Err(ConfigError::Invalid("logs.logName must not be empty".into()));
        }
        Ok(())
    }
}

/// Load the JSON configuration file at `path`.
///
/// A relative failure-log directory is resolved against the directory that
/// holds the configuration file.
pub fn load_config(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let cwd = env::current_dir().map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config_path = resolve_path(&cwd, path);
    let data = fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
        path: config_path.clone(),
        source,
    })?;
    let mut config: BrokerConfig =
        serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: config_path.clone(),
            source,
        })?;

    for (name, settings) in config.connections.iter_mut() {
        settings.name = name.clone();
    }

    let config_dir = config_path.parent().unwrap_or(&cwd);
    config.logs.dir_path = resolve_path(config_dir, &config.logs.dir_path);

    config.validate()?;
    log::info!(
        "Loaded {} broker connection(s) from {}",
        config.connections.len(),
        config_path.display()
    );
    Ok(config)
}

pub fn resolve_path(base_dir: &Path, raw: &Path) -> PathBuf {
    if raw.is_absolute() {
        raw.to_path_buf()
    } else {
        base_dir.join(raw)
    }
}

/// Connection names are written unquoted into failure-log lines, so they must
/// be a single non-empty token.
pub fn validate_connection_name(name: &str) -> Result<(), ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Invalid("connection name must not be empty".into()));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ConfigError::Invalid(format!(
            "connection name '{name}' must not contain whitespace"
        )));
    }
    if name == LOGS_SECTION {
        return Err(ConfigError::Invalid(format!(
            "'{LOGS_SECTION}' is reserved and cannot name a connection"
        )));
    }
    Ok(())
}
