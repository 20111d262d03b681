use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{error, info};

use crate::core::{ConfigError, ConfigSection, Endpoint};
use crate::relay::{BackpressurePolicy, CancelPolicy, ShutdownPolicy};
use crate::security::CertificatePolicy;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "./rabbitrelaygo.cfg";

/// Complete relay configuration: one master, ordered slaves, runtime settings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayConfiguration {
    #[serde(rename = "masterRabbitServer")]
    pub master: Endpoint,
    #[serde(rename = "slaveRabbitServers")]
    pub slaves: Vec<Endpoint>,
    pub relay: RelaySettings,
}

/// Syntax of the configuration document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// `.yaml`/`.yml` files are YAML, everything else (including the
    /// historical `.cfg`) is JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::Yaml
            }
            _ => Self::Json,
        }
    }
}

/// Runtime settings of the relay (`/relay`, every key optional)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// `app_id` stamped on published messages, also the connection name
    pub application_id: String,
    /// Consumer tag on the master, empty lets the broker pick one
    pub consumer_tag: String,
    /// Per-worker mailbox capacity, 0 = unbounded
    pub mailbox_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub certificate_policy: CertificatePolicy,
    pub cancel_policy: CancelPolicy,
    pub shutdown: ShutdownPolicy,
    /// Interval of the `--profile` stats report
    pub stats_interval_secs: u64,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            application_id: "rabbitrelay".to_string(),
            consumer_tag: String::new(),
            mailbox_capacity: 1000,
            backpressure: BackpressurePolicy::default(),
            certificate_policy: CertificatePolicy::default(),
            cancel_policy: CancelPolicy::default(),
            shutdown: ShutdownPolicy::default(),
            stats_interval_secs: 30,
            logging: LoggingConfig::default(),
        }
    }
}

impl RelaySettings {
    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let ShutdownPolicy::AwaitCompletion { timeout_ms: 0 } = self.shutdown {
            return Err(ConfigError::Invalid(
                "awaitCompletion shutdown requires timeoutMs > 0".to_string(),
            ));
        }

        if self.stats_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "statsIntervalSecs must be greater than 0".to_string(),
            ));
        }

        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging level is empty".to_string()));
        }

        Ok(())
    }

    /// Mailbox capacity, `None` when unbounded
    pub fn bounded_capacity(&self) -> Option<usize> {
        (self.mailbox_capacity > 0).then_some(self.mailbox_capacity)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

impl RelayConfiguration {
    /// Load configuration from a JSON (or YAML) file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("RabbitRelay: reading configuration from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| {
            logged(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        })?;

        Self::parse(&content, DocumentFormat::from_path(path))
    }

    /// Parse a configuration document
    ///
    /// The master section is decoded first; a malformed master aborts before
    /// the slave list is looked at.
    pub fn parse(content: &str, format: DocumentFormat) -> Result<Self, ConfigError> {
        let document: Value = match format {
            DocumentFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
            DocumentFormat::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
        }
        .map_err(|reason| {
            logged(ConfigError::Parse {
                section: ConfigSection::Document,
                reason,
            })
        })?;

        let master: Endpoint = decode_section(&document, ConfigSection::Master)?;
        let slaves: Vec<Endpoint> = decode_section(&document, ConfigSection::Slaves)?;

        let relay = match document.pointer(ConfigSection::Relay.pointer()) {
            None | Some(Value::Null) => RelaySettings::default(),
            Some(_) => decode_section(&document, ConfigSection::Relay)?,
        };
        relay.validate().map_err(logged)?;

        Ok(Self {
            master,
            slaves,
            relay,
        })
    }
}

fn decode_section<T: DeserializeOwned>(
    document: &Value,
    section: ConfigSection,
) -> Result<T, ConfigError> {
    let value = document
        .pointer(section.pointer())
        .ok_or_else(|| logged(ConfigError::MissingSection { section }))?;

    T::deserialize(value).map_err(|e| {
        logged(ConfigError::Parse {
            section,
            reason: e.to_string(),
        })
    })
}

fn logged(err: ConfigError) -> ConfigError {
    error!("{}", err);
    err
}
