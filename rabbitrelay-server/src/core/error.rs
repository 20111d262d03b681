use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Section of the configuration document a [`ConfigError`] refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    /// The document as a whole (unreadable file, invalid syntax)
    Document,
    /// `/masterRabbitServer`
    Master,
    /// `/slaveRabbitServers`
    Slaves,
    /// `/relay`
    Relay,
}

impl ConfigSection {
    /// JSON pointer of the section inside the document
    pub fn pointer(&self) -> &'static str {
        match self {
            Self::Document => "",
            Self::Master => "/masterRabbitServer",
            Self::Slaves => "/slaveRabbitServers",
            Self::Relay => "/relay",
        }
    }
}

impl fmt::Display for ConfigSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Document => write!(f, "document"),
            Self::Master => write!(f, "master server"),
            Self::Slaves => write!(f, "slave servers"),
            Self::Relay => write!(f, "relay settings"),
        }
    }
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error reading {section} config: {reason}")]
    Parse {
        section: ConfigSection,
        reason: String,
    },

    #[error("Error reading {section} config: section {} is missing", .section.pointer())]
    MissingSection { section: ConfigSection },

    #[error("Invalid relay settings: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Section the error refers to
    pub fn section(&self) -> ConfigSection {
        match self {
            Self::Read { .. } => ConfigSection::Document,
            Self::Parse { section, .. } | Self::MissingSection { section } => *section,
            Self::Invalid(_) => ConfigSection::Relay,
        }
    }
}

/// Credential material could not be loaded for an endpoint
#[derive(Debug, Error)]
pub enum SecurityContextError {
    #[error("CA bundle {path}: {reason}")]
    CaBundle { path: PathBuf, reason: String },

    #[error("Client certificate {path}: {reason}")]
    ClientCertificate { path: PathBuf, reason: String },

    #[error("Client key {path}: {reason}")]
    ClientKey { path: PathBuf, reason: String },

    #[error("Client key path is not configured")]
    MissingClientKey,

    #[error("TLS configuration rejected: {0}")]
    Tls(String),
}

/// Main error type for relay operations
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("SSL related error: {0}")]
    SecurityContext(#[from] SecurityContextError),

    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Publish to {endpoint} failed: {reason}")]
    Publish { endpoint: String, reason: String },

    #[error("Ack failed: {0}")]
    Ack(String),

    #[error("Mailbox of {0} is closed")]
    MailboxClosed(String),
}

impl RelayError {
    pub fn connection(endpoint: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn publish(endpoint: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Publish {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for relay operations
pub type RelayResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_names_section() {
        let err = ConfigError::Parse {
            section: ConfigSection::Master,
            reason: "invalid type".to_string(),
        };
        assert_eq!(err.section(), ConfigSection::Master);
        assert_eq!(
            err.to_string(),
            "Error reading master server config: invalid type"
        );

        let err = ConfigError::MissingSection {
            section: ConfigSection::Slaves,
        };
        assert!(err.to_string().contains("/slaveRabbitServers"));
    }

    #[test]
    fn test_relay_error_wraps_security_error() {
        let err: RelayError = SecurityContextError::MissingClientKey.into();
        assert!(matches!(err, RelayError::SecurityContext(_)));
        assert_eq!(
            err.to_string(),
            "SSL related error: Client key path is not configured"
        );
    }
}
