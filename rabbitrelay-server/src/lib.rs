pub mod config;
pub mod core;
pub mod relay;
pub mod security;
pub mod transport;

// Re-export commonly used types
pub use config::{
    DEFAULT_CONFIG_FILE, DocumentFormat, LogFormat, LoggingConfig, RelayConfiguration,
    RelaySettings,
};
pub use core::{
    ConfigError, ConfigSection, Endpoint, MessageProperties, RelayError, RelayMessage,
    RelayResult, SecurityContextError,
};
pub use relay::{
    BackpressurePolicy, CancelPolicy, RelayContext, RelayStats, RelayStatsSnapshot,
    ShutdownCoordinator, ShutdownPolicy, ShutdownReport, WorkerState,
};
pub use security::{CertificatePolicy, CredentialIssue, SecurityContext};
pub use transport::{
    AmqpClient, BrokerClient, Delivery, DeliveryHandler, DeliverySource, SlaveLink,
};
