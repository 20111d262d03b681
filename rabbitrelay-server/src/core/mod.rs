pub mod endpoint;
pub mod error;
pub mod message;

pub use endpoint::{AMQP_SCHEME, AMQPS_SCHEME, Endpoint};
pub use error::{ConfigError, ConfigSection, RelayError, RelayResult, SecurityContextError};
pub use message::{MessageProperties, RelayMessage};
