pub mod app_health;
pub mod config;
pub mod contracts;
pub mod debounce;
pub mod dial;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod log_buffer;
pub mod metadata;
pub mod ports;
pub mod registry;
pub mod watch;

pub use config::RegistryConfig;
pub use contracts::*;
pub use error::AgentApiError;
pub use registry::Registry;
