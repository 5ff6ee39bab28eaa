//! Engine configuration: `exgraf.toml` plus `EXGRAF_*` overrides.

mod loading;
mod types;
mod validation;


use thiserror::Error;

pub use types::{ExgrafConfig, ServerConfig, TransportConfig, WorkerEndpoints};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
