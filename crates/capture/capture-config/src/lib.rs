pub mod consumer;
pub mod station;

pub use consumer::{Bitwidth, ConsumerConfig};
pub use station::{ConsumerSection, ReceiverSection, StationConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse station config")]
    Parse(#[from] toml::de::Error),

    #[error("failed to parse consumer config")]
    ParseJson(#[from] serde_json::Error),

    #[error("missing required key(s): {}", keys.join(", "))]
    MissingKeys { keys: Vec<&'static str> },

    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },
}
