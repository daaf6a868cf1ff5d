use crate::{ConfigError, ConsumerConfig};
use serde::Deserialize;
use std::path::Path;

/// Top-level station configuration for the capture daemon.
#[derive(Deserialize, Debug)]
pub struct StationConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    pub receiver: ReceiverSection,
    #[serde(default, rename = "consumer")]
    pub consumers: Vec<ConsumerSection>,
}

#[derive(Deserialize, Debug)]
pub struct ReceiverSection {
    pub interface: String,
    pub ip: String,
    pub ports: Vec<u16>,
    #[serde(default = "defaults::frame_size")]
    pub frame_size: usize,
    #[serde(default = "defaults::frames_per_block")]
    pub frames_per_block: usize,
    #[serde(default = "defaults::nof_blocks")]
    pub nof_blocks: usize,
}

/// One consumer to bring up: registry name plus its JSON-shaped parameter
/// table (TOML deserialises into the same struct).
#[derive(Deserialize, Debug)]
pub struct ConsumerSection {
    pub name: String,
    #[serde(default)]
    pub params: ConsumerConfig,
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn frame_size() -> usize {
        9000
    }

    pub fn frames_per_block() -> usize {
        32
    }

    pub fn nof_blocks() -> usize {
        256
    }
}

impl StationConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: StationConfig = toml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn station_toml_round_trip() {
        let cfg: StationConfig = toml::from_str(
            r#"
            [receiver]
            interface = "eth0"
            ip = "10.0.10.40"
            ports = [4660, 4661]

            [[consumer]]
            name = "burst_channel"
            [consumer.params]
            nof_tiles = 16
            nof_channels = 512
            nof_samples = 256
            nof_antennas = 16
            nof_pols = 2
            "#,
        )
        .unwrap();

        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.receiver.ports, vec![4660, 4661]);
        assert_eq!(cfg.receiver.frame_size, 9000);
        assert_eq!(cfg.consumers.len(), 1);
        assert_eq!(cfg.consumers[0].name, "burst_channel");
        assert_eq!(cfg.consumers[0].params.nof_channels, Some(512));
    }
}
