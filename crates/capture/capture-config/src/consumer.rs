use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// Bits per channelised sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bitwidth {
    #[default]
    Bits16,
    Bits32,
}

/// Per-consumer configuration: the union of every key a mode recognises,
/// as one JSON object. Each consumer pulls the keys it needs at init and
/// validates them one by one, so a report always names the actual missing
/// or broken key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumerConfig {
    pub nof_tiles: Option<usize>,
    pub nof_antennas: Option<usize>,
    pub nof_pols: Option<usize>,
    pub nof_channels: Option<usize>,
    pub nof_samples: Option<usize>,
    /// Raw mode: samples per epoch.
    pub samples_per_buffer: Option<usize>,
    /// Integrated beam: beam count.
    pub nof_beams: Option<usize>,
    /// Continuous channel: keep one of every k epochs.
    #[serde(default)]
    pub nof_buffer_skips: usize,
    /// Continuous channel: earliest packet time accepted (Unix seconds).
    pub start_time: Option<f64>,
    /// Station beam: first logical channel kept.
    pub start_channel: Option<usize>,
    /// Station beam: 0 = channel-major, 1 = time-major.
    #[serde(default)]
    pub transpose_samples: u8,
    /// Station beam: absolute capture start (Unix seconds).
    pub capture_start_time: Option<f64>,
    /// Correlator: fine-channel count.
    pub nof_fine_channels: Option<usize>,
    /// Ring slot size; must hold the largest expected packet.
    #[serde(default = "defaults::max_packet_size")]
    pub max_packet_size: usize,
    /// Channel modes: 16 or 32 bits per sample.
    #[serde(default = "defaults::bitwidth")]
    pub bitwidth: u32,
}

mod defaults {
    pub fn max_packet_size() -> usize {
        9000
    }

    pub fn bitwidth() -> u32 {
        16
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            nof_tiles: None,
            nof_antennas: None,
            nof_pols: None,
            nof_channels: None,
            nof_samples: None,
            samples_per_buffer: None,
            nof_beams: None,
            nof_buffer_skips: 0,
            start_time: None,
            start_channel: None,
            transpose_samples: 0,
            capture_start_time: None,
            nof_fine_channels: None,
            max_packet_size: defaults::max_packet_size(),
            bitwidth: defaults::bitwidth(),
        }
    }
}

impl ConsumerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let cfg: ConsumerConfig = serde_json::from_str(json)?;
        cfg.validate_common()?;
        Ok(cfg)
    }

    /// Checks the keys every mode shares. Mode-specific requirements are
    /// checked by each consumer via [`ConsumerConfig::require`].
    fn validate_common(&self) -> Result<(), ConfigError> {
        if self.max_packet_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_packet_size",
                reason: "must be non-zero".into(),
            });
        }
        if self.bitwidth != 16 && self.bitwidth != 32 {
            return Err(ConfigError::InvalidValue {
                key: "bitwidth",
                reason: format!("{} (expected 16 or 32)", self.bitwidth),
            });
        }
        Ok(())
    }

    /// Resolves a set of required dimension keys in one pass. Every key is
    /// checked independently and all the missing ones are reported
    /// together; a present-but-zero dimension is rejected as impossible.
    pub fn require(
        &self,
        keys: &[&'static str],
    ) -> Result<std::collections::HashMap<&'static str, usize>, ConfigError> {
        let mut missing = Vec::new();
        let mut out = std::collections::HashMap::new();
        for &key in keys {
            match self.get_dimension(key) {
                Some(0) => {
                    return Err(ConfigError::InvalidValue {
                        key,
                        reason: "dimension must be non-zero".into(),
                    });
                }
                Some(v) => {
                    out.insert(key, v);
                }
                None => missing.push(key),
            }
        }
        if missing.is_empty() {
            Ok(out)
        } else {
            Err(ConfigError::MissingKeys { keys: missing })
        }
    }

    fn get_dimension(&self, key: &str) -> Option<usize> {
        match key {
            "nof_tiles" => self.nof_tiles,
            "nof_antennas" => self.nof_antennas,
            "nof_pols" => self.nof_pols,
            "nof_channels" => self.nof_channels,
            "nof_samples" => self.nof_samples,
            "samples_per_buffer" => self.samples_per_buffer,
            "nof_beams" => self.nof_beams,
            "start_channel" => self.start_channel,
            "nof_fine_channels" => self.nof_fine_channels,
            _ => None,
        }
    }

    pub fn bitwidth(&self) -> Bitwidth {
        if self.bitwidth == 32 {
            Bitwidth::Bits32
        } else {
            Bitwidth::Bits16
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_union_of_keys() {
        let cfg = ConsumerConfig::from_json(
            r#"{
                "nof_tiles": 16,
                "nof_antennas": 16,
                "nof_pols": 2,
                "nof_channels": 512,
                "nof_samples": 1024,
                "nof_buffer_skips": 4,
                "start_channel": 0,
                "transpose_samples": 1,
                "capture_start_time": 1700000000.5,
                "bitwidth": 32
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.nof_tiles, Some(16));
        assert_eq!(cfg.nof_buffer_skips, 4);
        assert_eq!(cfg.transpose_samples, 1);
        assert_eq!(cfg.bitwidth(), Bitwidth::Bits32);
        assert_eq!(cfg.max_packet_size, 9000);
    }

    #[test]
    fn every_missing_key_is_named() {
        let cfg = ConsumerConfig::from_json(r#"{"nof_tiles": 2}"#).unwrap();
        let err = cfg
            .require(&["nof_tiles", "nof_antennas", "nof_pols"])
            .unwrap_err();
        match err {
            ConfigError::MissingKeys { keys } => {
                assert_eq!(keys, vec!["nof_antennas", "nof_pols"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn impossible_dimensions_are_rejected() {
        let cfg = ConsumerConfig::from_json(r#"{"nof_tiles": 0}"#).unwrap();
        assert!(matches!(
            cfg.require(&["nof_tiles"]),
            Err(ConfigError::InvalidValue { key: "nof_tiles", .. })
        ));

        assert!(ConsumerConfig::from_json(r#"{"bitwidth": 24}"#).is_err());
        assert!(ConsumerConfig::from_json(r#"{"no_such_key": 1}"#).is_err());
    }
}
