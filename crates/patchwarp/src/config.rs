use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How parameter snapshots are written to disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFormat {
    Json,
    Bincode,
}

impl CheckpointFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CheckpointFormat::Json => "json",
            CheckpointFormat::Bincode => "bin",
        }
    }
}

/// Full description of a training run. Serialisable so that a run can be
/// configured from a JSON file and reproduced from its manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Image channels fed to the loss; the network sees twice as many after
    /// the two patches are fused.
    pub channels: usize,
    /// Full image geometry used by the photometric loss.
    pub image_hw: (usize, usize),
    /// Patch geometry fed to the network. Both sides must be divisible by 32
    /// to survive the five pooling stages.
    pub patch_hw: (usize, usize),
    pub batch_size: usize,
    pub learning_rate: f32,
    pub epochs: usize,
    /// Include batch normalisation in every network stage. The network must
    /// be built with the same setting; [`crate::HomographyNet::new`] takes it
    /// as its third argument.
    pub normalize: bool,
    /// Rescale 8-bit pixel values into `[0, 1]` before the forward pass.
    /// Leave off when the dataset already stores unit-range floats.
    pub rescale_intensity: bool,
    /// Fraction of samples assigned to the training split.
    pub train_fraction: f64,
    pub seed: u64,
    /// Channel depth for background batch prefetching; zero disables it.
    pub prefetch_depth: usize,
    pub checkpoint_dir: Option<PathBuf>,
    pub checkpoint_format: CheckpointFormat,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            image_hw: (256, 256),
            patch_hw: (128, 128),
            batch_size: 64,
            learning_rate: 1e-5,
            epochs: 20,
            normalize: true,
            rescale_intensity: false,
            train_fraction: 0.8,
            seed: 0,
            prefetch_depth: 2,
            checkpoint_dir: None,
            checkpoint_format: CheckpointFormat::Json,
        }
    }
}

/// Errors raised while loading or validating a [`TrainConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {reason}")]
    Invalid { reason: String },
}

impl TrainConfig {
    /// Loads and validates a configuration from a JSON file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: TrainConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { reason });
        if self.channels == 0 {
            return invalid("channels must be positive".into());
        }
        if self.image_hw.0 == 0 || self.image_hw.1 == 0 {
            return invalid("image dimensions must be positive".into());
        }
        if self.patch_hw.0 % 32 != 0 || self.patch_hw.1 % 32 != 0 || self.patch_hw.0 == 0 {
            return invalid(format!(
                "patch dimensions {:?} must be positive multiples of 32",
                self.patch_hw
            ));
        }
        if self.patch_hw.0 > self.image_hw.0 || self.patch_hw.1 > self.image_hw.1 {
            return invalid(format!(
                "patch {:?} does not fit inside image {:?}",
                self.patch_hw, self.image_hw
            ));
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".into());
        }
        if !(self.learning_rate > 0.0) || !self.learning_rate.is_finite() {
            return invalid(format!("learning_rate {} must be positive", self.learning_rate));
        }
        if self.epochs == 0 {
            return invalid("epochs must be positive".into());
        }
        if !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return invalid(format!(
                "train_fraction {} must lie strictly between 0 and 1",
                self.train_fraction
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn default_config_is_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn patch_must_be_divisible_by_32() {
        let config = TrainConfig {
            patch_hw: (100, 128),
            ..TrainConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn patch_must_fit_inside_image() {
        let config = TrainConfig {
            image_hw: (96, 96),
            patch_hw: (128, 128),
            ..TrainConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{\"batch_size\": 8, \"epochs\": 2}}").unwrap();
        let config = TrainConfig::from_path(file.path()).unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.epochs, 2);
        assert_eq!(config.patch_hw, (128, 128));
    }

    #[test]
    fn malformed_json_reports_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            TrainConfig::from_path(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
