use crate::config::{CheckpointFormat, ConfigError, TrainConfig};
use crate::metrics::{EpochStats, MetricSink};
use crate::model::HomographyNet;
use pw_geometry::PhotometricLoss;
use pw_nn::{io, HomographyBatch, HomographyDataset, HomographyLoader, Module};
use pw_tensor::{PureResult, TensorError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-8;

/// Record written next to the checkpoints so a run can be audited and
/// resumed: the exact configuration, the per-epoch losses, and the snapshot
/// files in order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunManifest {
    pub config: TrainConfig,
    pub stats: Vec<EpochStats>,
    pub checkpoints: Vec<String>,
}

/// Drives the self-supervised training loop: predict corner displacements,
/// score them photometrically against the second view, and descend.
pub struct Fit {
    config: TrainConfig,
    loss: PhotometricLoss,
}

impl Fit {
    pub fn new(config: TrainConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let loss = PhotometricLoss::new(config.channels, config.image_hw).map_err(|error| {
            ConfigError::Invalid {
                reason: error.to_string(),
            }
        })?;
        Ok(Self { config, loss })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    fn guard_model(&self, model: &HomographyNet) -> PureResult<()> {
        if model.channels() != self.config.channels || model.patch_hw() != self.config.patch_hw {
            return Err(TensorError::InvalidValue {
                label: "model_geometry_mismatch",
            });
        }
        if model.batch_norm() != self.config.normalize {
            return Err(TensorError::InvalidValue {
                label: "model_normalization_mismatch",
            });
        }
        Ok(())
    }

    /// Runs the full loop over `dataset` and returns the per-epoch losses.
    /// The dataset is split once; the training split is reshuffled every
    /// epoch with a seed derived from the run seed.
    pub fn run<S: MetricSink>(
        &self,
        model: &mut HomographyNet,
        dataset: &HomographyDataset,
        sink: &mut S,
    ) -> PureResult<Vec<EpochStats>> {
        self.guard_model(model)?;
        let (train, valid) = dataset.random_split(self.config.train_fraction, self.config.seed)?;
        if train.is_empty() {
            return Err(TensorError::EmptyInput("train_split"));
        }
        if valid.is_empty() {
            return Err(TensorError::EmptyInput("valid_split"));
        }
        info!(
            train = train.len(),
            valid = valid.len(),
            epochs = self.config.epochs,
            "starting fit"
        );
        model.attach_adam(
            self.config.learning_rate,
            ADAM_BETA1,
            ADAM_BETA2,
            ADAM_EPSILON,
        )?;

        let mut stats = Vec::with_capacity(self.config.epochs);
        let mut checkpoints = Vec::new();
        let mut step = 0usize;
        for epoch in 0..self.config.epochs {
            let train_loss = self.train_epoch(model, &train, epoch, &mut step, sink)?;
            let valid_loss = self.valid_epoch(model, &valid)?;
            let epoch_stats = EpochStats {
                epoch,
                train_loss,
                valid_loss,
            };
            sink.record_epoch(&epoch_stats);
            stats.push(epoch_stats);
            if let Some(dir) = &self.config.checkpoint_dir {
                checkpoints.push(self.save_checkpoint(model, dir, epoch)?);
            }
        }
        if let Some(dir) = &self.config.checkpoint_dir {
            self.write_manifest(dir, &stats, &checkpoints)?;
        }
        Ok(stats)
    }

    // Corner coordinates stay in pixels; only intensities are rescaled.
    fn prepare(&self, batch: HomographyBatch) -> PureResult<HomographyBatch> {
        if !self.config.rescale_intensity {
            return Ok(batch);
        }
        let unit = 1.0 / 255.0;
        Ok(HomographyBatch {
            img_a: batch.img_a.scale(unit)?,
            img_b: batch.img_b.scale(unit)?,
            patch_a: batch.patch_a.scale(unit)?,
            patch_b: batch.patch_b.scale(unit)?,
            points: batch.points,
        })
    }

    fn train_loader(&self, dataset: &HomographyDataset, epoch: usize) -> HomographyLoader {
        dataset
            .loader()
            .shuffle(self.config.seed.wrapping_add(epoch as u64))
            .batched(self.config.batch_size)
            .prefetch(self.config.prefetch_depth)
    }

    fn train_epoch<S: MetricSink>(
        &self,
        model: &mut HomographyNet,
        train: &HomographyDataset,
        epoch: usize,
        step: &mut usize,
        sink: &mut S,
    ) -> PureResult<f32> {
        model.set_training(true);
        let mut weighted = 0.0f64;
        let mut seen = 0usize;
        for batch in self.train_loader(train, epoch).iter() {
            let batch = self.prepare(batch?)?;
            model.zero_accumulators()?;
            let delta = model.forward_pair(&batch.patch_a, &batch.patch_b)?;
            let value = self
                .loss
                .forward(&delta, &batch.img_a, &batch.img_b, &batch.points)?
                .data()[0];
            let grad = self
                .loss
                .backward(&delta, &batch.img_a, &batch.img_b, &batch.points)?;
            model.backward_pair(&batch.patch_a, &batch.patch_b, &grad)?;
            model.apply_step(self.config.learning_rate)?;
            sink.record_batch(*step, value);
            *step += 1;
            weighted += value as f64 * batch.batch_size() as f64;
            seen += batch.batch_size();
        }
        Ok((weighted / seen as f64) as f32)
    }

    fn valid_epoch(&self, model: &mut HomographyNet, valid: &HomographyDataset) -> PureResult<f32> {
        model.set_training(false);
        let mut weighted = 0.0f64;
        let mut seen = 0usize;
        let loader = valid.loader().batched(self.config.batch_size);
        for batch in loader.iter() {
            let batch = self.prepare(batch?)?;
            let delta = model.forward_pair(&batch.patch_a, &batch.patch_b)?;
            let value = self
                .loss
                .forward(&delta, &batch.img_a, &batch.img_b, &batch.points)?
                .data()[0];
            weighted += value as f64 * batch.batch_size() as f64;
            seen += batch.batch_size();
        }
        model.set_training(true);
        Ok((weighted / seen as f64) as f32)
    }

    fn save_checkpoint(
        &self,
        model: &HomographyNet,
        dir: &Path,
        epoch: usize,
    ) -> PureResult<String> {
        fs::create_dir_all(dir).map_err(|error| TensorError::IoError {
            message: error.to_string(),
        })?;
        let name = format!(
            "model_{epoch}.{}",
            self.config.checkpoint_format.extension()
        );
        let path: PathBuf = dir.join(&name);
        match self.config.checkpoint_format {
            CheckpointFormat::Json => io::save_json(model, &path)?,
            CheckpointFormat::Bincode => io::save_bincode(model, &path)?,
        }
        Ok(name)
    }

    fn write_manifest(
        &self,
        dir: &Path,
        stats: &[EpochStats],
        checkpoints: &[String],
    ) -> PureResult<()> {
        let manifest = RunManifest {
            config: self.config.clone(),
            stats: stats.to_vec(),
            checkpoints: checkpoints.to_vec(),
        };
        let raw =
            serde_json::to_string_pretty(&manifest).map_err(|error| {
                TensorError::SerializationError {
                    message: error.to_string(),
                }
            })?;
        fs::write(dir.join("manifest.json"), raw).map_err(|error| TensorError::IoError {
            message: error.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullSink;
    use pw_nn::synthetic_identity_pairs;
    use tempfile::tempdir;

    fn tiny_config() -> TrainConfig {
        TrainConfig {
            channels: 1,
            image_hw: (48, 48),
            patch_hw: (32, 32),
            batch_size: 2,
            learning_rate: 1e-4,
            epochs: 1,
            normalize: true,
            rescale_intensity: false,
            train_fraction: 0.75,
            seed: 9,
            prefetch_depth: 0,
            checkpoint_dir: None,
            checkpoint_format: CheckpointFormat::Json,
        }
    }

    #[test]
    fn model_geometry_must_match_config() {
        let fit = Fit::new(tiny_config()).unwrap();
        let mut wrong = HomographyNet::new(1, (64, 64), true).unwrap();
        let dataset = synthetic_identity_pairs(4, 1, (48, 48), (32, 32), 5).unwrap();
        assert!(fit.run(&mut wrong, &dataset, &mut NullSink).is_err());
    }

    #[test]
    fn model_normalization_must_match_config() {
        let fit = Fit::new(tiny_config()).unwrap();
        let mut plain = HomographyNet::new(1, (32, 32), false).unwrap();
        let dataset = synthetic_identity_pairs(4, 1, (48, 48), (32, 32), 5).unwrap();
        assert!(fit.run(&mut plain, &dataset, &mut NullSink).is_err());

        let mut config = tiny_config();
        config.normalize = false;
        let fit = Fit::new(config).unwrap();
        let stats = fit.run(&mut plain, &dataset, &mut NullSink).unwrap();
        assert_eq!(stats.len(), 1);
    }

    #[test]
    fn run_produces_stats_and_checkpoints() {
        let dir = tempdir().unwrap();
        let mut config = tiny_config();
        config.checkpoint_dir = Some(dir.path().to_path_buf());
        let fit = Fit::new(config).unwrap();
        let mut model = HomographyNet::new(1, (32, 32), true).unwrap();
        let dataset = synthetic_identity_pairs(4, 1, (48, 48), (32, 32), 5).unwrap();
        let stats = fit.run(&mut model, &dataset, &mut NullSink).unwrap();
        assert_eq!(stats.len(), 1);
        assert!(stats[0].train_loss.is_finite());
        assert!(dir.path().join("model_0.json").exists());
        let manifest: RunManifest = serde_json::from_str(
            &fs::read_to_string(dir.path().join("manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest.checkpoints, vec!["model_0.json".to_string()]);
        assert_eq!(manifest.stats.len(), 1);
    }

    #[test]
    fn too_small_dataset_is_rejected() {
        let fit = Fit::new(tiny_config()).unwrap();
        let mut model = HomographyNet::new(1, (32, 32), true).unwrap();
        let dataset = synthetic_identity_pairs(1, 1, (48, 48), (32, 32), 5).unwrap();
        assert!(fit.run(&mut model, &dataset, &mut NullSink).is_err());
    }
}
