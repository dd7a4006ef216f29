use patchwarp::{
    CheckpointFormat, EpochStats, Fit, HomographyNet, MetricSink, NullSink, TrainConfig,
};
use pw_geometry::PhotometricLoss;
use pw_nn::{corner_points, crop_patch, HomographyDataset, HomographySample, Module};
use pw_tensor::Tensor;
use tempfile::tempdir;

const IMAGE_HW: (usize, usize) = (48, 48);
const PATCH_HW: (usize, usize) = (32, 32);

fn smooth_image(phase: f32) -> Tensor {
    let (h, w) = IMAGE_HW;
    Tensor::from_fn(1, h * w, |_r, c| {
        let x = (c % w) as f32;
        let y = (c / w) as f32;
        0.5 + 0.25 * (0.2 * x + phase).sin() + 0.25 * (0.15 * y + phase).cos()
    })
    .unwrap()
}

fn smooth_identity_dataset(count: usize) -> HomographyDataset {
    let origin = (
        (IMAGE_HW.0 - PATCH_HW.0) / 2,
        (IMAGE_HW.1 - PATCH_HW.1) / 2,
    );
    let points = corner_points(origin, PATCH_HW).unwrap();
    let mut dataset = HomographyDataset::new();
    for index in 0..count {
        let image = smooth_image(index as f32 * 0.7);
        let patch = crop_patch(&image, 1, IMAGE_HW, origin, PATCH_HW).unwrap();
        dataset.push(
            HomographySample::new(
                image.clone(),
                image,
                patch.clone(),
                patch,
                points.clone(),
            )
            .unwrap(),
        );
    }
    dataset
}

fn test_config() -> TrainConfig {
    TrainConfig {
        channels: 1,
        image_hw: IMAGE_HW,
        patch_hw: PATCH_HW,
        batch_size: 2,
        learning_rate: 1e-3,
        epochs: 2,
        normalize: true,
        rescale_intensity: false,
        train_fraction: 0.75,
        seed: 11,
        prefetch_depth: 1,
        checkpoint_dir: None,
        checkpoint_format: CheckpointFormat::Json,
    }
}

fn flat_identity_dataset(count: usize, value: f32) -> HomographyDataset {
    let origin = (
        (IMAGE_HW.0 - PATCH_HW.0) / 2,
        (IMAGE_HW.1 - PATCH_HW.1) / 2,
    );
    let points = corner_points(origin, PATCH_HW).unwrap();
    let mut dataset = HomographyDataset::new();
    for _ in 0..count {
        let image = Tensor::from_fn(1, IMAGE_HW.0 * IMAGE_HW.1, |_r, _c| value).unwrap();
        let patch = crop_patch(&image, 1, IMAGE_HW, origin, PATCH_HW).unwrap();
        dataset.push(
            HomographySample::new(
                image.clone(),
                image,
                patch.clone(),
                patch,
                points.clone(),
            )
            .unwrap(),
        );
    }
    dataset
}

#[test]
fn repeated_steps_reduce_the_photometric_loss() {
    let mut model = HomographyNet::new(1, PATCH_HW, true).unwrap();
    model.attach_adam(1e-3, 0.9, 0.999, 1e-8).unwrap();
    let loss = PhotometricLoss::new(1, IMAGE_HW).unwrap();
    let dataset = smooth_identity_dataset(2);
    let batch = dataset
        .loader()
        .batched(2)
        .iter()
        .next()
        .unwrap()
        .unwrap();

    let initial = {
        let delta = model.forward_pair(&batch.patch_a, &batch.patch_b).unwrap();
        loss.forward(&delta, &batch.img_a, &batch.img_b, &batch.points)
            .unwrap()
            .data()[0]
    };
    for _ in 0..30 {
        model.zero_accumulators().unwrap();
        let delta = model.forward_pair(&batch.patch_a, &batch.patch_b).unwrap();
        let grad = loss
            .backward(&delta, &batch.img_a, &batch.img_b, &batch.points)
            .unwrap();
        model.backward_pair(&batch.patch_a, &batch.patch_b, &grad).unwrap();
        model.apply_step(1e-3).unwrap();
    }
    let final_loss = {
        let delta = model.forward_pair(&batch.patch_a, &batch.patch_b).unwrap();
        loss.forward(&delta, &batch.img_a, &batch.img_b, &batch.points)
            .unwrap()
            .data()[0]
    };
    assert!(
        final_loss < initial,
        "loss did not improve: {initial} -> {final_loss}"
    );
}

#[test]
fn apply_step_clears_gradient_accumulators() {
    let mut model = HomographyNet::new(1, PATCH_HW, true).unwrap();
    let loss = PhotometricLoss::new(1, IMAGE_HW).unwrap();
    let dataset = smooth_identity_dataset(2);
    let batch = dataset.loader().batched(2).iter().next().unwrap().unwrap();
    let delta = model.forward_pair(&batch.patch_a, &batch.patch_b).unwrap();
    let grad = loss
        .backward(&delta, &batch.img_a, &batch.img_b, &batch.points)
        .unwrap();
    model
        .backward_pair(&batch.patch_a, &batch.patch_b, &grad)
        .unwrap();
    model.apply_step(1e-3).unwrap();
    assert_eq!(model.accumulator_norm_sq().unwrap(), 0.0);
}

#[test]
fn fit_records_every_batch_and_epoch() {
    #[derive(Default)]
    struct Recorder {
        steps: Vec<usize>,
        epochs: Vec<EpochStats>,
    }
    impl MetricSink for Recorder {
        fn record_batch(&mut self, step: usize, loss: f32) {
            assert!(loss.is_finite());
            self.steps.push(step);
        }
        fn record_epoch(&mut self, stats: &EpochStats) {
            self.epochs.push(*stats);
        }
    }

    let config = test_config();
    let fit = Fit::new(config).unwrap();
    let mut model = HomographyNet::new(1, PATCH_HW, true).unwrap();
    let dataset = smooth_identity_dataset(4);
    let mut recorder = Recorder::default();
    let stats = fit.run(&mut model, &dataset, &mut recorder).unwrap();
    // 3 training samples in batches of 2 gives 2 batches per epoch; the step
    // counter keeps climbing across the epoch boundary.
    assert_eq!(recorder.steps, vec![0, 1, 2, 3]);
    assert_eq!(recorder.epochs, stats);
    assert_eq!(stats.len(), 2);
}

#[test]
fn checkpoint_restores_the_trained_parameters() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.epochs = 1;
    config.checkpoint_dir = Some(dir.path().to_path_buf());
    let fit = Fit::new(config).unwrap();
    let mut model = HomographyNet::new(1, PATCH_HW, true).unwrap();
    let dataset = smooth_identity_dataset(4);
    fit.run(&mut model, &dataset, &mut NullSink).unwrap();

    let mut restored = HomographyNet::new(1, PATCH_HW, true).unwrap();
    pw_nn::load_json(&mut restored, dir.path().join("model_0.json")).unwrap();
    assert_eq!(
        model.state_dict().unwrap(),
        restored.state_dict().unwrap()
    );

    let batch = dataset.loader().batched(2).iter().next().unwrap().unwrap();
    let lhs = model.forward_pair(&batch.patch_a, &batch.patch_b).unwrap();
    let rhs = restored
        .forward_pair(&batch.patch_a, &batch.patch_b)
        .unwrap();
    assert_eq!(lhs, rhs);

    // Running statistics travel with the checkpoint, so eval-mode outputs
    // agree as well.
    model.set_training(false);
    restored.set_training(false);
    let lhs = model.forward_pair(&batch.patch_a, &batch.patch_b).unwrap();
    let rhs = restored
        .forward_pair(&batch.patch_a, &batch.patch_b)
        .unwrap();
    assert_eq!(lhs, rhs);
}

// Aligned views under the untrained network: the predicted displacements
// start tiny, so both phases should score close to zero from the first
// evaluation.
#[test]
fn identity_pairs_score_near_zero_from_the_start() {
    let mut config = test_config();
    config.batch_size = 10;
    config.epochs = 1;
    config.train_fraction = 0.8;
    config.learning_rate = 1e-5;
    let fit = Fit::new(config).unwrap();
    let mut model = HomographyNet::new(1, PATCH_HW, true).unwrap();
    let dataset = flat_identity_dataset(100, 0.5);
    let stats = fit.run(&mut model, &dataset, &mut NullSink).unwrap();
    assert!(
        stats[0].train_loss < 0.05,
        "train loss {}",
        stats[0].train_loss
    );
    assert!(
        stats[0].valid_loss < 0.05,
        "valid loss {}",
        stats[0].valid_loss
    );
}

#[test]
fn rescale_flag_matches_prescaled_data() {
    let mut config = test_config();
    config.epochs = 1;
    let mut raw_config = config.clone();
    raw_config.rescale_intensity = true;

    let raw = flat_identity_dataset(4, 200.0);
    let prescaled = flat_identity_dataset(4, 200.0 * (1.0 / 255.0));

    let mut raw_model = HomographyNet::new(1, PATCH_HW, true).unwrap();
    let raw_stats = Fit::new(raw_config)
        .unwrap()
        .run(&mut raw_model, &raw, &mut NullSink)
        .unwrap();

    let mut scaled_model = HomographyNet::new(1, PATCH_HW, true).unwrap();
    let scaled_stats = Fit::new(config)
        .unwrap()
        .run(&mut scaled_model, &prescaled, &mut NullSink)
        .unwrap();

    assert_eq!(raw_stats, scaled_stats);
}
