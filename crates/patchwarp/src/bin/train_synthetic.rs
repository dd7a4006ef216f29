//! Trains the corner regressor on synthetically generated identity pairs.
//!
//! Usage: `train-synthetic [config.json]`. Without an argument a small
//! smoke-test configuration is used. Epoch losses go to stdout as TSV and to
//! the tracing pipeline.

use patchwarp::{
    init_tracing, Fit, HomographyNet, TeeSink, TracingSink, TrainConfig, TsvSink,
};
use pw_nn::synthetic_identity_pairs;
use std::process::ExitCode;

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => TrainConfig::from_path(path)?,
        None => TrainConfig {
            image_hw: (64, 64),
            patch_hw: (32, 32),
            batch_size: 4,
            epochs: 3,
            learning_rate: 1e-4,
            ..TrainConfig::default()
        },
    };
    let dataset = synthetic_identity_pairs(
        32,
        config.channels,
        config.image_hw,
        config.patch_hw,
        config.seed,
    )?;
    let mut model = HomographyNet::new(config.channels, config.patch_hw, config.normalize)?;
    let fit = Fit::new(config)?;
    let mut sink = TeeSink::new(TracingSink, TsvSink::new(std::io::stdout()));
    fit.run(&mut model, &dataset, &mut sink)?;
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "training run failed");
            ExitCode::FAILURE
        }
    }
}
