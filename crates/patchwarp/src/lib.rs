//! Self-supervised homography estimation.
//!
//! A convolutional regressor ([`HomographyNet`]) predicts the displacement of
//! four patch corners between two views. No ground-truth motion is needed:
//! the displacements induce a homography whose photometric warp error
//! ([`pw_geometry::PhotometricLoss`]) is differentiable all the way back to
//! the network output, and [`Fit`] descends it with Adam.

pub mod config;
pub mod metrics;
pub mod model;
pub mod trainer;

pub use config::{CheckpointFormat, ConfigError, TrainConfig};
pub use metrics::{EpochStats, MetricSink, NullSink, TeeSink, TracingSink, TsvSink};
pub use model::HomographyNet;
pub use trainer::{Fit, RunManifest};

pub use pw_tensor::{PureResult, Tensor, TensorError};

use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static TRACING: OnceLock<()> = OnceLock::new();

/// Configures the global tracing subscriber once; later calls are no-ops.
/// The filter honours `RUST_LOG` and defaults to `info`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        Registry::default().with(filter).with(fmt_layer).init();
    });
}
