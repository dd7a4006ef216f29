//! Projective geometry for patch alignment: a four-point homography solve,
//! a bilinear perspective warp, and the photometric loss that makes the
//! corner displacements trainable without ground-truth labels.

pub mod homography;
pub mod loss;
pub mod warp;

pub use homography::{perspective_transform, Homography};
pub use loss::PhotometricLoss;
pub use warp::{sample_bilinear, warp_perspective, warp_perspective_each};

pub use pw_tensor::{PureResult, Tensor, TensorError};
