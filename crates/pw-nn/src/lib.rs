//! High-level neural module API for the PatchWarp stack.
//!
//! This crate offers a lightweight `nn.Module` style surface expressed in pure
//! Rust: every layer implements an explicit forward and backward pass, and
//! parameter updates flow through per-parameter accumulators with an optional
//! Adam tape attached.

pub mod dataset;
pub mod io;
pub mod layers;
pub mod module;
pub mod optim;

pub use dataset::{
    corner_points, crop_patch, synthetic_identity_pairs, HomographyBatch, HomographyDataset,
    HomographyLoader, HomographySample,
};
pub use io::{
    load_bincode, load_json, load_state_dict_json, save_bincode, save_json, save_state_dict_json,
};
pub use layers::conv::{Conv2d, MaxPool2d};
pub use layers::linear::Linear;
pub use layers::normalization::BatchNorm2d;
pub use layers::sequential::Sequential;
pub use layers::Relu;
pub use module::{Module, Parameter};
pub use optim::AdamTape;

pub use pw_tensor::{PureResult, Tensor, TensorError};
