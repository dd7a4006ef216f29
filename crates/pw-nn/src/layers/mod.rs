pub mod activation;
pub mod conv;
pub mod linear;
pub mod normalization;
pub mod sequential;

pub use activation::Relu;
pub use conv::{Conv2d, MaxPool2d};
pub use linear::Linear;
pub use normalization::BatchNorm2d;
pub use sequential::Sequential;
