use pw_nn::{BatchNorm2d, Conv2d, Linear, MaxPool2d, Module, Parameter, Relu, Sequential};
use pw_tensor::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

const STAGE_WIDTHS: [usize; 5] = [64, 128, 256, 256, 256];
const HIDDEN_DIM: usize = 4096;
const BN_MOMENTUM: f32 = 0.1;
const BN_EPSILON: f32 = 1e-5;

/// Convolutional regressor predicting the four corner displacements that
/// align two patches.
///
/// The two patches are fused along the channel axis, pushed through five
/// downsampling stages of paired 3x3 convolutions with optional batch-norm,
/// and read out by a two-layer head. The output is an unconstrained
/// `(batch, 8)` displacement tensor.
pub struct HomographyNet {
    stack: Sequential,
    channels: usize,
    patch_hw: (usize, usize),
    batch_norm: bool,
}

impl core::fmt::Debug for HomographyNet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "HomographyNet(channels={},patch={:?})",
            self.channels, self.patch_hw
        )
    }
}

impl HomographyNet {
    /// Builds the network for patch pairs of `channels` image channels each.
    /// Both patch sides must be positive multiples of 32 so that five halving
    /// pools land on an integer grid. `batch_norm` controls whether each
    /// convolution is followed by a normalisation layer; it mirrors the
    /// `normalize` field of the training configuration.
    pub fn new(channels: usize, patch_hw: (usize, usize), batch_norm: bool) -> PureResult<Self> {
        if channels == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: 1,
            });
        }
        let (ph, pw) = patch_hw;
        if ph == 0 || pw == 0 || ph % 32 != 0 || pw % 32 != 0 {
            return Err(TensorError::InvalidDimensions { rows: ph, cols: pw });
        }
        let mut stack = Sequential::new();
        let mut hw = patch_hw;
        let mut width = 2 * channels;
        for (stage, &next) in STAGE_WIDTHS.iter().enumerate() {
            for half in 0..2 {
                let cin = if half == 0 { width } else { next };
                let label = format!("stage{stage}.conv{half}");
                stack.push(Conv2d::new(&label, cin, next, (3, 3), (1, 1), (1, 1), hw)?);
                stack.push(Relu::new());
                if batch_norm {
                    stack.push(BatchNorm2d::new(
                        format!("stage{stage}.bn{half}"),
                        next,
                        hw,
                        BN_MOMENTUM,
                        BN_EPSILON,
                    )?);
                }
            }
            stack.push(MaxPool2d::new(next, (2, 2), (2, 2), hw)?);
            hw = (hw.0 / 2, hw.1 / 2);
            width = next;
        }
        let feature_dim = width * hw.0 * hw.1;
        stack.push(Linear::new("head.fc0", feature_dim, HIDDEN_DIM)?);
        stack.push(Relu::new());
        stack.push(Linear::new("head.fc1", HIDDEN_DIM, 8)?);
        Ok(Self {
            stack,
            channels,
            patch_hw,
            batch_norm,
        })
    }

    /// Image channels per patch.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Patch geometry the network was built for.
    pub fn patch_hw(&self) -> (usize, usize) {
        self.patch_hw
    }

    /// Whether the stages carry normalisation layers.
    pub fn batch_norm(&self) -> bool {
        self.batch_norm
    }

    fn fuse(&self, patch_a: &Tensor, patch_b: &Tensor) -> PureResult<Tensor> {
        let expected = self.channels * self.patch_hw.0 * self.patch_hw.1;
        if patch_a.shape().1 != expected || patch_a.shape() != patch_b.shape() {
            return Err(TensorError::ShapeMismatch {
                left: patch_a.shape(),
                right: (patch_b.shape().0, expected),
            });
        }
        // Channel-major rows concatenate into a 2C-channel fused row.
        Tensor::cat_cols(&[patch_a.clone(), patch_b.clone()])
    }

    /// Predicts corner displacements for a batch of patch pairs.
    pub fn forward_pair(&self, patch_a: &Tensor, patch_b: &Tensor) -> PureResult<Tensor> {
        let fused = self.fuse(patch_a, patch_b)?;
        self.stack.forward(&fused)
    }

    /// Backpropagates a `(batch, 8)` displacement gradient, filling the
    /// parameter accumulators. The input gradient is discarded since patches
    /// are leaves.
    pub fn backward_pair(
        &mut self,
        patch_a: &Tensor,
        patch_b: &Tensor,
        grad_delta: &Tensor,
    ) -> PureResult<()> {
        let fused = self.fuse(patch_a, patch_b)?;
        let _ = self.stack.backward(&fused, grad_delta)?;
        Ok(())
    }
}

impl Module for HomographyNet {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.stack.forward(input)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.stack.backward(input, grad_output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stack.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stack.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.stack.set_training(training);
    }

    fn buffer_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        self.stack.buffer_dict()
    }

    fn load_buffer_dict(&mut self, buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        self.stack.load_buffer_dict(buffers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_is_batch_by_eight() {
        let net = HomographyNet::new(1, (32, 32), true).unwrap();
        let patch = Tensor::random_uniform(3, 32 * 32, 0.0, 1.0, Some(1)).unwrap();
        let other = Tensor::random_uniform(3, 32 * 32, 0.0, 1.0, Some(2)).unwrap();
        let delta = net.forward_pair(&patch, &other).unwrap();
        assert_eq!(delta.shape(), (3, 8));
    }

    #[test]
    fn rejects_patch_not_divisible_by_32() {
        assert!(HomographyNet::new(1, (48, 64), true).is_err());
        assert!(HomographyNet::new(1, (0, 32), true).is_err());
    }

    #[test]
    fn backward_populates_every_parameter() {
        let mut net = HomographyNet::new(1, (32, 32), true).unwrap();
        let patch = Tensor::random_uniform(2, 32 * 32, 0.0, 1.0, Some(3)).unwrap();
        let other = Tensor::random_uniform(2, 32 * 32, 0.0, 1.0, Some(4)).unwrap();
        let grad = Tensor::from_fn(2, 8, |_r, _c| 0.1).unwrap();
        net.forward_pair(&patch, &other).unwrap();
        net.backward_pair(&patch, &other, &grad).unwrap();
        let mut missing = 0usize;
        net.visit_parameters(&mut |param| {
            if param.gradient().is_none() {
                missing += 1;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(missing, 0);
    }

    #[test]
    fn construction_is_deterministic() {
        let a = HomographyNet::new(1, (32, 32), true).unwrap();
        let b = HomographyNet::new(1, (32, 32), true).unwrap();
        assert_eq!(a.state_dict().unwrap(), b.state_dict().unwrap());
    }

    #[test]
    fn batch_norm_flag_toggles_normalization_layers() {
        let with = HomographyNet::new(1, (32, 32), true).unwrap();
        let without = HomographyNet::new(1, (32, 32), false).unwrap();
        assert!(with
            .state_dict()
            .unwrap()
            .keys()
            .any(|name| name.contains("::gamma")));
        assert!(!without
            .state_dict()
            .unwrap()
            .keys()
            .any(|name| name.contains("::gamma")));
        let patch = Tensor::random_uniform(2, 32 * 32, 0.0, 1.0, Some(5)).unwrap();
        let other = Tensor::random_uniform(2, 32 * 32, 0.0, 1.0, Some(6)).unwrap();
        let delta = without.forward_pair(&patch, &other).unwrap();
        assert_eq!(delta.shape(), (2, 8));
    }
}
