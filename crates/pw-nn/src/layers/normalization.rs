use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Batch normalisation over 2-D feature maps flattened to
/// `(batch, channels * h * w)` rows in channel-major order.
///
/// Statistics are computed per channel across the batch and both spatial
/// axes. Running statistics accumulate during training and are used verbatim
/// in evaluation mode.
#[derive(Debug)]
pub struct BatchNorm2d {
    name: String,
    channels: usize,
    spatial: usize,
    epsilon: f32,
    momentum: f32,
    gamma: Parameter,
    beta: Parameter,
    running_mean: RefCell<Vec<f32>>,
    running_var: RefCell<Vec<f32>>,
    training: Cell<bool>,
    last_mean: RefCell<Option<Vec<f32>>>,
    last_inv_std: RefCell<Option<Vec<f32>>>,
}

impl BatchNorm2d {
    /// Creates a new layer for `channels` maps of `input_hw` pixels each.
    pub fn new(
        name: impl Into<String>,
        channels: usize,
        input_hw: (usize, usize),
        momentum: f32,
        epsilon: f32,
    ) -> PureResult<Self> {
        if channels == 0 || input_hw.0 == 0 || input_hw.1 == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: input_hw.0 * input_hw.1,
            });
        }
        if !(0.0..=1.0).contains(&momentum) || !momentum.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_momentum",
            });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "batchnorm_epsilon",
                value: epsilon,
            });
        }
        let name = name.into();
        let gamma = Tensor::from_vec(1, channels, vec![1.0; channels])?;
        let beta = Tensor::zeros(1, channels)?;
        Ok(Self {
            channels,
            spatial: input_hw.0 * input_hw.1,
            epsilon,
            momentum,
            gamma: Parameter::new(format!("{name}::gamma"), gamma),
            beta: Parameter::new(format!("{name}::beta"), beta),
            name,
            running_mean: RefCell::new(vec![0.0; channels]),
            running_var: RefCell::new(vec![1.0; channels]),
            training: Cell::new(true),
            last_mean: RefCell::new(None),
            last_inv_std: RefCell::new(None),
        })
    }

    /// Number of normalised channels.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Returns the momentum applied to the running statistics.
    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Returns the epsilon used to stabilise the variance estimate.
    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<usize> {
        let (rows, cols) = input.shape();
        if cols != self.channels * self.spatial {
            return Err(TensorError::ShapeMismatch {
                left: (rows, cols),
                right: (rows, self.channels * self.spatial),
            });
        }
        if rows == 0 {
            return Err(TensorError::EmptyInput("batchnorm_input"));
        }
        Ok(rows)
    }

    fn compute_stats(&self, input: &Tensor, batch: usize) -> (Vec<f32>, Vec<f32>) {
        let cols = self.channels * self.spatial;
        let count = (batch * self.spatial) as f32;
        let data = input.data();
        let mut mean = vec![0.0f32; self.channels];
        for b in 0..batch {
            for c in 0..self.channels {
                let start = b * cols + c * self.spatial;
                for value in &data[start..start + self.spatial] {
                    mean[c] += *value;
                }
            }
        }
        for value in mean.iter_mut() {
            *value /= count;
        }
        let mut variance = vec![0.0f32; self.channels];
        for b in 0..batch {
            for c in 0..self.channels {
                let start = b * cols + c * self.spatial;
                for value in &data[start..start + self.spatial] {
                    let centered = *value - mean[c];
                    variance[c] += centered * centered;
                }
            }
        }
        for value in variance.iter_mut() {
            *value /= count;
        }
        (mean, variance)
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        let cols = self.channels * self.spatial;
        let gamma = self.gamma.value().data();
        let beta = self.beta.value().data();

        let (mean, inv_std) = if self.training.get() {
            let (mean, variance) = self.compute_stats(input, batch);
            {
                let mut running_mean = self.running_mean.borrow_mut();
                let mut running_var = self.running_var.borrow_mut();
                for c in 0..self.channels {
                    running_mean[c] =
                        self.momentum * mean[c] + (1.0 - self.momentum) * running_mean[c];
                    running_var[c] =
                        self.momentum * variance[c] + (1.0 - self.momentum) * running_var[c];
                }
            }
            let inv_std: Vec<f32> = variance
                .iter()
                .map(|v| 1.0 / (v + self.epsilon).sqrt())
                .collect();
            *self.last_mean.borrow_mut() = Some(mean.clone());
            *self.last_inv_std.borrow_mut() = Some(inv_std.clone());
            (mean, inv_std)
        } else {
            let mean = self.running_mean.borrow().clone();
            let inv_std: Vec<f32> = self
                .running_var
                .borrow()
                .iter()
                .map(|v| 1.0 / (v + self.epsilon).sqrt())
                .collect();
            (mean, inv_std)
        };

        let mut output = Vec::with_capacity(batch * cols);
        let data = input.data();
        for b in 0..batch {
            for c in 0..self.channels {
                let start = b * cols + c * self.spatial;
                for value in &data[start..start + self.spatial] {
                    let normed = (*value - mean[c]) * inv_std[c];
                    output.push(normed * gamma[c] + beta[c]);
                }
            }
        }
        Tensor::from_vec(batch, cols, output)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let batch = self.guard_input(input)?;
        if input.shape() != grad_output.shape() {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        if !self.training.get() {
            return Err(TensorError::InvalidValue {
                label: "batchnorm_backward_eval",
            });
        }
        let mean = self
            .last_mean
            .borrow()
            .clone()
            .ok_or(TensorError::InvalidValue {
                label: "batchnorm_cached_mean",
            })?;
        let inv_std = self
            .last_inv_std
            .borrow()
            .clone()
            .ok_or(TensorError::InvalidValue {
                label: "batchnorm_cached_invstd",
            })?;

        let cols = self.channels * self.spatial;
        let count = (batch * self.spatial) as f32;
        let mut grad_input = vec![0.0f32; batch * cols];
        let mut grad_gamma = vec![0.0f32; self.channels];
        let mut grad_beta = vec![0.0f32; self.channels];
        let gamma = self.gamma.value().data();
        let input_data = input.data();
        let grad_data = grad_output.data();

        for c in 0..self.channels {
            let mut sum_grad = 0.0f32;
            let mut sum_grad_norm = 0.0f32;
            for b in 0..batch {
                let start = b * cols + c * self.spatial;
                for s in 0..self.spatial {
                    let idx = start + s;
                    let normed = (input_data[idx] - mean[c]) * inv_std[c];
                    let g = grad_data[idx];
                    let g_gamma = g * gamma[c];
                    sum_grad += g_gamma;
                    sum_grad_norm += g_gamma * normed;
                    grad_gamma[c] += g * normed;
                    grad_beta[c] += g;
                }
            }
            for b in 0..batch {
                let start = b * cols + c * self.spatial;
                for s in 0..self.spatial {
                    let idx = start + s;
                    let normed = (input_data[idx] - mean[c]) * inv_std[c];
                    let g_gamma = grad_data[idx] * gamma[c];
                    let term = (count * g_gamma - sum_grad - normed * sum_grad_norm) / count;
                    grad_input[idx] = term * inv_std[c];
                }
            }
        }

        let grad_gamma = Tensor::from_vec(1, self.channels, grad_gamma)?;
        let grad_beta = Tensor::from_vec(1, self.channels, grad_beta)?;
        self.gamma.accumulate(&grad_gamma)?;
        self.beta.accumulate(&grad_beta)?;
        Tensor::from_vec(batch, cols, grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.gamma)?;
        visitor(&self.beta)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.gamma)?;
        visitor(&mut self.beta)
    }

    fn set_training(&self, training: bool) {
        self.training.set(training);
    }

    fn buffer_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut buffers = HashMap::new();
        buffers.insert(
            format!("{}::running_mean", self.name),
            Tensor::from_vec(1, self.channels, self.running_mean.borrow().clone())?,
        );
        buffers.insert(
            format!("{}::running_var", self.name),
            Tensor::from_vec(1, self.channels, self.running_var.borrow().clone())?,
        );
        Ok(buffers)
    }

    fn load_buffer_dict(&mut self, buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        for (target, suffix) in [
            (&self.running_mean, "running_mean"),
            (&self.running_var, "running_var"),
        ] {
            let key = format!("{}::{suffix}", self.name);
            let Some(tensor) = buffers.get(&key) else {
                return Err(TensorError::MissingParameter { name: key });
            };
            if tensor.shape() != (1, self.channels) {
                return Err(TensorError::ShapeMismatch {
                    left: tensor.shape(),
                    right: (1, self.channels),
                });
            }
            *target.borrow_mut() = tensor.data().to_vec();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_forward_whitens_each_channel() {
        let norm = BatchNorm2d::new("bn", 1, (1, 2), 0.1, 1e-5).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = norm.forward(&input).unwrap();
        let mean: f32 = output.data().iter().sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        let var: f32 = output.data().iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn eval_mode_uses_running_statistics() {
        let norm = BatchNorm2d::new("bn", 1, (1, 1), 1.0, 1e-5).unwrap();
        let input = Tensor::from_vec(4, 1, vec![2.0, 2.0, 6.0, 6.0]).unwrap();
        // Momentum of one copies the batch stats straight into the buffers.
        norm.forward(&input).unwrap();
        norm.set_training(false);
        let sample = Tensor::from_vec(1, 1, vec![4.0]).unwrap();
        let output = norm.forward(&sample).unwrap();
        // Running mean is 4, running var 4: (4 - 4) / 2 = 0.
        assert!(output.data()[0].abs() < 1e-3);
    }

    #[test]
    fn backward_gradients_sum_to_zero_per_channel() {
        let mut norm = BatchNorm2d::new("bn", 2, (2, 2), 0.1, 1e-5).unwrap();
        let input = Tensor::from_fn(3, 8, |r, c| ((r * 8 + c) as f32 * 0.37).cos()).unwrap();
        norm.forward(&input).unwrap();
        let grad_output = Tensor::from_fn(3, 8, |r, c| ((r + c) as f32 * 0.11).sin()).unwrap();
        let grad_input = norm.backward(&input, &grad_output).unwrap();
        // Whitening removes the mean direction, so input gradients cancel.
        for c in 0..2 {
            let mut sum = 0.0f32;
            for b in 0..3 {
                for s in 0..4 {
                    sum += grad_input.data()[b * 8 + c * 4 + s];
                }
            }
            assert!(sum.abs() < 1e-4);
        }
    }

    #[test]
    fn backward_without_forward_is_rejected() {
        let mut norm = BatchNorm2d::new("bn", 1, (1, 1), 0.1, 1e-5).unwrap();
        let input = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        assert!(norm.backward(&input, &input).is_err());
    }
}
