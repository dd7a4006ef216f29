use crate::optim::AdamTape;
use crate::{PureResult, Tensor, TensorError};
use std::collections::HashMap;

/// Trainable parameter with a local gradient accumulator and an optional Adam
/// tape driving its updates.
pub struct Parameter {
    name: String,
    value: Tensor,
    gradient: Option<Tensor>,
    adam: Option<AdamTape>,
}

impl core::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let (rows, cols) = self.value.shape();
        write!(
            f,
            "Parameter(name={},shape=({},{}),has_grad={},has_adam={})",
            self.name,
            rows,
            cols,
            self.gradient.is_some(),
            self.adam.is_some()
        )
    }
}

impl Parameter {
    /// Creates a new parameter with the provided tensor value.
    pub fn new(name: impl Into<String>, value: Tensor) -> Self {
        Self {
            name: name.into(),
            value,
            gradient: None,
            adam: None,
        }
    }

    /// Returns the identifier assigned to the parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides an immutable view into the underlying tensor value.
    pub fn value(&self) -> &Tensor {
        &self.value
    }

    /// Provides a mutable view into the underlying tensor value.
    pub fn value_mut(&mut self) -> &mut Tensor {
        &mut self.value
    }

    /// Returns the currently accumulated gradient, if any was recorded since
    /// the last zero/step.
    pub fn gradient(&self) -> Option<&Tensor> {
        self.gradient.as_ref()
    }

    /// Attaches an Adam tape sized to this parameter.
    pub fn attach_adam(
        &mut self,
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> PureResult<()> {
        let (rows, cols) = self.value.shape();
        self.adam = Some(AdamTape::new(
            learning_rate,
            beta1,
            beta2,
            epsilon,
            rows,
            cols,
        )?);
        Ok(())
    }

    /// Provides access to the Adam tape when attached.
    pub fn adam(&self) -> Option<&AdamTape> {
        self.adam.as_ref()
    }

    fn assert_shape(&self, tensor: &Tensor) -> PureResult<()> {
        if self.value.shape() != tensor.shape() {
            return Err(TensorError::ShapeMismatch {
                left: self.value.shape(),
                right: tensor.shape(),
            });
        }
        Ok(())
    }

    /// Accumulates a gradient contribution into the local buffer.
    pub fn accumulate(&mut self, update: &Tensor) -> PureResult<()> {
        self.assert_shape(update)?;
        match self.gradient.as_mut() {
            Some(existing) => existing.add_scaled(update, 1.0)?,
            None => self.gradient = Some(update.clone()),
        }
        Ok(())
    }

    /// Clears the accumulated gradient buffer.
    pub fn zero_gradient(&mut self) {
        if let Some(grad) = self.gradient.as_mut() {
            for value in grad.data_mut() {
                *value = 0.0;
            }
        }
    }

    /// Squared L2 norm of the accumulated gradient; zero when nothing was
    /// recorded.
    pub fn gradient_norm_sq(&self) -> f64 {
        self.gradient
            .as_ref()
            .map(|grad| {
                grad.data()
                    .iter()
                    .map(|&value| {
                        let v = value as f64;
                        v * v
                    })
                    .sum()
            })
            .unwrap_or(0.0)
    }

    /// Applies the accumulated update through the Adam tape when attached, or
    /// as a plain SGD step with the supplied fallback learning rate. Clears
    /// the accumulator afterwards.
    pub fn apply_step(&mut self, fallback_lr: f32) -> PureResult<()> {
        let Some(gradient) = self.gradient.as_mut() else {
            return Ok(());
        };
        match self.adam.as_mut() {
            Some(tape) => tape.apply(&mut self.value, gradient)?,
            None => self.value.add_scaled(gradient, -fallback_lr)?,
        }
        for value in gradient.data_mut() {
            *value = 0.0;
        }
        Ok(())
    }

    /// Replaces the parameter value with the provided tensor.
    pub fn load_value(&mut self, value: &Tensor) -> PureResult<()> {
        self.assert_shape(value)?;
        self.value = value.clone();
        Ok(())
    }
}

/// Module trait in the `nn.Module` mould: explicit forward and backward passes
/// over `(batch, features)` tensors, with parameter visitors for optimizers
/// and persistence.
pub trait Module {
    /// Runs a forward pass.
    fn forward(&self, input: &Tensor) -> PureResult<Tensor>;

    /// Propagates a gradient backwards. Implementations populate their
    /// parameter accumulators before returning the gradient with respect to
    /// `input`.
    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor>;

    /// Visits immutable parameters.
    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Visits mutable parameters.
    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()>;

    /// Switches between training and evaluation behaviour. Only stateful
    /// layers (normalization) care; the default is a no-op.
    fn set_training(&self, _training: bool) {}

    /// Attaches an Adam tape to every parameter.
    fn attach_adam(
        &mut self,
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.attach_adam(learning_rate, beta1, beta2, epsilon)
        })
    }

    /// Applies every parameter update.
    fn apply_step(&mut self, fallback_lr: f32) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| param.apply_step(fallback_lr))
    }

    /// Clears gradient accumulators across every parameter.
    fn zero_accumulators(&mut self) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            param.zero_gradient();
            Ok(())
        })
    }

    /// Sum of squared gradient norms across every parameter.
    fn accumulator_norm_sq(&self) -> PureResult<f64> {
        let mut total = 0.0;
        self.visit_parameters(&mut |param| {
            total += param.gradient_norm_sq();
            Ok(())
        })?;
        Ok(total)
    }

    /// Captures a copy of every parameter tensor keyed by its canonical name.
    fn state_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        self.visit_parameters(&mut |param| {
            state.insert(param.name().to_string(), param.value().clone());
            Ok(())
        })?;
        Ok(state)
    }

    /// Restores parameters from a state dictionary produced by
    /// [`Module::state_dict`].
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> PureResult<()> {
        self.visit_parameters_mut(&mut |param| {
            let Some(value) = state.get(param.name()) else {
                return Err(TensorError::MissingParameter {
                    name: param.name().to_string(),
                });
            };
            param.load_value(value)
        })
    }

    /// Captures non-trainable state (normalisation running statistics) keyed
    /// by name. Modules without such state return an empty map.
    fn buffer_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        Ok(HashMap::new())
    }

    /// Restores non-trainable state captured by [`Module::buffer_dict`].
    fn load_buffer_dict(&mut self, _buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulate_then_step_clears_gradient() {
        let mut param = Parameter::new("w", Tensor::from_vec(1, 2, vec![1.0, -1.0]).unwrap());
        let update = Tensor::from_vec(1, 2, vec![0.5, 0.5]).unwrap();
        param.accumulate(&update).unwrap();
        param.accumulate(&update).unwrap();
        assert_eq!(param.gradient().unwrap().data(), &[1.0, 1.0]);
        param.apply_step(0.1).unwrap();
        assert_eq!(param.value().data(), &[0.9, -1.1]);
        assert_eq!(param.gradient_norm_sq(), 0.0);
    }

    #[test]
    fn adam_tape_overrides_fallback_rate() {
        let mut param = Parameter::new("w", Tensor::from_vec(1, 1, vec![1.0]).unwrap());
        param.attach_adam(0.1, 0.9, 0.999, 1e-8).unwrap();
        param
            .accumulate(&Tensor::from_vec(1, 1, vec![2.0]).unwrap())
            .unwrap();
        // The huge fallback rate must be ignored in favour of the tape.
        param.apply_step(100.0).unwrap();
        assert!((param.value().data()[0] - 0.9).abs() < 1e-3);
    }

    #[test]
    fn accumulate_rejects_shape_mismatch() {
        let mut param = Parameter::new("w", Tensor::zeros(1, 2).unwrap());
        let bad = Tensor::zeros(2, 2).unwrap();
        assert!(matches!(
            param.accumulate(&bad),
            Err(TensorError::ShapeMismatch { .. })
        ));
    }
}
