use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::RefCell;
use std::collections::HashMap;

#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
    // Per-layer inputs recorded by the last forward pass. Backward consumes
    // them so that stateful layers are not run forward a second time.
    cached_inputs: RefCell<Vec<Tensor>>,
}

impl core::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    /// Creates an empty container.
    pub fn new() -> Self {
        Self {
            layers: Vec::new(),
            cached_inputs: RefCell::new(Vec::new()),
        }
    }

    /// Appends a new layer to the sequence.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    /// Appends a pre-boxed module to the sequence.
    pub fn push_boxed(&mut self, layer: Box<dyn Module>) {
        self.layers.push(layer);
    }

    /// Returns the number of layers registered in the container.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` when the container does not hold any layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut activ = input.clone();
        for layer in &self.layers {
            inputs.push(activ.clone());
            activ = layer.forward(&activ)?;
        }
        *self.cached_inputs.borrow_mut() = inputs;
        Ok(activ)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if self.layers.is_empty() {
            return Ok(grad_output.clone());
        }
        let inputs = self.cached_inputs.take();
        if inputs.len() != self.layers.len() || inputs[0].shape() != input.shape() {
            return Err(TensorError::InvalidValue {
                label: "sequential_backward_without_forward",
            });
        }
        let mut grad = grad_output.clone();
        for (idx, layer) in self.layers.iter_mut().enumerate().rev() {
            grad = layer.backward(&inputs[idx], &grad)?;
        }
        Ok(grad)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &self.layers {
            layer.visit_parameters(visitor)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.visit_parameters_mut(visitor)?;
        }
        Ok(())
    }

    fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }

    fn buffer_dict(&self) -> PureResult<HashMap<String, Tensor>> {
        let mut buffers = HashMap::new();
        for layer in &self.layers {
            buffers.extend(layer.buffer_dict()?);
        }
        Ok(buffers)
    }

    fn load_buffer_dict(&mut self, buffers: &HashMap<String, Tensor>) -> PureResult<()> {
        for layer in &mut self.layers {
            layer.load_buffer_dict(buffers)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::linear::Linear;
    use crate::layers::normalization::BatchNorm2d;

    #[test]
    fn forward_and_backward_update_parameters() {
        let mut seq = Sequential::new();
        seq.push(Linear::new("l1", 2, 3).unwrap());
        seq.push(Linear::new("l2", 3, 1).unwrap());

        let input = Tensor::from_vec(1, 2, vec![0.5, -0.1]).unwrap();
        let target = Tensor::from_vec(1, 1, vec![0.2]).unwrap();
        let output = seq.forward(&input).unwrap();
        let grad_out = output.sub(&target).unwrap();
        let _ = seq.backward(&input, &grad_out).unwrap();
        seq.apply_step(0.05).unwrap();
        let new_output = seq.forward(&input).unwrap();
        assert_ne!(output, new_output);
    }

    #[test]
    fn state_dict_round_trips_through_load() {
        let mut seq = Sequential::new();
        seq.push(Linear::new("l1", 2, 2).unwrap());
        let state = seq.state_dict().unwrap();
        let mut other = Sequential::new();
        other.push(Linear::new("l1", 2, 2).unwrap());
        other.load_state_dict(&state).unwrap();
        let input = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        assert_eq!(
            seq.forward(&input).unwrap(),
            other.forward(&input).unwrap()
        );
    }

    #[test]
    fn running_statistics_update_once_per_training_step() {
        let mut seq = Sequential::new();
        seq.push(BatchNorm2d::new("bn", 1, (1, 1), 0.5, 1e-5).unwrap());
        let input = Tensor::from_vec(2, 1, vec![2.0, 2.0]).unwrap();
        seq.forward(&input).unwrap();
        let grad = Tensor::from_vec(2, 1, vec![0.3, -0.2]).unwrap();
        let _ = seq.backward(&input, &grad).unwrap();
        seq.set_training(false);
        let sample = Tensor::from_vec(1, 1, vec![2.0]).unwrap();
        let output = seq.forward(&sample).unwrap();
        // A single momentum-0.5 update leaves the running mean at 1 and the
        // running variance at 0.5, so the sample maps to 1 / sqrt(0.5). A
        // second statistics update during backward would move it to 1.0.
        assert!((output.data()[0] - 1.0 / 0.5f32.sqrt()).abs() < 1e-3);
    }

    #[test]
    fn backward_without_forward_is_rejected() {
        let mut seq = Sequential::new();
        seq.push(Linear::new("l1", 2, 2).unwrap());
        let input = Tensor::from_vec(1, 2, vec![1.0, 2.0]).unwrap();
        let grad = Tensor::from_vec(1, 2, vec![0.1, 0.2]).unwrap();
        assert!(seq.backward(&input, &grad).is_err());
    }
}
