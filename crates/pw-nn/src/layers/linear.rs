use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use pw_tensor::seed_for;

/// Fully-connected layer over `(batch, features)` tensors.
#[derive(Debug)]
pub struct Linear {
    weight: Parameter,
    bias: Parameter,
}

impl Linear {
    /// Creates a new linear layer. Weights start from a deterministic uniform
    /// draw in `±1/sqrt(input_dim)` keyed by the layer name, biases at zero.
    pub fn new(name: impl Into<String>, input_dim: usize, output_dim: usize) -> PureResult<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: input_dim,
                cols: output_dim,
            });
        }
        let name = name.into();
        let bound = 1.0 / (input_dim as f32).sqrt();
        let weights = Tensor::random_uniform(
            input_dim,
            output_dim,
            -bound,
            bound,
            Some(seed_for(&name)),
        )?;
        let bias = Tensor::zeros(1, output_dim)?;
        Ok(Self {
            weight: Parameter::new(format!("{name}::weight"), weights),
            bias: Parameter::new(format!("{name}::bias"), bias),
        })
    }

    /// Returns a reference to the weight parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    /// Returns a reference to the bias parameter.
    pub fn bias(&self) -> &Parameter {
        &self.bias
    }
}

impl Module for Linear {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        if input.shape().1 != self.weight.value().shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: self.weight.value().shape(),
            });
        }
        let mut out = input.matmul(self.weight.value())?;
        out.add_row_inplace(self.bias.value().data())?;
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        if input.shape().0 != grad_output.shape().0 {
            return Err(TensorError::ShapeMismatch {
                left: input.shape(),
                right: grad_output.shape(),
            });
        }
        let grad_w = input.transpose().matmul(grad_output)?;
        self.weight.accumulate(&grad_w)?;

        let summed = grad_output.sum_axis0();
        let grad_b = Tensor::from_vec(1, summed.len(), summed)?;
        self.bias.accumulate(&grad_b)?;

        let weight_t = self.weight.value().transpose();
        let grad_input = grad_output.matmul(&weight_t)?;
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        visitor(&self.bias)?;
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        visitor(&mut self.bias)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_matches_manual_product() {
        let layer = Linear::new("fc", 3, 2).unwrap();
        let input = Tensor::from_vec(1, 3, vec![1.0, -2.0, 0.5]).unwrap();
        let output = layer.forward(&input).unwrap();
        let mut expected = input.matmul(layer.weight.value()).unwrap();
        expected.add_row_inplace(layer.bias.value().data()).unwrap();
        assert_eq!(output, expected);
    }

    #[test]
    fn same_name_yields_same_weights() {
        let a = Linear::new("fc", 8, 4).unwrap();
        let b = Linear::new("fc", 8, 4).unwrap();
        assert_eq!(a.weight().value(), b.weight().value());
        let c = Linear::new("other", 8, 4).unwrap();
        assert_ne!(a.weight().value(), c.weight().value());
    }

    #[test]
    fn backward_accumulates_exact_gradients() {
        let mut layer = Linear::new("fc", 2, 2).unwrap();
        let input = Tensor::from_vec(2, 2, vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let grad = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        layer.backward(&input, &grad).unwrap();
        // Identity input: grad_w equals grad_output transposed onto weights.
        let grad_w = layer.weight().gradient().unwrap();
        assert_eq!(grad_w.data(), &[1.0, 2.0, 3.0, 4.0]);
        let grad_b = layer.bias().gradient().unwrap();
        assert_eq!(grad_b.data(), &[4.0, 6.0]);
    }
}
