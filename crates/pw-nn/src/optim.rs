use crate::{PureResult, Tensor, TensorError};

/// Per-parameter Adam state.
///
/// The tape keeps the bias-corrected first and second moment estimates and is
/// consulted by [`crate::module::Parameter::apply_step`]; when no tape is
/// attached the parameter falls back to plain SGD with the caller's rate.
#[derive(Clone, Debug)]
pub struct AdamTape {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    step: u64,
    first: Tensor,
    second: Tensor,
}

impl AdamTape {
    /// Creates a fresh tape for a parameter of the given shape.
    pub fn new(
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        rows: usize,
        cols: usize,
    ) -> PureResult<Self> {
        if learning_rate <= 0.0 || !learning_rate.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "adam_learning_rate",
            });
        }
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(TensorError::InvalidValue { label: "adam_betas" });
        }
        if epsilon <= 0.0 || !epsilon.is_finite() {
            return Err(TensorError::NonFiniteValue {
                label: "adam_epsilon",
                value: epsilon,
            });
        }
        Ok(Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            step: 0,
            first: Tensor::zeros(rows, cols)?,
            second: Tensor::zeros(rows, cols)?,
        })
    }

    /// Returns the learning rate baked into the tape.
    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    /// Number of optimizer steps taken so far.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Folds an accumulated gradient into the moment estimates and applies the
    /// bias-corrected update to `value`.
    pub fn apply(&mut self, value: &mut Tensor, gradient: &Tensor) -> PureResult<()> {
        if value.shape() != gradient.shape() {
            return Err(TensorError::ShapeMismatch {
                left: value.shape(),
                right: gradient.shape(),
            });
        }
        self.step += 1;
        let bias1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias2 = 1.0 - self.beta2.powi(self.step as i32);
        let first = self.first.data_mut();
        let second = self.second.data_mut();
        let values = value.data_mut();
        for ((m, v), (value, &g)) in first
            .iter_mut()
            .zip(second.iter_mut())
            .zip(values.iter_mut().zip(gradient.data().iter()))
        {
            *m = self.beta1 * *m + (1.0 - self.beta1) * g;
            *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *value -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
        Ok(())
    }

    /// Resets the moment estimates and step counter.
    pub fn reset(&mut self) {
        self.step = 0;
        for value in self.first.data_mut() {
            *value = 0.0;
        }
        for value in self.second.data_mut() {
            *value = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_hyperparameters() {
        assert!(AdamTape::new(0.0, 0.9, 0.999, 1e-8, 1, 1).is_err());
        assert!(AdamTape::new(1e-3, 1.0, 0.999, 1e-8, 1, 1).is_err());
        assert!(AdamTape::new(1e-3, 0.9, 0.999, 0.0, 1, 1).is_err());
    }

    #[test]
    fn first_step_moves_against_gradient_by_roughly_lr() {
        let mut tape = AdamTape::new(0.1, 0.9, 0.999, 1e-8, 1, 1).unwrap();
        let mut value = Tensor::from_vec(1, 1, vec![1.0]).unwrap();
        let gradient = Tensor::from_vec(1, 1, vec![0.5]).unwrap();
        tape.apply(&mut value, &gradient).unwrap();
        // After bias correction the first Adam step is ~lr in the gradient's direction.
        assert!((value.data()[0] - 0.9).abs() < 1e-4);
        assert_eq!(tape.step_count(), 1);
    }

    #[test]
    fn repeated_steps_descend_a_quadratic() {
        let mut tape = AdamTape::new(0.05, 0.9, 0.999, 1e-8, 1, 1).unwrap();
        let mut value = Tensor::from_vec(1, 1, vec![2.0]).unwrap();
        for _ in 0..200 {
            let gradient = value.scale(2.0).unwrap(); // d/dx x^2
            tape.apply(&mut value, &gradient).unwrap();
        }
        assert!(value.data()[0].abs() < 0.1);
    }
}
