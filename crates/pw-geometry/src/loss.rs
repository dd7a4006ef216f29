use crate::homography::{dlt_system, perspective_transform, Homography};
use crate::warp::sample_bilinear;
use nalgebra::SVector;
use pw_tensor::{PureResult, Tensor, TensorError};
use tracing::warn;

/// Mean absolute photometric error between the second view and the first
/// view warped by the homography induced by the predicted corner
/// displacements.
///
/// The forward pass solves one four-point system per sample and resamples
/// the first image; the backward pass returns the exact gradient of the
/// loss with respect to the `(batch, 8)` displacement tensor by
/// differentiating through both the bilinear lookup and the linear solve.
///
/// A sample whose displaced corners become collinear or coincident does not
/// abort the pass: it is warped with the identity transform, contributes a
/// zero gradient, and raises a warning.
#[derive(Clone, Debug)]
pub struct PhotometricLoss {
    channels: usize,
    image_hw: (usize, usize),
}

struct SampleGeometry {
    points: [f64; 8],
    points_hat: [f64; 8],
    map: Option<Homography>,
}

impl PhotometricLoss {
    pub fn new(channels: usize, image_hw: (usize, usize)) -> PureResult<Self> {
        if channels == 0 || image_hw.0 == 0 || image_hw.1 == 0 {
            return Err(TensorError::InvalidDimensions {
                rows: channels,
                cols: image_hw.0 * image_hw.1,
            });
        }
        Ok(Self { channels, image_hw })
    }

    /// Number of image channels the loss expects.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Image geometry the loss expects.
    pub fn image_hw(&self) -> (usize, usize) {
        self.image_hw
    }

    fn validate(
        &self,
        delta: &Tensor,
        img_a: &Tensor,
        img_b: &Tensor,
        points: &Tensor,
    ) -> PureResult<usize> {
        let (batch, delta_cols) = delta.shape();
        if delta_cols != 8 {
            return Err(TensorError::ShapeMismatch {
                left: delta.shape(),
                right: (batch, 8),
            });
        }
        if points.shape() != (batch, 8) {
            return Err(TensorError::ShapeMismatch {
                left: points.shape(),
                right: (batch, 8),
            });
        }
        let pixels = self.channels * self.image_hw.0 * self.image_hw.1;
        if img_a.shape() != (batch, pixels) {
            return Err(TensorError::ShapeMismatch {
                left: img_a.shape(),
                right: (batch, pixels),
            });
        }
        if img_b.shape() != img_a.shape() {
            return Err(TensorError::ShapeMismatch {
                left: img_b.shape(),
                right: img_a.shape(),
            });
        }
        if batch == 0 {
            return Err(TensorError::EmptyInput("photometric_batch"));
        }
        Ok(batch)
    }

    /// Solves the sampling transform for one sample. The map takes output
    /// pixel coordinates straight to source coordinates, so no inversion is
    /// needed afterwards.
    fn solve_sample(&self, delta: &Tensor, points: &Tensor, sample: usize) -> SampleGeometry {
        let delta_row = &delta.data()[sample * 8..(sample + 1) * 8];
        let points_row = &points.data()[sample * 8..(sample + 1) * 8];
        let mut src = [0.0f64; 8];
        let mut dst = [0.0f64; 8];
        for k in 0..8 {
            dst[k] = points_row[k] as f64;
            src[k] = dst[k] + delta_row[k] as f64;
        }
        let map = match perspective_transform(&src, &dst) {
            Ok(map) => Some(map),
            Err(_) => {
                warn!(
                    sample,
                    "displaced corners are degenerate; substituting the identity warp"
                );
                None
            }
        };
        SampleGeometry {
            points: dst,
            points_hat: src,
            map,
        }
    }

    /// Computes the scalar loss as a `(1, 1)` tensor.
    pub fn forward(
        &self,
        delta: &Tensor,
        img_a: &Tensor,
        img_b: &Tensor,
        points: &Tensor,
    ) -> PureResult<Tensor> {
        let batch = self.validate(delta, img_a, img_b, points)?;
        let (h, w) = self.image_hw;
        let plane = h * w;
        let cols = self.channels * plane;
        let total = (batch * cols) as f64;
        let mut accum = 0.0f64;
        for b in 0..batch {
            let geometry = self.solve_sample(delta, points, b);
            let map = geometry.map.unwrap_or_else(Homography::identity);
            let source = &img_a.data()[b * cols..(b + 1) * cols];
            let target = &img_b.data()[b * cols..(b + 1) * cols];
            for y in 0..h {
                for x in 0..w {
                    let (sx, sy) = map.apply(x as f64, y as f64);
                    for c in 0..self.channels {
                        let channel = &source[c * plane..(c + 1) * plane];
                        let value = sample_bilinear(channel, self.image_hw, sx, sy);
                        let residual = value - target[c * plane + y * w + x];
                        accum += residual.abs() as f64;
                    }
                }
            }
        }
        Tensor::from_vec(1, 1, vec![(accum / total) as f32])
    }

    /// Returns the gradient of the loss with respect to `delta` as a
    /// `(batch, 8)` tensor.
    pub fn backward(
        &self,
        delta: &Tensor,
        img_a: &Tensor,
        img_b: &Tensor,
        points: &Tensor,
    ) -> PureResult<Tensor> {
        let batch = self.validate(delta, img_a, img_b, points)?;
        let (h, w) = self.image_hw;
        let plane = h * w;
        let cols = self.channels * plane;
        let total = (batch * cols) as f64;
        let mut grad = Tensor::zeros(batch, 8)?;
        for b in 0..batch {
            let geometry = self.solve_sample(delta, points, b);
            let Some(map) = geometry.map else {
                continue;
            };
            let source = &img_a.data()[b * cols..(b + 1) * cols];
            let target = &img_b.data()[b * cols..(b + 1) * cols];
            let g = map.coeffs();
            let mut grad_g = SVector::<f64, 8>::zeros();
            for y in 0..h {
                for x in 0..w {
                    let xf = x as f64;
                    let yf = y as f64;
                    let wdiv = g[6] * xf + g[7] * yf + 1.0;
                    if wdiv.abs() < 1e-12 {
                        continue;
                    }
                    let sx = (g[0] * xf + g[1] * yf + g[2]) / wdiv;
                    let sy = (g[3] * xf + g[4] * yf + g[5]) / wdiv;
                    let mut grad_sx = 0.0f64;
                    let mut grad_sy = 0.0f64;
                    for c in 0..self.channels {
                        let channel = &source[c * plane..(c + 1) * plane];
                        let (value, dv_dx, dv_dy) =
                            bilinear_with_grad(channel, self.image_hw, sx, sy);
                        let residual = value - target[c * plane + y * w + x];
                        let sign = if residual > 0.0 {
                            1.0
                        } else if residual < 0.0 {
                            -1.0
                        } else {
                            0.0
                        };
                        grad_sx += sign * dv_dx as f64;
                        grad_sy += sign * dv_dy as f64;
                    }
                    if grad_sx == 0.0 && grad_sy == 0.0 {
                        continue;
                    }
                    let inv_w = 1.0 / wdiv;
                    grad_g[0] += grad_sx * xf * inv_w;
                    grad_g[1] += grad_sx * yf * inv_w;
                    grad_g[2] += grad_sx * inv_w;
                    grad_g[3] += grad_sy * xf * inv_w;
                    grad_g[4] += grad_sy * yf * inv_w;
                    grad_g[5] += grad_sy * inv_w;
                    grad_g[6] -= (grad_sx * sx + grad_sy * sy) * xf * inv_w;
                    grad_g[7] -= (grad_sx * sx + grad_sy * sy) * yf * inv_w;
                }
            }
            grad_g /= total;

            // Adjoint of the linear solve: with A(points_hat) g = b, a
            // perturbation of the corners gives dg = -A^{-1} dA g, so the
            // pullback is one transposed solve.
            let (a, _) = dlt_system(&geometry.points_hat, &geometry.points);
            let Some(lambda) = a.transpose().lu().solve(&grad_g) else {
                warn!(
                    sample = b,
                    "adjoint solve failed; dropping the gradient for this sample"
                );
                continue;
            };
            let grad_row = &mut grad.data_mut()[b * 8..(b + 1) * 8];
            for i in 0..4 {
                let x_i = geometry.points[2 * i];
                let y_i = geometry.points[2 * i + 1];
                let du = -(lambda[2 * i] * (g[0] - x_i * g[6])
                    + lambda[2 * i + 1] * (g[3] - y_i * g[6]));
                let dv = -(lambda[2 * i] * (g[1] - x_i * g[7])
                    + lambda[2 * i + 1] * (g[4] - y_i * g[7]));
                grad_row[2 * i] = du as f32;
                grad_row[2 * i + 1] = dv as f32;
            }
        }
        Ok(grad)
    }
}

/// Bilinear lookup together with its partial derivatives in the sampling
/// coordinates. Out-of-bounds neighbours read as zero, matching
/// [`sample_bilinear`].
fn bilinear_with_grad(plane: &[f32], hw: (usize, usize), x: f64, y: f64) -> (f32, f32, f32) {
    let (h, w) = hw;
    if !x.is_finite() || !y.is_finite() {
        return (0.0, 0.0, 0.0);
    }
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = (x - x0) as f32;
    let fy = (y - y0) as f32;
    let fetch = |ix: f64, iy: f64| -> f32 {
        if ix < 0.0 || iy < 0.0 || ix >= w as f64 || iy >= h as f64 {
            0.0
        } else {
            plane[iy as usize * w + ix as usize]
        }
    };
    let p00 = fetch(x0, y0);
    let p01 = fetch(x0 + 1.0, y0);
    let p10 = fetch(x0, y0 + 1.0);
    let p11 = fetch(x0 + 1.0, y0 + 1.0);
    let value = (1.0 - fy) * ((1.0 - fx) * p00 + fx * p01) + fy * ((1.0 - fx) * p10 + fx * p11);
    let dv_dx = (1.0 - fy) * (p01 - p00) + fy * (p11 - p10);
    let dv_dy = (1.0 - fx) * (p10 - p00) + fx * (p11 - p01);
    (value, dv_dx, dv_dy)
}
