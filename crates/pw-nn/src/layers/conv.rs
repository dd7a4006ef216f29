use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use pw_tensor::seed_for;
use std::cell::RefCell;

fn validate_positive(value: usize, _label: &str) -> PureResult<()> {
    if value == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: 1,
            cols: value,
        });
    }
    Ok(())
}

/// 2-D convolution over feature maps flattened to `(batch, channels * h * w)`
/// rows in channel-major order.
///
/// The spatial geometry is fixed at construction so that output sizes and the
/// im2col buffers are validated once instead of on every forward pass.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Parameter,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let bound = 1.0 / (span as f32).sqrt();
        let weight =
            Tensor::random_uniform(out_channels, span, -bound, bound, Some(seed_for(&name)))?;
        let bias = Tensor::zeros(1, out_channels)?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Parameter::new(format!("{name}::bias"), bias),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        // Validate configuration by computing the output size once during construction.
        conv.output_hw()?;
        Ok(conv)
    }

    /// Returns the `(height, width)` of the produced feature maps.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    /// Returns the number of output channels.
    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let cols = input.shape().1;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        {
            let input_data = input.data();
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = &input_data[b * cols..(b + 1) * cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let offset = row_index * kernel_elems;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h =
                                        (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w =
                                        (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    column_data[offset + col_idx] = if idx_h < 0
                                        || idx_w < 0
                                        || idx_h >= h as isize
                                        || idx_w >= w as isize
                                    {
                                        0.0
                                    } else {
                                        let ih = idx_h as usize;
                                        let iw = idx_w as usize;
                                        row[channel_offset + ih * w + iw]
                                    };
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, cols: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let expected_rows = batch * oh * ow;
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        if cols.shape() != (expected_rows, kernel_elems) {
            return Err(TensorError::ShapeMismatch {
                left: cols.shape(),
                right: (expected_rows, kernel_elems),
            });
        }
        let mut output =
            Tensor::zeros(batch, self.in_channels * self.input_hw.0 * self.input_hw.1)?;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let spatial = oh * ow;
        let output_cols = output.shape().1;
        {
            let cols_data = cols.data();
            let output_data = output.data_mut();
            for b in 0..batch {
                let (start, end) = (b * output_cols, (b + 1) * output_cols);
                let grad_in_row = &mut output_data[start..end];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * spatial + oh_idx * ow + ow_idx;
                        let column_row =
                            &cols_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h =
                                        (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w =
                                        (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    if idx_h >= 0
                                        && idx_w >= 0
                                        && idx_h < h as isize
                                        && idx_w < w as isize
                                    {
                                        let ih = idx_h as usize;
                                        let iw = idx_w as usize;
                                        let index = channel_offset + ih * w + iw;
                                        grad_in_row[index] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    fn grad_output_to_matrix(
        &self,
        grad_output: &Tensor,
        batch: usize,
        oh: usize,
        ow: usize,
    ) -> PureResult<Tensor> {
        let mut matrix = Tensor::zeros(batch * oh * ow, self.out_channels)?;
        let grad_cols = grad_output.shape().1;
        let spatial = oh * ow;
        {
            let grad_data = grad_output.data();
            let matrix_data = matrix.data_mut();
            for b in 0..batch {
                let grad_row = &grad_data[b * grad_cols..(b + 1) * grad_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * spatial + oh_idx * ow + ow_idx;
                        let offset = row_index * self.out_channels;
                        for oc in 0..self.out_channels {
                            let grad_idx = oc * spatial + oh_idx * ow + ow_idx;
                            matrix_data[offset + oc] = grad_row[grad_idx];
                        }
                    }
                }
            }
        }
        Ok(matrix)
    }

    fn validate_input(&self, input: &Tensor) -> PureResult<usize> {
        let (batch, cols) = input.shape();
        let expected_cols = self.in_channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected_cols {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, expected_cols),
            });
        }
        Ok(batch)
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let batch = self.validate_input(input)?;
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, batch, oh, ow)?;
        // (batch * spatial, span) x (span, out_channels)
        let contracted = patches.matmul(&self.weight.value().transpose())?;
        let spatial = oh * ow;
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        let bias = self.bias.value().data();
        {
            let contracted_data = contracted.data();
            let out_data = out.data_mut();
            for b in 0..batch {
                for s in 0..spatial {
                    let row_start = (b * spatial + s) * self.out_channels;
                    for oc in 0..self.out_channels {
                        let target = b * self.out_channels * spatial + oc * spatial + s;
                        out_data[target] = contracted_data[row_start + oc] + bias[oc];
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let batch = self.validate_input(input)?;
        let (oh, ow) = self.output_hw()?;
        if grad_output.shape() != (batch, self.out_channels * oh * ow) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * oh * ow),
            });
        }
        let patches = self.im2col(input, batch, oh, ow)?;
        let grad_matrix = self.grad_output_to_matrix(grad_output, batch, oh, ow)?;

        let grad_weight = grad_matrix.transpose().matmul(&patches)?;
        self.weight.accumulate(&grad_weight)?;
        let bias_sums = grad_matrix.sum_axis0();
        let bias_tensor = Tensor::from_vec(1, self.out_channels, bias_sums)?;
        self.bias.accumulate(&bias_tensor)?;

        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        self.col2im(&grad_patches, batch, oh, ow)
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

/// Max pooling over 2-D feature maps. Remembers winner positions from the
/// latest forward pass so that the backward pass can route gradients.
#[derive(Debug)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    input_hw: (usize, usize),
    last_indices: RefCell<Vec<usize>>,
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        if input_hw.0 < kernel.0 || input_hw.1 < kernel.1 {
            return Err(TensorError::InvalidDimensions {
                rows: input_hw.0,
                cols: input_hw.1,
            });
        }
        Ok(Self {
            channels,
            kernel,
            stride,
            input_hw,
            last_indices: RefCell::new(Vec::new()),
        })
    }

    /// Returns the `(height, width)` of the pooled feature maps.
    pub fn output_hw(&self) -> (usize, usize) {
        let (h, w) = self.input_hw;
        (
            (h - self.kernel.0) / self.stride.0 + 1,
            (w - self.kernel.1) / self.stride.1 + 1,
        )
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let expected = self.channels * self.input_hw.0 * self.input_hw.1;
        if cols != expected {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, expected),
            });
        }
        let (oh, ow) = self.output_hw();
        let mut out = Tensor::zeros(batch, self.channels * oh * ow)?;
        let mut indices = self.last_indices.borrow_mut();
        indices.clear();
        indices.resize(batch * self.channels * oh * ow, 0);
        let (h, w) = self.input_hw;
        let out_cols = out.shape().1;
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                let (start, end) = (b * out_cols, (b + 1) * out_cols);
                let out_row = &mut out_data[start..end];
                for c in 0..self.channels {
                    let channel_offset = c * h * w;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let mut best = f32::MIN;
                            let mut best_idx = channel_offset;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h = oh_idx * self.stride.0 + kh;
                                    let idx_w = ow_idx * self.stride.1 + kw;
                                    if idx_h >= h || idx_w >= w {
                                        continue;
                                    }
                                    let index = channel_offset + idx_h * w + idx_w;
                                    let value = row[index];
                                    if value > best {
                                        best = value;
                                        best_idx = index;
                                    }
                                }
                            }
                            let out_index = c * (oh * ow) + oh_idx * ow + ow_idx;
                            out_row[out_index] = best;
                            indices[b * self.channels * oh * ow + out_index] = best_idx;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, _input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        let (oh, ow) = self.output_hw();
        if cols != self.channels * oh * ow {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.channels * oh * ow),
            });
        }
        let mut grad_input =
            Tensor::zeros(batch, self.channels * self.input_hw.0 * self.input_hw.1)?;
        let indices = self.last_indices.borrow();
        if indices.len() != batch * cols {
            return Err(TensorError::InvalidValue {
                label: "maxpool_backward_without_forward",
            });
        }
        let grad_input_cols = grad_input.shape().1;
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                let (start, end) = (b * grad_input_cols, (b + 1) * grad_input_cols);
                let grad_in_row = &mut grad_input_data[start..end];
                for idx in 0..cols {
                    let input_index = indices[b * cols + idx];
                    grad_in_row[input_index] += grad_row[idx];
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conv_identity_kernel_passes_center_through() {
        // 1x1 kernel with a unit weight acts as identity over the map.
        let mut conv = Conv2d::new("conv", 1, 1, (1, 1), (1, 1), (0, 0), (2, 2)).unwrap();
        conv.visit_parameters_mut(&mut |param| {
            if param.name().ends_with("::weight") {
                param.load_value(&Tensor::from_vec(1, 1, vec![1.0]).unwrap())?;
            }
            Ok(())
        })
        .unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.data(), input.data());
    }

    #[test]
    fn conv_same_padding_preserves_spatial_size() {
        let conv = Conv2d::new("conv", 2, 4, (3, 3), (1, 1), (1, 1), (8, 8)).unwrap();
        assert_eq!(conv.output_hw().unwrap(), (8, 8));
        let input = Tensor::zeros(3, 2 * 8 * 8).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.shape(), (3, 4 * 8 * 8));
    }

    #[test]
    fn conv_output_is_channel_major() {
        // Two output channels with constant kernels 1 and 2: each channel of
        // the output must be contiguous.
        let mut conv = Conv2d::new("conv", 1, 2, (1, 1), (1, 1), (0, 0), (1, 2)).unwrap();
        conv.visit_parameters_mut(&mut |param| {
            if param.name().ends_with("::weight") {
                param.load_value(&Tensor::from_vec(2, 1, vec![1.0, 2.0]).unwrap())?;
            }
            Ok(())
        })
        .unwrap();
        let input = Tensor::from_vec(1, 2, vec![3.0, 5.0]).unwrap();
        let output = conv.forward(&input).unwrap();
        assert_eq!(output.data(), &[3.0, 5.0, 6.0, 10.0]);
    }

    #[test]
    fn conv_gradient_matches_finite_difference() {
        let mut conv = Conv2d::new("conv", 1, 1, (2, 2), (1, 1), (0, 0), (3, 3)).unwrap();
        let input = Tensor::from_fn(1, 9, |_r, c| (c as f32 * 0.31).sin()).unwrap();
        // loss = sum(outputs); grad_output of ones.
        let grad_output = Tensor::from_fn(1, 4, |_r, _c| 1.0).unwrap();
        conv.backward(&input, &grad_output).unwrap();
        let analytic = conv.weight.gradient().unwrap().data()[0];

        let eps = 1e-3;
        let mut sum_at = |delta: f32| -> f32 {
            let mut bumped = conv.weight.value().clone();
            bumped.data_mut()[0] += delta;
            let original = conv.weight.value().clone();
            conv.weight.load_value(&bumped).unwrap();
            let out = conv.forward(&input).unwrap();
            conv.weight.load_value(&original).unwrap();
            out.data().iter().sum()
        };
        let numeric = (sum_at(eps) - sum_at(-eps)) / (2.0 * eps);
        assert!((analytic - numeric).abs() < 1e-2);
    }

    #[test]
    fn maxpool_selects_window_maximum_and_routes_gradient() {
        let mut pool = MaxPool2d::new(1, (2, 2), (2, 2), (2, 4)).unwrap();
        let input =
            Tensor::from_vec(1, 8, vec![1.0, 5.0, 2.0, 0.0, 3.0, 4.0, 1.0, 6.0]).unwrap();
        let output = pool.forward(&input).unwrap();
        assert_eq!(output.data(), &[5.0, 6.0]);

        let grad_output = Tensor::from_vec(1, 2, vec![0.5, 0.25]).unwrap();
        let grad_input = pool.backward(&input, &grad_output).unwrap();
        assert_eq!(
            grad_input.data(),
            &[0.0, 0.5, 0.0, 0.0, 0.0, 0.0, 0.0, 0.25]
        );
    }
}
