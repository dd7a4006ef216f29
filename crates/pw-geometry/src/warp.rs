use crate::homography::Homography;
use pw_tensor::{PureResult, Tensor, TensorError};

/// Bilinear lookup into a single `h x w` channel plane with zero padding
/// outside the image bounds. Non-finite coordinates read as zero.
pub fn sample_bilinear(plane: &[f32], hw: (usize, usize), x: f64, y: f64) -> f32 {
    let (h, w) = hw;
    if !x.is_finite() || !y.is_finite() {
        return 0.0;
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
    (1.0 - fy) * ((1.0 - fx) * p00 + fx * p01) + fy * ((1.0 - fx) * p10 + fx * p11)
}

fn validate_images(
    images: &Tensor,
    channels: usize,
    image_hw: (usize, usize),
) -> PureResult<usize> {
    if channels == 0 || image_hw.0 == 0 || image_hw.1 == 0 {
        return Err(TensorError::InvalidDimensions {
            rows: channels,
            cols: image_hw.0 * image_hw.1,
        });
    }
    let (batch, cols) = images.shape();
    let expected = channels * image_hw.0 * image_hw.1;
    if cols != expected {
        return Err(TensorError::ShapeMismatch {
            left: (batch, cols),
            right: (batch, expected),
        });
    }
    Ok(batch)
}

fn warp_row(
    source: &[f32],
    target: &mut [f32],
    channels: usize,
    image_hw: (usize, usize),
    map: &Homography,
) {
    let (h, w) = image_hw;
    let plane = h * w;
    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = map.apply(x as f64, y as f64);
            for c in 0..channels {
                let channel = &source[c * plane..(c + 1) * plane];
                target[c * plane + y * w + x] = sample_bilinear(channel, image_hw, sx, sy);
            }
        }
    }
}

/// Warps every image row through the same transform. `map` is the sampling
/// direction: it takes output pixel coordinates to source coordinates, so
/// pass the inverse of a forward motion model.
pub fn warp_perspective(
    images: &Tensor,
    channels: usize,
    image_hw: (usize, usize),
    map: &Homography,
) -> PureResult<Tensor> {
    let batch = validate_images(images, channels, image_hw)?;
    let maps = vec![*map; batch];
    warp_perspective_each(images, channels, image_hw, &maps)
}

/// Warps each image row through its own sampling transform.
pub fn warp_perspective_each(
    images: &Tensor,
    channels: usize,
    image_hw: (usize, usize),
    maps: &[Homography],
) -> PureResult<Tensor> {
    let batch = validate_images(images, channels, image_hw)?;
    if maps.len() != batch {
        return Err(TensorError::ShapeMismatch {
            left: (maps.len(), 1),
            right: (batch, 1),
        });
    }
    let cols = images.shape().1;
    let mut out = Tensor::zeros(batch, cols)?;
    {
        let source = images.data();
        let target = out.data_mut();
        for b in 0..batch {
            warp_row(
                &source[b * cols..(b + 1) * cols],
                &mut target[b * cols..(b + 1) * cols],
                channels,
                image_hw,
                &maps[b],
            );
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homography::perspective_transform;

    #[test]
    fn identity_warp_copies_the_image() {
        let image = Tensor::from_fn(1, 2 * 3 * 3, |_r, c| c as f32 * 0.1).unwrap();
        let out = warp_perspective(&image, 2, (3, 3), &Homography::identity()).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn integer_translation_shifts_pixels_with_zero_fill() {
        // Sampling map x -> x - 1 pulls each pixel from its left neighbour.
        let src = [0.0, 0.0, 3.0, 0.0, 3.0, 3.0, 0.0, 3.0];
        let dst = [-1.0, 0.0, 2.0, 0.0, 2.0, 3.0, -1.0, 3.0];
        let map = perspective_transform(&src, &dst).unwrap();
        let image = Tensor::from_vec(1, 4, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = warp_perspective(&image, 1, (2, 2), &map).unwrap();
        assert_eq!(out.data(), &[0.0, 1.0, 0.0, 3.0]);
    }

    #[test]
    fn fractional_shift_blends_neighbours() {
        let src = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let dst = [-0.5, 0.0, 0.5, 0.0, 0.5, 1.0, -0.5, 1.0];
        let map = perspective_transform(&src, &dst).unwrap();
        let image = Tensor::from_vec(1, 2, vec![2.0, 4.0]).unwrap();
        let out = warp_perspective(&image, 1, (1, 2), &map).unwrap();
        // Pixel 1 samples halfway between pixels 0 and 1.
        assert!((out.data()[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn per_sample_maps_apply_independently() {
        let images = Tensor::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let src = [0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
        let dst = [-1.0, 0.0, 0.0, 0.0, 0.0, 1.0, -1.0, 1.0];
        let shift = perspective_transform(&src, &dst).unwrap();
        let out =
            warp_perspective_each(&images, 1, (1, 2), &[Homography::identity(), shift]).unwrap();
        assert_eq!(out.data(), &[1.0, 2.0, 0.0, 3.0]);
    }
}
