use nalgebra::{Matrix3, SMatrix, SVector};
use pw_tensor::{PureResult, TensorError};

/// Plane projective transform stored as a row-major 3x3 matrix with the
/// bottom-right entry fixed to one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    h: [[f64; 3]; 3],
}

impl Homography {
    /// The identity transform.
    pub fn identity() -> Self {
        Self {
            h: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }

    /// Builds a transform from the eight free coefficients in row-major
    /// order; the ninth entry is the fixed gauge `h33 = 1`.
    pub fn from_coeffs(g: &SVector<f64, 8>) -> Self {
        Self {
            h: [
                [g[0], g[1], g[2]],
                [g[3], g[4], g[5]],
                [g[6], g[7], 1.0],
            ],
        }
    }

    /// Returns the eight free coefficients in row-major order.
    pub fn coeffs(&self) -> SVector<f64, 8> {
        SVector::<f64, 8>::from_row_slice(&[
            self.h[0][0],
            self.h[0][1],
            self.h[0][2],
            self.h[1][0],
            self.h[1][1],
            self.h[1][2],
            self.h[2][0],
            self.h[2][1],
        ])
    }

    /// Maps a point through the transform. The caller must cope with a
    /// non-finite result when the point sits on the line at infinity.
    pub fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let w = self.h[2][0] * x + self.h[2][1] * y + self.h[2][2];
        let u = (self.h[0][0] * x + self.h[0][1] * y + self.h[0][2]) / w;
        let v = (self.h[1][0] * x + self.h[1][1] * y + self.h[1][2]) / w;
        (u, v)
    }

    /// Returns the inverse transform, renormalised to the `h33 = 1` gauge,
    /// when the matrix is invertible.
    pub fn try_inverse(&self) -> Option<Self> {
        let m = Matrix3::<f64>::from_row_slice(&[
            self.h[0][0],
            self.h[0][1],
            self.h[0][2],
            self.h[1][0],
            self.h[1][1],
            self.h[1][2],
            self.h[2][0],
            self.h[2][1],
            self.h[2][2],
        ]);
        let inv = m.try_inverse()?;
        let pivot = inv[(2, 2)];
        if pivot.abs() < 1e-12 || !pivot.is_finite() {
            return None;
        }
        Some(Self {
            h: [
                [
                    inv[(0, 0)] / pivot,
                    inv[(0, 1)] / pivot,
                    inv[(0, 2)] / pivot,
                ],
                [
                    inv[(1, 0)] / pivot,
                    inv[(1, 1)] / pivot,
                    inv[(1, 2)] / pivot,
                ],
                [inv[(2, 0)] / pivot, inv[(2, 1)] / pivot, 1.0],
            ],
        })
    }
}

/// Assembles the linear system `A g = b` of the four-point direct linear
/// transform. `src` and `dst` hold four corners flattened as
/// `[x0, y0, .., x3, y3]`; the solution `g` maps `src` onto `dst`.
pub fn dlt_system(src: &[f64; 8], dst: &[f64; 8]) -> (SMatrix<f64, 8, 8>, SVector<f64, 8>) {
    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for i in 0..4 {
        let (u, v) = (src[2 * i], src[2 * i + 1]);
        let (x, y) = (dst[2 * i], dst[2 * i + 1]);
        let r = 2 * i;
        a[(r, 0)] = u;
        a[(r, 1)] = v;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -x * u;
        a[(r, 7)] = -x * v;
        b[r] = x;
        a[(r + 1, 3)] = u;
        a[(r + 1, 4)] = v;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -y * u;
        a[(r + 1, 7)] = -y * v;
        b[r + 1] = y;
    }
    (a, b)
}

/// Solves for the homography taking the four `src` corners onto the four
/// `dst` corners. Fails with [`TensorError::DegenerateGeometry`] when three
/// corners are collinear or two coincide.
pub fn perspective_transform(src: &[f64; 8], dst: &[f64; 8]) -> PureResult<Homography> {
    let (a, b) = dlt_system(src, dst);
    let g = a.lu().solve(&b).ok_or(TensorError::DegenerateGeometry {
        label: "perspective_transform",
    })?;
    if g.iter().any(|value| !value.is_finite()) {
        return Err(TensorError::DegenerateGeometry {
            label: "perspective_transform",
        });
    }
    Ok(Homography::from_coeffs(&g))
}
