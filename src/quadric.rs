//! Symmetric 4x4 error quadrics, stored as the 10 independent scalars.
//!
//! A quadric represents the sum of squared distances to a set of planes as
//! `xᵀ Q x` for homogeneous `x = (x, y, z, 1)`. Summing quadrics and
//! evaluating the result at a candidate point is the whole of the Quadric
//! Error Metric; see Garland & Heckbert, "Surface Simplification Using
//! Quadric Error Metrics" (1997).

use nalgebra::Point3;
use std::ops::{Add, AddAssign};

/// A symmetric 4x4 matrix, stored as its 10 independent entries in the
/// order `[m00, m01, m02, m03, m11, m12, m13, m22, m23, m33]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SymmetricMatrix {
    m: [f64; 10],
}

impl SymmetricMatrix {
    pub const ZERO: SymmetricMatrix = SymmetricMatrix { m: [0.0; 10] };

    /// The quadric for the plane `ax + by + cz + d = 0`.
    pub fn from_plane(a: f64, b: f64, c: f64, d: f64) -> Self {
        SymmetricMatrix {
            m: [
                a * a,
                a * b,
                a * c,
                a * d,
                b * b,
                b * c,
                b * d,
                c * c,
                c * d,
                d * d,
            ],
        }
    }

    #[inline]
    pub fn get(&self, index: usize) -> f64 {
        self.m[index]
    }

    /// Determinant of the 3x3 submatrix picked out by the given 9 indices
    /// into the 10-scalar storage.
    #[allow(clippy::too_many_arguments)]
    pub fn det(
        &self,
        a11: usize,
        a12: usize,
        a13: usize,
        a21: usize,
        a22: usize,
        a23: usize,
        a31: usize,
        a32: usize,
        a33: usize,
    ) -> f64 {
        self.m[a11] * self.m[a22] * self.m[a33]
            + self.m[a13] * self.m[a21] * self.m[a32]
            + self.m[a12] * self.m[a23] * self.m[a31]
            - self.m[a13] * self.m[a22] * self.m[a31]
            - self.m[a11] * self.m[a23] * self.m[a32]
            - self.m[a12] * self.m[a21] * self.m[a33]
    }
}

impl Default for SymmetricMatrix {
    fn default() -> Self {
        SymmetricMatrix::ZERO
    }
}

impl Add for SymmetricMatrix {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        let mut m = self.m;
        for i in 0..10 {
            m[i] += rhs.m[i];
        }
        SymmetricMatrix { m }
    }
}

impl AddAssign for SymmetricMatrix {
    fn add_assign(&mut self, rhs: Self) {
        for i in 0..10 {
            self.m[i] += rhs.m[i];
        }
    }
}

/// The determinant of the top-left 3x3 block, used both to test invertibility
/// and (via Cramer's rule callers) to find the optimal collapse point.
#[inline]
pub fn top_left_det(q: &SymmetricMatrix) -> f64 {
    q.det(0, 1, 2, 1, 4, 5, 2, 5, 7)
}

/// `xᵀ Q x` for homogeneous `x = (x, y, z, 1)`.
pub fn vertex_error(q: &SymmetricMatrix, x: f64, y: f64, z: f64) -> f64 {
    q.get(0) * x * x
        + 2.0 * q.get(1) * x * y
        + 2.0 * q.get(2) * x * z
        + 2.0 * q.get(3) * x
        + q.get(4) * y * y
        + 2.0 * q.get(5) * y * z
        + 2.0 * q.get(6) * y
        + q.get(7) * z * z
        + 2.0 * q.get(8) * z
        + q.get(9)
}

/// Convenience overload taking a `Point3` directly.
pub fn vertex_error_at(q: &SymmetricMatrix, p: &Point3<f64>) -> f64 {
    vertex_error(q, p.x, p.y, p.z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn plane_quadric_is_symmetric_outer_product() {
        let q = SymmetricMatrix::from_plane(0.0, 0.0, 1.0, -2.0);
        // m00 = a*a = 0, m33 = d*d = 4
        assert_relative_eq!(q.get(0), 0.0);
        assert_relative_eq!(q.get(9), 4.0);
        // the plane z=2 evaluated at (0,0,2) should have zero quadric error
        assert_relative_eq!(vertex_error(&q, 0.0, 0.0, 2.0), 0.0, epsilon = 1e-12);
        // off-plane point should have positive error
        assert!(vertex_error(&q, 0.0, 0.0, 5.0) > 0.0);
    }

    #[test]
    fn addition_is_elementwise_and_commutative() {
        let a = SymmetricMatrix::from_plane(1.0, 0.0, 0.0, -1.0);
        let b = SymmetricMatrix::from_plane(0.0, 1.0, 0.0, -2.0);
        let sum1 = a + b;
        let sum2 = b + a;
        for i in 0..10 {
            assert_relative_eq!(sum1.get(i), sum2.get(i));
        }

        let mut acc = SymmetricMatrix::ZERO;
        acc += a;
        acc += b;
        for i in 0..10 {
            assert_relative_eq!(acc.get(i), sum1.get(i));
        }
    }

    #[test]
    fn zero_quadric_has_zero_determinant() {
        assert_relative_eq!(top_left_det(&SymmetricMatrix::ZERO), 0.0);
    }
}
