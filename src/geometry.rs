//! Small geometric helpers that sit below the simplification engine.
//!
//! `nalgebra`'s `Point3`/`Vector3` already supply add/sub/scale, dot, cross
//! and normalize, so this module only adds what it doesn't: barycentric
//! coordinates and barycentric interpolation of a per-corner attribute.

use nalgebra::{Point3, Vector3};

/// Barycentric coordinates `(u, v, w)` of `p` against triangle `(a, b, c)`,
/// such that `p ≈ u*a + v*b + w*c`.
///
/// Divides by the Gram determinant `d00*d11 - d01*d01` with no guard: on a
/// degenerate (zero-area) triangle this produces non-finite output. That is
/// tolerated rather than special-cased, since a degenerate triangle is
/// expected to be marked deleted by the next collapse pass anyway.
pub fn barycentric(p: &Point3<f64>, a: &Point3<f64>, b: &Point3<f64>, c: &Point3<f64>) -> Vector3<f64> {
    let v0 = b - a;
    let v1 = c - a;
    let v2 = p - a;
    let d00 = v0.dot(&v0);
    let d01 = v0.dot(&v1);
    let d11 = v1.dot(&v1);
    let d20 = v2.dot(&v0);
    let d21 = v2.dot(&v1);
    let denom = d00 * d11 - d01 * d01;
    let v = (d11 * d20 - d01 * d21) / denom;
    let w = (d00 * d21 - d01 * d20) / denom;
    let u = 1.0 - v - w;
    Vector3::new(u, v, w)
}

/// Interpolate a per-corner 3-component attribute (UV or otherwise) at
/// point `p` on triangle `(a, b, c)` given its three corner values `attrs`.
pub fn barycentric_interpolate(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
    attrs: &[Vector3<f64>; 3],
) -> Vector3<f64> {
    let bary = barycentric(p, a, b, c);
    attrs[0] * bary.x + attrs[1] * bary.y + attrs[2] * bary.z
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn barycentric_of_corners_is_unit_basis() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);

        let bary_a = barycentric(&a, &a, &b, &c);
        assert_relative_eq!(bary_a, Vector3::new(1.0, 0.0, 0.0), epsilon = 1e-9);

        let bary_b = barycentric(&b, &a, &b, &c);
        assert_relative_eq!(bary_b, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-9);

        let centroid = Point3::from(((a.coords + b.coords + c.coords) / 3.0));
        let bary_centroid = barycentric(&centroid, &a, &b, &c);
        assert_relative_eq!(
            bary_centroid,
            Vector3::new(1.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0),
            epsilon = 1e-9
        );
    }

    #[test]
    fn interpolation_reproduces_corner_attrs() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);
        let attrs = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ];

        let out = barycentric_interpolate(&a, &a, &b, &c, &attrs);
        assert_relative_eq!(out, attrs[0], epsilon = 1e-9);

        let mid = Point3::from((a.coords + b.coords) / 2.0);
        let out_mid = barycentric_interpolate(&mid, &a, &b, &c, &attrs);
        assert_relative_eq!(out_mid, Vector3::new(0.5, 0.0, 0.0), epsilon = 1e-9);
    }
}
