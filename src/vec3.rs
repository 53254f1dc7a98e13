// src/vec3.rs

use std::f64::consts::PI;

/// 3D vector dot product.
#[inline]
pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Euclidean length.
#[inline]
pub fn norm(v: [f64; 3]) -> f64 {
    dot(v, v).sqrt()
}

/// Polar angle theta in [0, pi] and azimuth phi in [0, 2pi) of a direction.
pub fn vec2ang(v: [f64; 3]) -> (f64, f64) {
    let r = norm(v);
    let theta = (v[2] / r).clamp(-1.0, 1.0).acos();
    let mut phi = v[1].atan2(v[0]);
    if phi < 0.0 {
        phi += 2.0 * PI;
    }
    (theta, phi)
}

/// Projection of the Cartesian axes onto the sky-tangent basis (theta-hat, phi-hat)
/// at direction `n`.
///
/// Row `d` holds the (theta, phi) components of the unit vector along axis `d`,
/// i.e. `xhat = jac[0][0] thetahat + jac[0][1] phihat + (radial part)`.
pub fn tangent_jacobian(n: [f64; 3]) -> [[f64; 2]; 3] {
    let (theta, phi) = vec2ang(n);
    let (sint, cost) = theta.sin_cos();
    let (sinp, cosp) = phi.sin_cos();
    [
        [cosp * cost, -sinp],
        [sinp * cost, cosp],
        [-sint, 0.0],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn angles_of_axes() {
        let (t, p) = vec2ang([0.0, 0.0, 2.0]);
        assert!(t.abs() < 1e-15 && p.abs() < 1e-15);

        let (t, p) = vec2ang([0.0, -3.0, 0.0]);
        assert!((t - PI / 2.0).abs() < 1e-15);
        assert!((p - 1.5 * PI).abs() < 1e-15);
    }

    #[test]
    fn jacobian_rows_project_onto_orthonormal_tangent_basis() {
        let n = [0.3, -0.4, 0.5];
        let (theta, phi) = vec2ang(n);
        let that = [
            theta.cos() * phi.cos(),
            theta.cos() * phi.sin(),
            -theta.sin(),
        ];
        let phat = [-phi.sin(), phi.cos(), 0.0];
        let jac = tangent_jacobian(n);
        for d in 0..3 {
            assert!((jac[d][0] - that[d]).abs() < 1e-14);
            assert!((jac[d][1] - phat[d]).abs() < 1e-14);
        }
        // Tangent vectors are orthogonal to the line of sight.
        assert!(dot(that, n).abs() < 1e-14 * norm(n));
        assert!(dot(phat, n).abs() < 1e-14 * norm(n));
    }
}
