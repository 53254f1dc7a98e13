// src/cosmology.rs
//
// Flat LCDM background, used to place snapshots along the line of sight.

use crate::constants::HUBBLE_DISTANCE;

const SIMPSON_INTERVALS: usize = 2048;

/// Dimensionless Hubble rate H(a)/H0 for a flat universe.
#[inline]
pub fn hubble_rate(a: f64, omega_m: f64) -> f64 {
    (omega_m / (a * a * a) + (1.0 - omega_m)).sqrt()
}

/// Comoving distance (Mpc/h) to scale factor `a`.
///
/// chi(a) = c/H0 * int_a^1 da' / (a'^2 E(a')). Integrated in s = sqrt(a'),
/// which removes the a'^-1/2 behaviour of the matter-dominated tail.
pub fn comoving_distance(a: f64, omega_m: f64) -> f64 {
    assert!(a > 0.0 && a <= 1.0, "comoving_distance: a = {} outside (0, 1]", a);
    let s0 = a.sqrt();
    if s0 >= 1.0 {
        return 0.0;
    }
    // da = 2 s ds
    let f = |s: f64| {
        let a = s * s;
        2.0 * s / (a * a * hubble_rate(a, omega_m))
    };
    let n = SIMPSON_INTERVALS;
    let h = (1.0 - s0) / n as f64;
    let mut sum = f(s0) + f(1.0);
    for m in 1..n {
        let w = if m % 2 == 1 { 4.0 } else { 2.0 };
        sum += w * f(s0 + m as f64 * h);
    }
    HUBBLE_DISTANCE * sum * h / 3.0
}
