// src/constants.rs
//
// Physical constants in the code's unit system:
// lengths in Mpc/h, masses in Msun/h, velocities in km/s.

use std::f64::consts::PI;

/// Speed of light (km/s).
pub const CSOL: f64 = 299_792.458;

/// Critical density today, (Msun/h) / (Mpc/h)^3.
pub const RHO_CRIT: f64 = 2.775_197_37e11;

/// Newton's constant, Mpc (km/s)^2 / Msun.
pub const G_NEWTON: f64 = 4.301_179_02e-9;

/// 4 pi G, the Poisson-equation prefactor.
pub const FOUR_PI_G: f64 = 4.0 * PI * G_NEWTON;

/// c / H0 with H0 = 100 h km/s/Mpc, in Mpc/h.
pub const HUBBLE_DISTANCE: f64 = CSOL / 100.0;
