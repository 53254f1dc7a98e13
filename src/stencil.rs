// src/stencil.rs
//
// Finite differences of a gathered potential and their trilinear
// interpolation at line-of-sight samples.
//
// Two stencil policies, chosen once per run and applied to every derivative:
//
//   Staggered (default)
//     d/dx_a      (f[+1] - f[0]) / dl              lives at vertex + dl/2 along a
//     d2/dx_a dx_b (f[+1,+1] - f[+1,0] - f[0,+1] + f[0,0]) / dl^2
//                                                  lives at vertex + dl/2 along a and b
//   Centered
//     d/dx_a      (f[+1] - f[-1]) / (2 dl)
//     d2/dx_a dx_b (f[+1,+1] - f[+1,-1] - f[-1,+1] + f[-1,-1]) / (4 dl^2)
//
// Diagonal second derivatives are always (f[+1] - 2 f[0] + f[-1]) / dl^2.
// Staggered values are interpolated at the sample shifted back by half a cell
// on the staggered axes.
//
// A vertex whose stencil reaches outside the gathered footprint has no value
// (None). Interpolation only ever touches vertices whose stencils are inside
// the footprint of the sample that asked for them; hitting a None there is fatal.

use serde::{Deserialize, Serialize};

use crate::grid::{CIC_CORNERS, Grid3D, cic_weights};
use crate::gridcell_hash::GridCellHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StencilPolicy {
    /// Face-centred gradient, vertex-centred mixed partials.
    #[default]
    Staggered,
    /// Centred gradient, direct-corner mixed partials.
    Centered,
}

impl StencilPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "staggered" | "face" | "vertex" => Some(StencilPolicy::Staggered),
            "centered" | "centred" | "direct" => Some(StencilPolicy::Centered),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StencilPolicy::Staggered => "staggered",
            StencilPolicy::Centered => "centered",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Derivative {
    Potential,
    /// d/dx_a
    First(usize),
    /// d2/dx_a dx_b, a <= b
    Second(usize, usize),
}

/// The three gradient components.
pub const GRADIENT: [Derivative; 3] = [
    Derivative::First(0),
    Derivative::First(1),
    Derivative::First(2),
];

/// Upper triangle of the Hessian, row by row.
pub const HESSIAN: [Derivative; 6] = [
    Derivative::Second(0, 0),
    Derivative::Second(0, 1),
    Derivative::Second(0, 2),
    Derivative::Second(1, 1),
    Derivative::Second(1, 2),
    Derivative::Second(2, 2),
];

impl Derivative {
    /// Axes on which this derivative's grid values sit half a cell off the vertices.
    pub fn shifted_axes(self, policy: StencilPolicy) -> [bool; 3] {
        let mut s = [false; 3];
        if policy == StencilPolicy::Staggered {
            match self {
                Derivative::First(a) => s[a] = true,
                Derivative::Second(a, b) if a != b => {
                    s[a] = true;
                    s[b] = true;
                }
                _ => {}
            }
        }
        s
    }
}

/// Stencil value of `d` at vertex `id`, or None if a neighbour is missing.
pub fn stencil_value(
    hash: &GridCellHash,
    grid: &Grid3D,
    policy: StencilPolicy,
    d: Derivative,
    id: i64,
) -> Option<f64> {
    let [i, j, k] = grid.ijk(id);
    let c = [i as isize, j as isize, k as isize];
    let f = |o: [isize; 3]| hash.value(grid.id_wrapped(c[0] + o[0], c[1] + o[1], c[2] + o[2]));
    let along = |a: usize, s: isize| {
        let mut o = [0isize; 3];
        o[a] = s;
        o
    };
    let dl = grid.dl;

    let v = match d {
        Derivative::Potential => f([0; 3])?,
        Derivative::First(a) => match policy {
            StencilPolicy::Staggered => (f(along(a, 1))? - f([0; 3])?) / dl,
            StencilPolicy::Centered => (f(along(a, 1))? - f(along(a, -1))?) / (2.0 * dl),
        },
        Derivative::Second(a, b) if a == b => {
            (f(along(a, 1))? - 2.0 * f([0; 3])? + f(along(a, -1))?) / (dl * dl)
        }
        Derivative::Second(a, b) => {
            let pair = |sa: isize, sb: isize| {
                let mut o = [0isize; 3];
                o[a] = sa;
                o[b] = sb;
                f(o)
            };
            match policy {
                StencilPolicy::Staggered => {
                    (pair(1, 1)? - pair(1, 0)? - pair(0, 1)? + pair(0, 0)?) / (dl * dl)
                }
                StencilPolicy::Centered => {
                    (pair(1, 1)? - pair(1, -1)? - pair(-1, 1)? + pair(-1, -1)?) / (4.0 * dl * dl)
                }
            }
        }
    };
    Some(v)
}

/// Stencil values for every gathered vertex, indexed like `hash.cells()`.
pub fn derivative_field(
    hash: &GridCellHash,
    grid: &Grid3D,
    policy: StencilPolicy,
    d: Derivative,
) -> Vec<Option<f64>> {
    hash.cells()
        .iter()
        .map(|c| stencil_value(hash, grid, policy, d, c.id))
        .collect()
}

/// Lower corner and fractional offsets of `pos`, shifted back by half a cell
/// on the `shifted` axes.
pub fn sample_cell(grid: &Grid3D, pos: [f64; 3], shifted: [bool; 3]) -> ([isize; 3], [f64; 3]) {
    let mut base = [0isize; 3];
    let mut frac = [0.0; 3];
    for a in 0..3 {
        let (mut i, mut dx) = grid.locate(grid.wrap_position(pos[a]));
        if shifted[a] {
            if dx < 0.5 {
                i -= 1;
                dx += 0.5;
            } else {
                dx -= 0.5;
            }
        }
        base[a] = i;
        frac[a] = dx;
    }
    (base, frac)
}

/// Trilinear interpolation of `field` (slot-indexed) at `pos`.
pub fn interpolate(
    hash: &GridCellHash,
    field: &[Option<f64>],
    grid: &Grid3D,
    pos: [f64; 3],
    shifted: [bool; 3],
) -> f64 {
    let (base, frac) = sample_cell(grid, pos, shifted);
    let w = cic_weights(frac);
    let mut val = 0.0;
    for (o, wm) in CIC_CORNERS.iter().zip(w) {
        let id = grid.id_wrapped(base[0] + o[0], base[1] + o[1], base[2] + o[2]);
        let Some(slot) = hash.get_existing(id) else {
            crate::fatal!("interpolation corner {} at {:?} was not gathered", id, pos);
        };
        let Some(v) = field[slot] else {
            crate::fatal!("interpolation corner {} at {:?} has no stencil value", id, pos);
        };
        val += v * wm;
    }
    val
}

/// Insert every vertex a sample at `pos` can touch: offsets -1..=2 on each
/// axis around its cell, which covers the interpolation corners of every
/// derivative together with their stencil neighbours.
pub fn insert_footprint(hash: &mut GridCellHash, grid: &Grid3D, pos: [f64; 3]) {
    let (base, _) = sample_cell(grid, pos, [false; 3]);
    for di in -1..=2 {
        for dj in -1..=2 {
            for dk in -1..=2 {
                hash.get_or_insert(grid.id_wrapped(base[0] + di, base[1] + dj, base[2] + dk));
            }
        }
    }
}
