// src/grid.rs

/// Periodic cubic grid of `n`^3 vertices spanning a box of side `box_len`.
///
/// Vertex (i, j, k) sits at position (i, j, k) * dl. Linear ids are
/// `((i * n) + j) * n + k`, so the first axis is the slowest-varying one and
/// the id range of a slab of rows along axis 0 is contiguous.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid3D {
    pub n: usize,
    pub box_len: f64,
    pub dl: f64,
}

impl Grid3D {
    pub fn new(n: usize, box_len: f64) -> Self {
        assert!(n > 0, "Grid3D::new: n must be positive");
        assert!(box_len > 0.0, "Grid3D::new: box_len must be positive");
        Self {
            n,
            box_len,
            dl: box_len / n as f64,
        }
    }

    /// Total number of vertices.
    pub fn n_cells(&self) -> i64 {
        let n = self.n as i64;
        n * n * n
    }

    /// Wrap a signed index into [0, n).
    #[inline]
    pub fn wrap(&self, i: isize) -> usize {
        i.rem_euclid(self.n as isize) as usize
    }

    /// Linear id of (i, j, k); indices must already be in range.
    #[inline]
    pub fn id(&self, i: usize, j: usize, k: usize) -> i64 {
        debug_assert!(i < self.n && j < self.n && k < self.n);
        let n = self.n as i64;
        (i as i64 * n + j as i64) * n + k as i64
    }

    /// Linear id of a possibly out-of-range (i, j, k), wrapped periodically.
    #[inline]
    pub fn id_wrapped(&self, i: isize, j: isize, k: isize) -> i64 {
        self.id(self.wrap(i), self.wrap(j), self.wrap(k))
    }

    /// Inverse of [`Grid3D::id`].
    #[inline]
    pub fn ijk(&self, id: i64) -> [usize; 3] {
        debug_assert!(id >= 0 && id < self.n_cells());
        ijk_of(id, self.n)
    }

    /// Map a coordinate into the primary box [0, box_len).
    #[inline]
    pub fn wrap_position(&self, x: f64) -> f64 {
        let v = x.rem_euclid(self.box_len);
        // rem_euclid can round up to box_len for tiny negative inputs
        if v >= self.box_len {
            0.0
        } else {
            v
        }
    }

    /// Lower vertex index (unwrapped) and fractional offset of a coordinate.
    ///
    /// The offset is in [0, 1); the index is left unwrapped so that callers can
    /// shift it before wrapping.
    #[inline]
    pub fn locate(&self, x: f64) -> (isize, f64) {
        let s = x / self.dl;
        let i = s.floor();
        (i as isize, s - i)
    }
}

/// Corner offsets of a trilinear (CIC) cell, in the order of [`cic_weights`].
pub const CIC_CORNERS: [[isize; 3]; 8] = [
    [0, 0, 0],
    [0, 0, 1],
    [0, 1, 0],
    [0, 1, 1],
    [1, 0, 0],
    [1, 0, 1],
    [1, 1, 0],
    [1, 1, 1],
];

/// Trilinear weights of the 8 corners for fractional offsets in [0, 1)^3.
#[inline]
pub fn cic_weights(f: [f64; 3]) -> [f64; 8] {
    let mut w = [0.0; 8];
    for (m, o) in CIC_CORNERS.iter().enumerate() {
        let mut p = 1.0;
        for a in 0..3 {
            p *= if o[a] == 1 { f[a] } else { 1.0 - f[a] };
        }
        w[m] = p;
    }
    w
}

/// Split a linear id of an `n`^3 grid into (i, j, k).
#[inline]
pub fn ijk_of(id: i64, n: usize) -> [usize; 3] {
    let n = n as i64;
    let k = id % n;
    let j = (id / n) % n;
    let i = id / (n * n);
    [i as usize, j as usize, k as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_roundtrips_through_ijk() {
        let g = Grid3D::new(6, 12.0);
        assert_eq!(g.id(0, 0, 0), 0);
        assert_eq!(g.id(0, 0, 1), 1);
        assert_eq!(g.id(0, 1, 0), 6);
        assert_eq!(g.id(1, 0, 0), 36);
        assert_eq!(g.id(5, 5, 5), 215);
        assert_eq!(g.n_cells(), 216);
        for &(i, j, k) in &[(0, 0, 0), (1, 2, 3), (5, 0, 4), (3, 5, 5)] {
            assert_eq!(g.ijk(g.id(i, j, k)), [i, j, k]);
        }
    }

    #[test]
    fn wrapping_is_periodic() {
        let g = Grid3D::new(8, 1.0);
        for i in -20isize..20 {
            assert_eq!(g.wrap(i), g.wrap(i + 8), "i={}", i);
            assert_eq!(
                g.id_wrapped(i, 2 * i, -i),
                g.id_wrapped(i + 8, 2 * i - 8, -i + 16)
            );
        }
        assert_eq!(g.wrap(-1), 7);
        assert_eq!(g.wrap(8), 0);
    }

    #[test]
    fn positions_just_below_zero_match_positions_just_below_box_len() {
        let g = Grid3D::new(16, 100.0);
        let eps = 1e-3;
        let a = g.wrap_position(-eps);
        let b = g.wrap_position(100.0 - eps);
        assert!((a - b).abs() < 1e-9, "a={} b={}", a, b);

        let (ia, fa) = g.locate(a);
        let (ib, fb) = g.locate(b);
        assert_eq!(g.wrap(ia), g.wrap(ib));
        assert!((fa - fb).abs() < 1e-9);

        // tiny negative values must not land on box_len itself
        let c = g.wrap_position(-1e-300);
        assert!(c >= 0.0 && c < 100.0);
    }

    #[test]
    fn cic_weights_sum_to_one() {
        let fracs = [0.0, 1e-12, 0.25, 0.5, 0.731, 0.999_999];
        for &a in &fracs {
            for &b in &fracs {
                for &c in &fracs {
                    let w = cic_weights([a, b, c]);
                    let s: f64 = w.iter().sum();
                    assert!((s - 1.0).abs() < 1e-14, "({},{},{}) sum={}", a, b, c, s);
                    assert!(w.iter().all(|&x| x >= 0.0));
                }
            }
        }
        assert_eq!(cic_weights([0.0, 0.0, 0.0])[0], 1.0);
        assert_eq!(cic_weights([0.5, 0.5, 0.5])[7], 0.125);
    }
}
