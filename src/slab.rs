// src/slab.rs
//
// Rank-local dense buffers of the distributed 3D transform.
//
// Real space: rows [start, start+len) of axis 0, full axes 1 and 2, with the
// last axis padded to 2*(n/2+1) entries (room for the half-complex spectrum).
// Spectral space: transposed layout, rows [start, start+len) of axis 1, then
// all of axis 0, then k in [0, n/2].

use rustfft::num_complex::Complex;

use crate::grid::ijk_of;

#[derive(Debug, Clone)]
pub struct DenseSlab {
    n: usize,
    stride: usize,
    start: usize,
    len: usize,
    pub(crate) data: Vec<f64>,
}

impl DenseSlab {
    pub fn new(n: usize, start: usize, len: usize) -> Self {
        assert!(start + len <= n, "DenseSlab: rows {}..{} exceed n={}", start, start + len, n);
        let stride = 2 * (n / 2 + 1);
        Self {
            n,
            stride,
            start,
            len,
            data: vec![0.0; len * n * stride],
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// First owned row along axis 0.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Number of owned rows along axis 0.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Padded length of the last axis.
    pub fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub fn owns_row(&self, i: usize) -> bool {
        i >= self.start && i < self.start + self.len
    }

    #[inline]
    fn offset(&self, i: usize, j: usize, k: usize) -> usize {
        if !self.owns_row(i) {
            crate::fatal!(
                "slab access to row {} outside owned rows {}..{}",
                i,
                self.start,
                self.start + self.len
            );
        }
        debug_assert!(j < self.n && k < self.n);
        ((i - self.start) * self.n + j) * self.stride + k
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize, k: usize) -> f64 {
        self.data[self.offset(i, j, k)]
    }

    /// Value at a linear grid id; the id must fall in an owned row.
    #[inline]
    pub fn get_id(&self, id: i64) -> f64 {
        let [i, j, k] = ijk_of(id, self.n);
        self.get(i, j, k)
    }

    /// Accumulate into a linear grid id; the id must fall in an owned row.
    #[inline]
    pub fn add_id(&mut self, id: i64, v: f64) {
        let [i, j, k] = ijk_of(id, self.n);
        let o = self.offset(i, j, k);
        self.data[o] += v;
    }

    /// Zero every entry, padding included.
    pub fn zero(&mut self) {
        self.data.fill(0.0);
    }

    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|&v| v == 0.0)
    }

    /// Overwrite every owned vertex with `f(i, j, k)` (global indices).
    pub fn fill_with(&mut self, mut f: impl FnMut(usize, usize, usize) -> f64) {
        for il in 0..self.len {
            let i = self.start + il;
            for j in 0..self.n {
                let base = (il * self.n + j) * self.stride;
                for k in 0..self.n {
                    self.data[base + k] = f(i, j, k);
                }
            }
        }
    }

    /// Sum over owned vertices (padding excluded).
    pub fn sum(&self) -> f64 {
        self.data
            .chunks(self.stride)
            .map(|row| row[..self.n].iter().sum::<f64>())
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct SpectralSlab {
    n: usize,
    nh: usize,
    start: usize,
    len: usize,
    pub(crate) data: Vec<Complex<f64>>,
}

impl SpectralSlab {
    pub fn new(n: usize, start: usize, len: usize) -> Self {
        let nh = n / 2 + 1;
        Self {
            n,
            nh,
            start,
            len,
            data: vec![Complex::new(0.0, 0.0); len * n * nh],
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// First owned index along axis 1.
    pub fn start(&self) -> usize {
        self.start
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mode (i, j, k), k in [0, n/2]; j must be an owned index.
    pub fn get(&self, i: usize, j: usize, k: usize) -> Complex<f64> {
        assert!(
            j >= self.start && j < self.start + self.len && i < self.n && k < self.nh,
            "SpectralSlab::get({}, {}, {}) out of range",
            i,
            j,
            k
        );
        self.data[((j - self.start) * self.n + i) * self.nh + k]
    }

    /// Visit every owned mode with its global (i, j, k) index.
    pub fn for_each_mode_mut(&mut self, mut f: impl FnMut([usize; 3], &mut Complex<f64>)) {
        let (n, nh, start) = (self.n, self.nh, self.start);
        if self.data.is_empty() {
            return;
        }
        for (jl, plane) in self.data.chunks_mut(n * nh).enumerate() {
            let j = start + jl;
            for i in 0..n {
                for k in 0..nh {
                    f([i, j, k], &mut plane[i * nh + k]);
                }
            }
        }
    }

    pub fn is_all_zero(&self) -> bool {
        self.data.iter().all(|c| c.re == 0.0 && c.im == 0.0)
    }
}
