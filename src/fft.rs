// src/fft.rs
//
// Distributed, unnormalised 3D real-to-complex FFT over slabs.
//
// Layouts (n = grid size, nh = n/2 + 1):
//   real:     DenseSlab rows along axis 0, this rank's block of `slabs`
//   spectral: SpectralSlab rows along axis 1, same block distribution
//
// Forward: per-row transform along k (keep nh modes), columns along j, an
// all-to-all transpose (i-slabs -> j-slabs), then columns along i.
// Inverse runs the same steps backwards and completes each k-row by Hermitian
// symmetry before the last transform. Neither direction divides by n^3, so
// inverse(forward(f)) == n^3 * f.
//
// Row/column passes run on rayon; each worker owns one plane and a scratch
// column, so no two workers write the same memory.

use std::sync::Arc;

use rayon::prelude::*;
use rustfft::{Fft, FftPlanner, num_complex::Complex};

use crate::comm::{self, Communicator};
use crate::slab::{DenseSlab, SpectralSlab};

/// Block decomposition of `n` rows over `size` ranks: ceil(n/size) rows per
/// rank, trailing ranks take what is left (possibly nothing).
pub fn local_slab(n: usize, rank: usize, size: usize) -> (usize, usize) {
    assert!(size > 0 && rank < size, "local_slab: rank {} of {}", rank, size);
    let block = (n + size - 1) / size;
    let start = (rank * block).min(n);
    let len = block.min(n - start);
    (start, len)
}

pub struct SlabFft {
    n: usize,
    nh: usize,
    rank: usize,
    slabs: Vec<(usize, usize)>,
    fwd: Arc<dyn Fft<f64>>,
    inv: Arc<dyn Fft<f64>>,
}

impl SlabFft {
    pub fn new(n: usize, rank: usize, size: usize) -> Self {
        assert!(n > 0, "SlabFft::new: n must be positive");
        let mut planner = FftPlanner::<f64>::new();
        Self {
            n,
            nh: n / 2 + 1,
            rank,
            slabs: (0..size).map(|r| local_slab(n, r, size)).collect(),
            fwd: planner.plan_fft_forward(n),
            inv: planner.plan_fft_inverse(n),
        }
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// (start, len) of this rank's rows, axis 0 in real space and axis 1 in
    /// spectral space.
    pub fn local(&self) -> (usize, usize) {
        self.slabs[self.rank]
    }

    pub fn alloc_real(&self) -> DenseSlab {
        let (s, l) = self.local();
        DenseSlab::new(self.n, s, l)
    }

    pub fn alloc_spectral(&self) -> SpectralSlab {
        let (s, l) = self.local();
        SpectralSlab::new(self.n, s, l)
    }

    fn check_shapes(&self, real: &DenseSlab, spec: &SpectralSlab) {
        let (s, l) = self.local();
        assert!(
            real.n() == self.n && real.start() == s && real.len() == l,
            "SlabFft: real slab {}+{} (n={}) does not match plan {}+{} (n={})",
            real.start(),
            real.len(),
            real.n(),
            s,
            l,
            self.n
        );
        assert!(
            spec.n() == self.n && spec.start() == s && spec.len() == l,
            "SlabFft: spectral slab {}+{} does not match plan {}+{}",
            spec.start(),
            spec.len(),
            s,
            l
        );
    }

    /// Collective: every rank must call this.
    pub fn forward<C>(&self, comm: &C, real: &DenseSlab, out: &mut SpectralSlab)
    where
        C: Communicator + ?Sized,
    {
        self.check_shapes(real, out);
        let (n, nh) = (self.n, self.nh);
        let (_, xlen) = self.local();

        // 1) k rows, real -> half spectrum
        let mut work = vec![Complex::new(0.0, 0.0); xlen * n * nh];
        let fwd = &self.fwd;
        work.par_chunks_mut(nh)
            .zip(real.data.par_chunks(real.stride()))
            .for_each(|(dst, src)| {
                let mut row: Vec<Complex<f64>> =
                    src[..n].iter().map(|&x| Complex::new(x, 0.0)).collect();
                fwd.process(&mut row);
                dst.copy_from_slice(&row[..nh]);
            });

        // 2) j columns
        fft_columns(&mut work, n, nh, fwd);

        // 3) transpose: send [x-rows of mine] x [j-block of dst]
        let send: Vec<Vec<[f64; 2]>> = self
            .slabs
            .iter()
            .map(|&(ys, yl)| {
                let mut buf = Vec::with_capacity(xlen * yl * nh);
                for il in 0..xlen {
                    for j in ys..ys + yl {
                        let base = (il * n + j) * nh;
                        buf.extend(work[base..base + nh].iter().map(|c| [c.re, c.im]));
                    }
                }
                buf
            })
            .collect();
        let recv = comm::all_to_all(comm, send);

        let ylen = out.len();
        for (src, buf) in recv.iter().enumerate() {
            let (xs, xl) = self.slabs[src];
            assert_eq!(
                buf.len(),
                xl * ylen * nh,
                "SlabFft::forward: rank {} sent {} modes, expected {}",
                src,
                buf.len(),
                xl * ylen * nh
            );
            let mut rows = buf.chunks_exact(nh);
            for il in 0..xl {
                for jl in 0..ylen {
                    let Some(row) = rows.next() else { break };
                    let base = (jl * n + xs + il) * nh;
                    for (dst, v) in out.data[base..base + nh].iter_mut().zip(row) {
                        *dst = Complex::new(v[0], v[1]);
                    }
                }
            }
        }

        // 4) i columns
        fft_columns(&mut out.data, n, nh, fwd);
    }

    /// Collective: every rank must call this. `spec` is left untouched.
    pub fn inverse<C>(&self, comm: &C, spec: &SpectralSlab, real: &mut DenseSlab)
    where
        C: Communicator + ?Sized,
    {
        self.check_shapes(real, spec);
        let (n, nh) = (self.n, self.nh);
        let (_, xlen) = self.local();
        let ylen = spec.len();
        let inv = &self.inv;

        // 1) i columns
        let mut modes = spec.data.clone();
        fft_columns(&mut modes, n, nh, inv);

        // 2) transpose back: send [my j-rows] x [i-block of dst]
        let send: Vec<Vec<[f64; 2]>> = self
            .slabs
            .iter()
            .map(|&(xs, xl)| {
                let mut buf = Vec::with_capacity(ylen * xl * nh);
                for jl in 0..ylen {
                    for i in xs..xs + xl {
                        let base = (jl * n + i) * nh;
                        buf.extend(modes[base..base + nh].iter().map(|c| [c.re, c.im]));
                    }
                }
                buf
            })
            .collect();
        let recv = comm::all_to_all(comm, send);

        let mut work = vec![Complex::new(0.0, 0.0); xlen * n * nh];
        for (src, buf) in recv.iter().enumerate() {
            let (ys, yl) = self.slabs[src];
            assert_eq!(
                buf.len(),
                yl * xlen * nh,
                "SlabFft::inverse: rank {} sent {} modes, expected {}",
                src,
                buf.len(),
                yl * xlen * nh
            );
            let mut rows = buf.chunks_exact(nh);
            for jl in 0..yl {
                for il in 0..xlen {
                    let Some(row) = rows.next() else { break };
                    let base = (il * n + ys + jl) * nh;
                    for (dst, v) in work[base..base + nh].iter_mut().zip(row) {
                        *dst = Complex::new(v[0], v[1]);
                    }
                }
            }
        }

        // 3) j columns
        fft_columns(&mut work, n, nh, inv);

        // 4) k rows, half spectrum -> real
        let stride = real.stride();
        real.data
            .par_chunks_mut(stride)
            .zip(work.par_chunks(nh))
            .for_each(|(dst, half)| {
                let mut row = vec![Complex::new(0.0, 0.0); n];
                row[..nh].copy_from_slice(half);
                for k in nh..n {
                    row[k] = half[n - k].conj();
                }
                inv.process(&mut row);
                for (d, c) in dst[..n].iter_mut().zip(&row) {
                    *d = c.re;
                }
                dst[n..].fill(0.0);
            });
    }
}

/// Transform along the middle axis of `data` viewed as [planes][n][nh].
fn fft_columns(data: &mut [Complex<f64>], n: usize, nh: usize, fft: &Arc<dyn Fft<f64>>) {
    data.par_chunks_mut(n * nh).for_each(|plane| {
        let mut col = vec![Complex::new(0.0, 0.0); n];
        let mut scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];
        for k in 0..nh {
            for a in 0..n {
                col[a] = plane[a * nh + k];
            }
            fft.process_with_scratch(&mut col, &mut scratch);
            for a in 0..n {
                plane[a * nh + k] = col[a];
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalComm, run_local};

    fn test_field(i: usize, j: usize, k: usize) -> f64 {
        let (x, y, z) = (i as f64, j as f64, k as f64);
        (0.7 * x).sin() + (1.3 * y - 0.2 * z).cos() + 0.01 * x * y * z
    }

    #[test]
    fn local_slab_partitions_rows() {
        for n in 1..20 {
            for size in 1..9 {
                let mut next = 0;
                for r in 0..size {
                    let (s, l) = local_slab(n, r, size);
                    if l > 0 {
                        assert_eq!(s, next, "n={} size={} r={}", n, size, r);
                    }
                    next = s + l;
                }
                assert_eq!(next, n, "n={} size={}", n, size);
            }
        }
        assert_eq!(local_slab(5, 3, 4), (5, 0));
    }

    #[test]
    fn roundtrip_scales_by_n_cubed() {
        let n = 6;
        let comm = LocalComm::single();
        let plan = SlabFft::new(n, 0, 1);
        let mut real = plan.alloc_real();
        real.fill_with(test_field);
        let orig = real.clone();
        let mut spec = plan.alloc_spectral();
        plan.forward(&comm, &real, &mut spec);
        plan.inverse(&comm, &spec, &mut real);

        let scale = (n * n * n) as f64;
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    let want = orig.get(i, j, k) * scale;
                    let got = real.get(i, j, k);
                    assert!((got - want).abs() < 1e-9 * scale, "({},{},{})", i, j, k);
                }
            }
        }
    }

    #[test]
    fn dc_mode_is_the_sum() {
        let n = 4;
        let comm = LocalComm::single();
        let plan = SlabFft::new(n, 0, 1);
        let mut real = plan.alloc_real();
        real.fill_with(test_field);
        let mut spec = plan.alloc_spectral();
        plan.forward(&comm, &real, &mut spec);
        let dc = spec.get(0, 0, 0);
        assert!((dc.re - real.sum()).abs() < 1e-10);
        assert!(dc.im.abs() < 1e-10);
    }

    #[test]
    fn distributed_transform_matches_single_rank() {
        let n = 7;
        let comm = LocalComm::single();
        let plan = SlabFft::new(n, 0, 1);
        let mut real = plan.alloc_real();
        real.fill_with(test_field);
        let mut reference = plan.alloc_spectral();
        plan.forward(&comm, &real, &mut reference);

        // 3 ranks over 7 rows: blocks of 3, 3, 1
        let parts = run_local(3, |comm| {
            let plan = SlabFft::new(n, comm.rank(), comm.size());
            let mut real = plan.alloc_real();
            real.fill_with(test_field);
            let mut spec = plan.alloc_spectral();
            plan.forward(&comm, &real, &mut spec);

            let mut back = plan.alloc_real();
            plan.inverse(&comm, &spec, &mut back);
            (spec, real, back)
        });

        let scale = (n * n * n) as f64;
        for (spec, real, back) in &parts {
            for j in spec.start()..spec.start() + spec.len() {
                for i in 0..n {
                    for k in 0..n / 2 + 1 {
                        let d = spec.get(i, j, k) - reference.get(i, j, k);
                        assert!(d.norm() < 1e-9, "mode ({},{},{})", i, j, k);
                    }
                }
            }
            for i in real.start()..real.start() + real.len() {
                for j in 0..n {
                    for k in 0..n {
                        let want = real.get(i, j, k) * scale;
                        assert!((back.get(i, j, k) - want).abs() < 1e-8 * scale);
                    }
                }
            }
        }
    }

    #[test]
    fn ranks_without_rows_still_take_part() {
        // 2 rows over 4 ranks: ranks 2 and 3 own nothing
        let n = 2;
        let sums = run_local(4, |comm| {
            let plan = SlabFft::new(n, comm.rank(), comm.size());
            let mut real = plan.alloc_real();
            real.fill_with(|i, j, k| (1 + i + 2 * j + 4 * k) as f64);
            let mut spec = plan.alloc_spectral();
            plan.forward(&comm, &real, &mut spec);
            plan.inverse(&comm, &spec, &mut real);
            (real.len(), real.sum())
        });
        assert_eq!(sums[2].0, 0);
        assert_eq!(sums[3].0, 0);
        let total: f64 = sums.iter().map(|s| s.1).sum();
        // sum of 1..=8 times n^3
        assert!((total - 36.0 * 8.0).abs() < 1e-9);
    }
}
