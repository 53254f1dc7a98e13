// src/poisson.rs
//
// Particle-mesh Poisson solve on the distributed periodic grid.
//
//   1. CIC-deposit particle counts into a rank-local sparse table
//   2. ship every deposit to the rank owning its row (Deposit exchange)
//   3. forward FFT
//   4. multiply each mode by potfact * G(k) / W(k)^2, zero the DC mode
//   5. inverse FFT: the dense slab now holds the potential
//
// G(k) = -dl^2/4 / sum_a sin^2(k_a dl / 2) is the Green's function of the
// 7-point Laplacian; W(k) = (prod_a sinc(pi k_a / (2 k_ny)))^2 is the CIC
// window, divided out twice because interpolation to the rays is CIC as well.
//
// Both FFTs are unnormalised. The resulting factor n^3 turns the particle
// counts per cell into density contrast in units of the mean, together with
// potfact = 4 pi G / a * m_p / L^3.

use std::f64::consts::PI;
use std::time::Instant;

use rustfft::num_complex::Complex;

use crate::comm::{self, Communicator};
use crate::config::RayTraceConfig;
use crate::constants::{FOUR_PI_G, RHO_CRIT};
use crate::decomp::SlabDecomposition;
use crate::error::{LensError, Result};
use crate::exchange::{ExchangeDirection, ExchangeStats, pairwise_exchange};
use crate::fft::SlabFft;
use crate::grid::{CIC_CORNERS, Grid3D, cic_weights};
use crate::gridcell_hash::{GridCell, GridCellHash};
use crate::partio::assign_files;
use crate::slab::{DenseSlab, SpectralSlab};
use crate::snapshot::{SnapshotHeader, SnapshotSource};

/// Converts particle counts per cell (after the unnormalised FFT pair) into
/// potential. Fatal if it comes out zero.
pub fn potential_factor(header: &SnapshotHeader, omega_m: f64) -> f64 {
    let l3 = header.box_len.powi(3);
    let mp = RHO_CRIT * omega_m * l3 / header.n_total as f64;
    let potfact = FOUR_PI_G / header.scale_factor * mp / l3;
    if potfact == 0.0 || !potfact.is_finite() {
        crate::fatal!(
            "potfact is {}: a = {}, mp = {}, L = {}, n_total = {}",
            potfact,
            header.scale_factor,
            mp,
            header.box_len,
            header.n_total
        );
    }
    potfact
}

/// Wavenumbers of FFT index 0..n in FFT order (non-negative, then negative).
pub fn kgrid(n: usize, dl: f64) -> Vec<f64> {
    (0..n)
        .map(|i| {
            let m = if i <= n / 2 { i as f64 } else { i as f64 - n as f64 };
            2.0 * PI * m / (n as f64 * dl)
        })
        .collect()
}

/// Discrete Green's function of the 7-point Laplacian; k must not be zero.
#[inline]
pub fn greens_function(k: [f64; 3], dl: f64) -> f64 {
    let s: f64 = k.iter().map(|&ka| (ka * dl / 2.0).sin().powi(2)).sum();
    -dl * dl / 4.0 / s
}

/// Squared CIC window (prod_a sinc(pi k_a / (2 k_ny)))^2, sinc(0) = 1.
#[inline]
pub fn cic_window(k: [f64; 3], kny: f64) -> f64 {
    let w: f64 = k
        .iter()
        .map(|&ka| {
            if ka == 0.0 {
                1.0
            } else {
                let x = PI * ka / 2.0 / kny;
                x.sin() / x
            }
        })
        .product();
    w * w
}

/// Multiply every local mode by potfact * G / W^2 and zero the DC mode.
pub fn apply_greens_function(spec: &mut SpectralSlab, grid: &Grid3D, potfact: f64) {
    let kg = kgrid(grid.n, grid.dl);
    let kny = PI / grid.dl;
    spec.for_each_mode_mut(|[i, j, k], c| {
        if i == 0 && j == 0 && k == 0 {
            *c = Complex::new(0.0, 0.0);
            return;
        }
        let kv = [kg[i], kg[j], kg[k]];
        let g = greens_function(kv, grid.dl);
        let w = cic_window(kv, kny);
        let fac = potfact * g / w / w;
        if fac == 0.0 || !fac.is_finite() {
            crate::fatal!(
                "Green's function factor at mode ({}, {}, {}) is {}: G = {}, W = {}, potfact = {}",
                i,
                j,
                k,
                fac,
                g,
                w,
                potfact
            );
        }
        *c *= fac;
    });
}

/// CIC weights of one particle (unit mass) accumulated into `hash`.
#[inline]
pub fn deposit_particle(hash: &mut GridCellHash, grid: &Grid3D, pos: [f64; 3]) {
    let mut base = [0isize; 3];
    let mut frac = [0.0; 3];
    for a in 0..3 {
        let (i, f) = grid.locate(grid.wrap_position(pos[a]));
        base[a] = i;
        frac[a] = f;
    }
    let w = cic_weights(frac);
    for (o, wm) in CIC_CORNERS.iter().zip(w) {
        hash.accumulate(grid.id_wrapped(base[0] + o[0], base[1] + o[1], base[2] + o[2]), wm);
    }
}

/// Deposit a batch of positions (snapshot units times `conv`).
pub fn deposit_particles(hash: &mut GridCellHash, grid: &Grid3D, positions: &[[f32; 3]], conv: f64) {
    for p in positions {
        deposit_particle(hash, grid, p.map(|x| x as f64 * conv));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SolveStats {
    pub particles_read: u64,
    pub deposited_cells: usize,
    pub exchange: ExchangeStats,
    pub potfact: f64,
}

pub struct PoissonSolver {
    grid: Grid3D,
    decomp: SlabDecomposition,
    fft: SlabFft,
    slab: DenseSlab,
    spectrum: SpectralSlab,
}

impl PoissonSolver {
    /// Collective: builds the slab table and FFT plan for `grid.n`.
    pub fn new<C>(comm: &C, grid: Grid3D) -> Self
    where
        C: Communicator + ?Sized,
    {
        let decomp = SlabDecomposition::rebuild(comm, grid.n);
        let fft = SlabFft::new(grid.n, comm.rank(), comm.size());
        assert_eq!(
            fft.local(),
            (decomp.local_start(), decomp.local_len()),
            "FFT plan and slab table disagree"
        );
        let slab = fft.alloc_real();
        let spectrum = fft.alloc_spectral();
        Self {
            grid,
            decomp,
            fft,
            slab,
            spectrum,
        }
    }

    pub fn grid(&self) -> &Grid3D {
        &self.grid
    }

    pub fn decomp(&self) -> &SlabDecomposition {
        &self.decomp
    }

    /// The dense slab: density during a solve, potential after it.
    pub fn potential(&self) -> &DenseSlab {
        &self.slab
    }

    pub fn slab_mut(&mut self) -> &mut DenseSlab {
        &mut self.slab
    }

    /// Collective: read `source`, deposit, share density and solve.
    pub fn solve<C>(
        &mut self,
        comm: &C,
        source: &dyn SnapshotSource,
        header: &SnapshotHeader,
        config: &RayTraceConfig,
    ) -> Result<SolveStats>
    where
        C: Communicator + ?Sized,
    {
        let rank = comm.rank();
        let rel = (header.box_len - self.grid.box_len).abs() / self.grid.box_len;
        if rel > 1e-12 {
            return Err(LensError::InvalidConfig(format!(
                "grid box {} does not match snapshot box {}",
                self.grid.box_len, header.box_len
            )));
        }
        let potfact = potential_factor(header, config.omega_m);

        // read + deposit
        let t0 = Instant::now();
        if rank == 0 {
            log::info!("[poisson] reading particles ({} files)", header.n_files);
        }
        let files = assign_files(
            header.n_files as usize,
            rank,
            comm.size(),
            config.num_files_io_in_parallel,
        );
        let mut hash = GridCellHash::new();
        let mut particles_read = 0u64;
        let grid = self.grid;
        let read = files.for_each_file(comm, |file| {
            let positions = source.read_positions(file)?;
            particles_read += positions.len() as u64;
            deposit_particles(&mut hash, &grid, &positions, config.length_conv_fact);
            log::debug!("{:04}: file {} -> {} particles", rank, file, positions.len());
            Ok(())
        });
        if comm::all_reduce_max(comm, read.is_err() as u64) != 0 {
            return Err(read.err().unwrap_or_else(|| {
                LensError::Snapshot("another rank failed to read its snapshot files".into())
            }));
        }
        hash.shrink_to_fit();
        let mut cells: Vec<GridCell> = hash.into_sorted_cells();
        if rank == 0 {
            log::info!("[poisson] read particles in {:.3} s", t0.elapsed().as_secs_f64());
        }

        // share density
        let t0 = Instant::now();
        let deposited_cells = cells.len();
        self.slab.zero();
        let slab = &mut self.slab;
        let exchange = pairwise_exchange(
            comm,
            &self.decomp,
            &mut cells,
            ExchangeDirection::Deposit,
            |c| slab.add_id(c.id, c.val),
        );
        drop(cells);
        if !self.slab.is_empty() && self.slab.is_all_zero() {
            crate::fatal!("{:04}: all density cells are zero after sharing", rank);
        }
        if rank == 0 {
            log::info!("[poisson] shared density in {:.3} s", t0.elapsed().as_secs_f64());
        }

        self.solve_density(comm, potfact);

        Ok(SolveStats {
            particles_read,
            deposited_cells,
            exchange,
            potfact,
        })
    }

    /// Collective: turn the density in the dense slab into potential.
    pub fn solve_density<C>(&mut self, comm: &C, potfact: f64)
    where
        C: Communicator + ?Sized,
    {
        let rank = comm.rank();

        let t0 = Instant::now();
        self.fft.forward(comm, &self.slab, &mut self.spectrum);
        let nonzero = comm::all_reduce_max(comm, (!self.spectrum.is_all_zero()) as u64);
        if nonzero == 0 {
            crate::fatal!("{:04}: transformed density is zero on every rank", rank);
        }
        if rank == 0 {
            log::info!("[poisson] forward FFT in {:.3} s", t0.elapsed().as_secs_f64());
        }

        let t0 = Instant::now();
        apply_greens_function(&mut self.spectrum, &self.grid, potfact);
        if rank == 0 {
            log::info!("[poisson] Green's function in {:.3} s", t0.elapsed().as_secs_f64());
        }

        let t0 = Instant::now();
        self.fft.inverse(comm, &self.spectrum, &mut self.slab);
        if rank == 0 {
            log::info!("[poisson] backward FFT in {:.3} s", t0.elapsed().as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalComm;

    #[test]
    fn single_particle_weights_sum_to_one() {
        let grid = Grid3D::new(8, 16.0);
        let mut h = GridCellHash::new();
        deposit_particle(&mut h, &grid, [3.0, 5.5, 15.9]);
        assert_eq!(h.len(), 8);
        let total: f64 = h.cells().iter().map(|c| c.val).sum();
        assert!((total - 1.0).abs() < 1e-14);
        // x = 3.0 is 1.5 cells: half to i = 1, half to i = 2; z wraps to k = 0
        let w = h.value(grid.id(1, 2, 7)).unwrap() + h.value(grid.id(2, 2, 7)).unwrap();
        let v = h.value(grid.id(1, 2, 0)).unwrap() + h.value(grid.id(2, 2, 0)).unwrap();
        assert!((w - 0.25 * 0.05).abs() < 1e-12, "w={}", w);
        assert!((v - 0.25 * 0.95).abs() < 1e-12, "v={}", v);
    }

    #[test]
    fn deposit_then_interpolate_returns_the_weights() {
        use crate::stencil::{Derivative, StencilPolicy, derivative_field, interpolate};

        let grid = Grid3D::new(8, 16.0);
        // last axis sits in the top cell, so its upper corners wrap to k = 0
        let pos = [3.7, 9.1, 15.4];
        let mut h = GridCellHash::new();
        deposit_particle(&mut h, &grid, pos);
        h.sort_by_id();

        let frac = pos.map(|x| grid.locate(x).1);
        let w = cic_weights(frac);
        let base = pos.map(|x| grid.locate(x).0);
        for (o, wm) in CIC_CORNERS.iter().zip(w) {
            let id = grid.id_wrapped(base[0] + o[0], base[1] + o[1], base[2] + o[2]);
            assert!((h.value(id).unwrap() - wm).abs() < 1e-14, "corner {:?}", o);
        }

        // reading the deposit back at the same point weights each corner twice
        let field = derivative_field(&h, &grid, StencilPolicy::Staggered, Derivative::Potential);
        let v = interpolate(&h, &field, &grid, pos, [false; 3]);
        let want: f64 = w.iter().map(|x| x * x).sum();
        assert!((v - want).abs() < 1e-14, "got {} want {}", v, want);
    }

    #[test]
    fn kgrid_is_in_fft_order() {
        let k = kgrid(4, 0.5);
        let base = 2.0 * PI / 2.0;
        assert_eq!(k, vec![0.0, base, 2.0 * base, -base]);
    }

    #[test]
    fn window_and_greens_limits() {
        let dl = 1.0;
        let kny = PI / dl;
        assert_eq!(cic_window([0.0; 3], kny), 1.0);
        // at the Nyquist frequency sinc(pi/2) = 2/pi
        let w = cic_window([kny, 0.0, 0.0], kny);
        assert!((w - (2.0 / PI).powi(2)).abs() < 1e-14);
        // small k: G -> -1/k^2
        let k = 1e-3;
        let g = greens_function([k, 0.0, 0.0], dl);
        assert!((g * k * k + 1.0).abs() < 1e-6);
    }

    #[test]
    fn dc_mode_is_zeroed() {
        let grid = Grid3D::new(4, 4.0);
        let mut spec = SpectralSlab::new(4, 0, 4);
        spec.for_each_mode_mut(|_, c| *c = Complex::new(3.0, -1.0));
        apply_greens_function(&mut spec, &grid, 2.5);
        assert_eq!(spec.get(0, 0, 0), Complex::new(0.0, 0.0));
        assert!(spec.get(1, 0, 0).re < 0.0);
    }

    #[test]
    fn uniform_density_gives_zero_potential() {
        let comm = LocalComm::single();
        let mut solver = PoissonSolver::new(&comm, Grid3D::new(4, 100.0));
        solver.slab_mut().fill_with(|_, _, _| 2.0);
        solver.solve_density(&comm, 1.0);
        let p = solver.potential();
        for i in 0..4 {
            for j in 0..4 {
                for k in 0..4 {
                    assert_eq!(p.get(i, j, k), 0.0, "({},{},{})", i, j, k);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "potfact")]
    fn zero_potfact_is_fatal() {
        let h = SnapshotHeader {
            n_total: 10,
            n_files: 1,
            box_len: 100.0,
            scale_factor: f64::INFINITY,
        };
        potential_factor(&h, 0.3);
    }
}
