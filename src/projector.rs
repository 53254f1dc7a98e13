// src/projector.rs
//
// Sample the potential slab along every ray of the current lens plane.
//
// Bundle cells are handled one at a time: gather the footprint of all of the
// cell's line-of-sight samples, fetch those vertices from their owners, then
// interpolate the potential, its gradient and its Hessian at each sample and
// project them onto the sky-tangent basis of the ray.
//
// Every rank runs the same number of gather rounds (the global maximum of
// active bundle cells); ranks that have run out of cells take part with an
// empty request.

use std::time::Instant;

use crate::comm::{self, Communicator};
use crate::constants::CSOL;
use crate::decomp::SlabDecomposition;
use crate::exchange::{ExchangeDirection, pairwise_exchange};
use crate::grid::Grid3D;
use crate::gridcell_hash::GridCellHash;
use crate::rays::{BundleCell, Ray};
use crate::slab::DenseSlab;
use crate::stencil::{
    Derivative, GRADIENT, HESSIAN, StencilPolicy, derivative_field, insert_footprint, interpolate,
};
use crate::vec3::{norm, tangent_jacobian};

/// Radial sampling of one lens plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineOfSight {
    pub plane_radius: f64,
    pub chi_min: f64,
    pub dchi: f64,
    pub n_int: usize,
}

impl LineOfSight {
    /// Two samples per grid cell across a plane of the given thickness, at least one.
    pub fn new(plane_radius: f64, thickness: f64, dl: f64) -> Self {
        let n_int = ((thickness / dl * 2.0) as usize).max(1);
        Self {
            plane_radius,
            chi_min: plane_radius - thickness / 2.0,
            dchi: thickness / n_int as f64,
            n_int,
        }
    }

    /// Comoving radius of sample `n`, at the middle of its sub-interval.
    #[inline]
    pub fn radius(&self, n: usize) -> f64 {
        self.chi_min + (n as f64 + 0.5) * self.dchi
    }

    /// Sample positions along direction `dir` (not wrapped into the box).
    pub fn samples(&self, dir: [f64; 3]) -> impl Iterator<Item = [f64; 3]> + '_ {
        let r = norm(dir);
        (0..self.n_int).map(move |n| {
            let s = self.radius(n) / r;
            [dir[0] * s, dir[1] * s, dir[2] * s]
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionStats {
    pub bundle_cells: usize,
    pub rounds: usize,
    pub gathered_cells: usize,
    pub samples: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct Accum {
    phi: f64,
    alpha: [f64; 2],
    u: [f64; 4],
}

/// Collective: add this plane's phi, alpha and U to every ray of every
/// primary bundle cell in `cells`.
pub fn project_bundle_cells<C>(
    comm: &C,
    grid: &Grid3D,
    decomp: &SlabDecomposition,
    potential: &DenseSlab,
    policy: StencilPolicy,
    los: &LineOfSight,
    cells: &mut [BundleCell],
) -> ProjectionStats
where
    C: Communicator + ?Sized,
{
    let rank = comm.rank();
    let t0 = Instant::now();
    if rank == 0 {
        log::info!(
            "[rays] interpolating to rays: {} samples per ray, dchi = {:.3}",
            los.n_int,
            los.dchi
        );
    }

    let active: Vec<usize> = cells
        .iter()
        .enumerate()
        .filter(|(_, c)| c.is_primary())
        .map(|(b, _)| b)
        .collect();
    let rounds = comm::all_reduce_max(comm, active.len() as u64) as usize;

    if !potential.is_empty() && potential.is_all_zero() {
        crate::fatal!("{:04}: all potential cells are zero in the dense slab", rank);
    }

    let mut stats = ProjectionStats {
        bundle_cells: active.len(),
        rounds,
        ..ProjectionStats::default()
    };

    for round in 0..rounds {
        let bind = active.get(round).copied();

        let mut hash = GridCellHash::new();
        if let Some(b) = bind {
            for ray in &cells[b].rays {
                for pos in los.samples(ray.n) {
                    insert_footprint(&mut hash, grid, pos);
                }
            }
            if !cells[b].rays.is_empty() && hash.is_empty() {
                crate::fatal!("{:04}: bundle cell {} needs no grid cells", rank, b);
            }
        }
        hash.sort_by_id();

        pairwise_exchange(
            comm,
            decomp,
            hash.cells_mut(),
            ExchangeDirection::Fetch,
            |c| c.val = potential.get_id(c.id),
        );
        if !hash.is_empty() && hash.cells().iter().all(|c| c.val == 0.0) {
            crate::fatal!("{:04}: all gathered potential cells are zero", rank);
        }
        stats.gathered_cells += hash.len();

        if let Some(b) = bind {
            let rays = &mut cells[b].rays;
            stats.samples += rays.len() * los.n_int;
            project_rays(rank, &hash, grid, policy, los, rays);
        }
    }

    if rank == 0 {
        log::info!(
            "[rays] interpolation and projection in {:.3} s",
            t0.elapsed().as_secs_f64()
        );
    }
    stats
}

#[inline]
fn check_finite(rank: usize, what: &str, v: &[f64]) {
    if !v.iter().all(|x| x.is_finite()) {
        crate::fatal!("{:04}: non-finite {} accumulated: {:?}", rank, what, v);
    }
}

/// Interpolate all derivatives for one gathered bundle cell and add the
/// unit-converted results to its rays.
fn project_rays(
    rank: usize,
    hash: &GridCellHash,
    grid: &Grid3D,
    policy: StencilPolicy,
    los: &LineOfSight,
    rays: &mut [Ray],
) {
    let jacs: Vec<[[f64; 2]; 3]> = rays.iter().map(|r| tangent_jacobian(r.n)).collect();
    let mut acc = vec![Accum::default(); rays.len()];

    // potential
    let field = derivative_field(hash, grid, policy, Derivative::Potential);
    for (ray, a) in rays.iter().zip(acc.iter_mut()) {
        for pos in los.samples(ray.n) {
            a.phi += interpolate(hash, &field, grid, pos, [false; 3]);
            check_finite(rank, "phi", &[a.phi]);
        }
    }

    // gradient -> deflection
    for d in GRADIENT {
        let Derivative::First(axis) = d else { continue };
        let field = derivative_field(hash, grid, policy, d);
        let shifted = d.shifted_axes(policy);
        for ((ray, jac), a) in rays.iter().zip(&jacs).zip(acc.iter_mut()) {
            for pos in los.samples(ray.n) {
                let val = interpolate(hash, &field, grid, pos, shifted);
                for ii in 0..2 {
                    a.alpha[ii] += val * jac[axis][ii];
                }
                check_finite(rank, "alpha", &a.alpha);
            }
        }
    }

    // Hessian -> tidal tensor
    for d in HESSIAN {
        let Derivative::Second(d1, d2) = d else { continue };
        let field = derivative_field(hash, grid, policy, d);
        let shifted = d.shifted_axes(policy);
        for ((ray, jac), a) in rays.iter().zip(&jacs).zip(acc.iter_mut()) {
            for pos in los.samples(ray.n) {
                let val = interpolate(hash, &field, grid, pos, shifted);
                for ii in 0..2 {
                    for jj in 0..2 {
                        a.u[ii * 2 + jj] += val * jac[d1][ii] * jac[d2][jj];
                        if d1 != d2 {
                            a.u[ii * 2 + jj] += val * jac[d2][ii] * jac[d1][jj];
                        }
                    }
                }
                check_finite(rank, "U", &a.u);
            }
        }
    }

    // 2/c^2 dchi chi for second derivatives, 2/c^2 dchi for first,
    // 2/c^2 dchi / chi for the potential
    let fac1 = 2.0 / CSOL / CSOL * los.dchi;
    let fac2 = fac1 * los.plane_radius;
    for (ray, a) in rays.iter_mut().zip(&acc) {
        let mut u = a.u.map(|v| v * fac2);
        let sym = 0.5 * (u[1] + u[2]);
        u[1] = sym;
        u[2] = sym;
        for m in 0..4 {
            ray.u[m] += u[m];
        }
        for ii in 0..2 {
            ray.alpha[ii] -= fac1 * a.alpha[ii];
        }
        ray.phi += a.phi * fac1 / los.plane_radius;
        if !ray.is_finite() {
            crate::fatal!("{:04}: non-finite ray after projection: {:?}", rank, ray);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_of_sight_covers_the_plane() {
        let los = LineOfSight::new(1000.0, 100.0, 10.0);
        assert_eq!(los.n_int, 20);
        assert!((los.dchi - 5.0).abs() < 1e-12);
        assert!((los.radius(0) - 952.5).abs() < 1e-12);
        assert!((los.radius(19) - 1047.5).abs() < 1e-12);

        let pts: Vec<_> = los.samples([0.0, 0.0, 3.0]).collect();
        assert_eq!(pts.len(), 20);
        assert!((pts[0][2] - 952.5).abs() < 1e-12);
        assert_eq!(pts[0][0], 0.0);
    }

    #[test]
    fn thin_planes_still_get_one_sample() {
        let los = LineOfSight::new(500.0, 1.0, 10.0);
        assert_eq!(los.n_int, 1);
        assert_eq!(los.radius(0), 500.0);
    }
}
