// src/driver.rs
//
// Owns the per-run state that the solver and projector share: the snapshot
// distances, the snapshot whose potential is currently loaded, and the
// NFFT-keyed solver (slab table, FFT plan, buffers).
//
// For each lens plane the driver picks the snapshot closest in comoving
// distance, recomputes the potential only when that choice changes, and then
// projects the plane onto the caller's bundle cells.

use crate::comm::{self, Communicator};
use crate::config::RayTraceConfig;
use crate::cosmology::comoving_distance;
use crate::error::{LensError, Result};
use crate::grid::Grid3D;
use crate::poisson::{PoissonSolver, SolveStats};
use crate::projector::{LineOfSight, ProjectionStats, project_bundle_cells};
use crate::rays::BundleCell;
use crate::snapshot::{SnapshotCatalog, SnapshotHeader, broadcast_header};

/// Extra prime factors tried when snapping the grid size. Only powers of two
/// are active; the FFT backend has had trouble with the larger list
/// [1, 3, 5, 7, 9, 11, 13].
pub const NFFT_PRIME_FACTORS: [usize; 1] = [1];

/// Grid size for a plane at `plane_radius`: enough cells to resolve half the
/// smoothing length there, snapped to the nearest 2^m * pfac and capped at
/// `max_nfft`. `hint`, when given, replaces the resolution-derived target.
pub fn choose_nfft(
    box_len: f64,
    plane_radius: f64,
    min_smoothing_length: f64,
    max_nfft: usize,
    hint: Option<usize>,
) -> usize {
    let raw = match hint {
        Some(h) => h as f64,
        None => box_len / (plane_radius * min_smoothing_length / 2.0),
    };
    if !raw.is_finite() {
        return max_nfft.max(1);
    }
    if raw < 1.0 {
        return 1;
    }
    // the nearest candidate is always above raw / 2, so this snaps past the cap
    let cap = max_nfft.max(1);
    if raw >= 2.0 * cap as f64 {
        return cap;
    }

    let target = raw as i128;
    let lgb2 = raw.log2().floor() as i32;
    let mut best = 1usize;
    let mut best_diff = i128::MAX;
    for d in -4..=1 {
        let e = lgb2 + d;
        if e < 0 {
            continue;
        }
        for &pfac in NFFT_PRIME_FACTORS.iter() {
            let Some(cand) = 1usize
                .checked_shl(e as u32)
                .and_then(|c| c.checked_mul(pfac))
            else {
                continue;
            };
            let diff = (cand as i128 - target).abs();
            if diff < best_diff {
                best_diff = diff;
                best = cand;
            }
        }
    }
    best.clamp(1, cap)
}

/// Radius of the middle of lens plane `p`.
pub fn lens_plane_radius(config: &RayTraceConfig, p: usize) -> f64 {
    (p as f64 + 0.5) * config.plane_thickness()
}

/// Index of the distance closest to `chi`; ties go to the earlier entry.
pub fn closest_snapshot(distances: &[f64], chi: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &d) in distances.iter().enumerate() {
        let diff = (d - chi).abs();
        if best.map_or(true, |(_, b)| diff < b) {
            best = Some((i, diff));
        }
    }
    best.map(|(i, _)| i)
}

/// Collective: rank 0 opens every catalog entry and computes its comoving
/// distance; the list is broadcast to everybody.
pub fn catalog_distances<C>(
    comm: &C,
    catalog: &dyn SnapshotCatalog,
    omega_m: f64,
) -> Result<Vec<f64>>
where
    C: Communicator + ?Sized,
{
    if catalog.is_empty() {
        return Err(LensError::EmptyCatalog);
    }
    let mine = if comm.rank() == 0 {
        let computed: Result<Vec<f64>> = (0..catalog.len())
            .map(|i| {
                let h = catalog.open(i)?.header()?;
                if !(h.scale_factor > 0.0 && h.scale_factor <= 1.0) {
                    return Err(LensError::Snapshot(format!(
                        "snapshot {} has scale factor {}",
                        catalog.name(i),
                        h.scale_factor
                    )));
                }
                Ok(comoving_distance(h.scale_factor, omega_m))
            })
            .collect();
        match computed {
            Ok(d) => d,
            Err(e) => {
                let _ = comm::broadcast::<C, f64>(comm, 0, &[]);
                return Err(e);
            }
        }
    } else {
        Vec::new()
    };
    let distances = comm::broadcast(comm, 0, &mine);
    if distances.len() != catalog.len() {
        return Err(LensError::Snapshot(
            "rank 0 could not compute the snapshot distances".to_string(),
        ));
    }
    if comm.rank() == 0 {
        for (i, d) in distances.iter().enumerate() {
            log::debug!("[driver] snapshot {} at chi = {:.2}", catalog.name(i), d);
        }
    }
    Ok(distances)
}

#[derive(Debug, Clone, Copy)]
pub struct PlaneInfo {
    pub snapshot: usize,
    pub nfft: usize,
    /// False when the previous plane's potential was reused.
    pub recomputed: bool,
    pub solve: Option<SolveStats>,
}

pub struct PotentialDriver {
    distances: Vec<f64>,
    current: Option<usize>,
    header: Option<SnapshotHeader>,
    solver: Option<PoissonSolver>,
}

impl PotentialDriver {
    /// Collective.
    pub fn new<C>(comm: &C, catalog: &dyn SnapshotCatalog, config: &RayTraceConfig) -> Result<Self>
    where
        C: Communicator + ?Sized,
    {
        let distances = catalog_distances(comm, catalog, config.omega_m)?;
        Ok(Self {
            distances,
            current: None,
            header: None,
            solver: None,
        })
    }

    pub fn distances(&self) -> &[f64] {
        &self.distances
    }

    pub fn current_snapshot(&self) -> Option<usize> {
        self.current
    }

    pub fn header(&self) -> Option<&SnapshotHeader> {
        self.header.as_ref()
    }

    pub fn solver(&self) -> Option<&PoissonSolver> {
        self.solver.as_ref()
    }

    /// Collective: make sure the potential for a plane at `plane_radius` is
    /// loaded, solving from the closest snapshot if it is not.
    pub fn prepare_plane<C>(
        &mut self,
        comm: &C,
        catalog: &dyn SnapshotCatalog,
        plane_radius: f64,
        config: &RayTraceConfig,
    ) -> Result<PlaneInfo>
    where
        C: Communicator + ?Sized,
    {
        let rank = comm.rank();
        let snap = closest_snapshot(&self.distances, plane_radius).ok_or(LensError::EmptyCatalog)?;

        if self.current == Some(snap) {
            if let Some(solver) = &self.solver {
                return Ok(PlaneInfo {
                    snapshot: snap,
                    nfft: solver.grid().n,
                    recomputed: false,
                    solve: None,
                });
            }
        }

        // every rank opens the snapshot; agree on success before going collective
        let opened = catalog.open(snap);
        if comm::all_reduce_max(comm, opened.is_err() as u64) != 0 {
            self.invalidate();
            return Err(opened.err().unwrap_or_else(|| {
                LensError::Snapshot(format!("another rank could not open {}", catalog.name(snap)))
            }));
        }
        let source = opened?;

        let header = match broadcast_header(comm, &*source, config.length_conv_fact) {
            Ok(h) => h,
            Err(e) => {
                self.invalidate();
                return Err(e);
            }
        };
        let nfft = choose_nfft(
            header.box_len,
            plane_radius,
            config.min_smoothing_length,
            config.max_nfft,
            config.nfft_hint,
        );
        if rank == 0 {
            log::info!(
                "[driver] plane chi = {:.2}: snapshot {} (chi = {:.2}, a = {:.4}), NFFT = {}",
                plane_radius,
                catalog.name(snap),
                self.distances[snap],
                header.scale_factor,
                nfft
            );
        }

        let grid = Grid3D::new(nfft, header.box_len);
        if self.solver.as_ref().map_or(false, |s| *s.grid() != grid) {
            self.solver = None;
        }
        let solver = self.solver.get_or_insert_with(|| {
            if rank == 0 {
                log::info!("[driver] building slab table and FFT plan for NFFT = {}", nfft);
            }
            PoissonSolver::new(comm, grid)
        });

        self.current = None;
        let stats = solver.solve(comm, &*source, &header, config)?;
        self.current = Some(snap);
        self.header = Some(header);

        Ok(PlaneInfo {
            snapshot: snap,
            nfft,
            recomputed: true,
            solve: Some(stats),
        })
    }

    /// Collective: add the loaded potential's contribution for a plane at
    /// `plane_radius` to `cells`.
    pub fn project<C>(
        &self,
        comm: &C,
        plane_radius: f64,
        config: &RayTraceConfig,
        cells: &mut [BundleCell],
    ) -> Result<ProjectionStats>
    where
        C: Communicator + ?Sized,
    {
        let solver = match (&self.solver, self.current) {
            (Some(s), Some(_)) => s,
            _ => return Err(LensError::NoPotential),
        };
        let grid = solver.grid();
        let los = LineOfSight::new(plane_radius, config.plane_thickness(), grid.dl);
        Ok(project_bundle_cells(
            comm,
            grid,
            solver.decomp(),
            solver.potential(),
            config.stencil,
            &los,
            cells,
        ))
    }

    fn invalidate(&mut self) {
        self.current = None;
        self.header = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{LocalComm, run_local};
    use crate::snapshot::{InMemoryCatalog, InMemorySnapshot};

    #[test]
    fn nfft_snaps_to_powers_of_two() {
        // raw = 1000 / (500 * 0.01 / 2) = 400 -> 512 is 112 away, 256 is 144 away
        assert_eq!(choose_nfft(1000.0, 500.0, 0.01, 4096, None), 512);
        // raw = 300 -> 256
        assert_eq!(choose_nfft(300.0, 100.0, 0.02, 4096, None), 256);
        assert_eq!(choose_nfft(1000.0, 500.0, 0.01, 128, None), 128);
        assert_eq!(choose_nfft(1000.0, 500.0, 0.01, 4096, Some(100)), 128);
        assert_eq!(choose_nfft(1000.0, 500.0, 0.01, 64, Some(100)), 64);
    }

    #[test]
    fn nfft_degenerate_inputs() {
        // plane at the observer: unbounded resolution, capped
        assert_eq!(choose_nfft(100.0, 0.0, 0.01, 32, None), 32);
        // snapped before capping: 180 -> 128, under the cap
        assert_eq!(choose_nfft(1.0, 1.0, 1.0, 170, Some(180)), 128);
        assert_eq!(choose_nfft(1.0, 1e6, 0.1, 32, None), 1);
    }

    #[test]
    fn nfft_huge_targets_stay_capped() {
        // raw ~ 2e24 and a hint near usize::MAX: no candidate may overflow
        assert_eq!(choose_nfft(1000.0, 1.0, 1e-19, 512, None), 512);
        assert_eq!(choose_nfft(1.0, 1.0, 1.0, 4096, Some(usize::MAX)), 4096);
        // uncapped run at the top of the usize range still snaps to a power of two
        let n = choose_nfft(1.0, 1.0, 1.0, usize::MAX, Some(usize::MAX / 3));
        assert!(n.is_power_of_two());
        // raw just under twice the cap snaps to the next power of two, then caps
        assert_eq!(choose_nfft(1.0, 1.0, 1.0, 100, Some(199)), 100);
    }

    #[test]
    fn closest_snapshot_prefers_first_on_ties() {
        let d = [100.0, 300.0, 500.0];
        assert_eq!(closest_snapshot(&d, 0.0), Some(0));
        assert_eq!(closest_snapshot(&d, 200.0), Some(0));
        assert_eq!(closest_snapshot(&d, 390.0), Some(1));
        assert_eq!(closest_snapshot(&d, 9e9), Some(2));
        assert_eq!(closest_snapshot(&[], 1.0), None);
    }

    fn catalog() -> InMemoryCatalog {
        let mut cat = InMemoryCatalog::new();
        for (i, a) in [0.5, 0.8, 1.0].into_iter().enumerate() {
            cat.push(
                format!("snap_{}", i),
                InMemorySnapshot::uniform_random(500, 2, 200.0, a, i as u64),
            );
        }
        cat
    }

    #[test]
    fn distances_are_shared_and_ordered() {
        let cat = catalog();
        let out = run_local(3, |comm| catalog_distances(&comm, &cat, 0.3).unwrap());
        for d in &out {
            assert_eq!(d, &out[0]);
        }
        let d = &out[0];
        assert!(d[0] > d[1] && d[1] > d[2]);
        assert_eq!(d[2], 0.0);
    }

    #[test]
    fn potential_is_reused_until_the_snapshot_changes() {
        let cat = catalog();
        let comm = LocalComm::single();
        let config = RayTraceConfig {
            nfft_hint: Some(8),
            max_nfft: 8,
            ..RayTraceConfig::default()
        };
        let mut drv = PotentialDriver::new(&comm, &cat, &config).unwrap();
        let far = drv.distances()[0];

        let mut cells = vec![BundleCell::default()];
        assert!(matches!(
            drv.project(&comm, far, &config, &mut cells),
            Err(LensError::NoPotential)
        ));

        let first = drv.prepare_plane(&comm, &cat, far, &config).unwrap();
        assert!(first.recomputed);
        assert_eq!(first.snapshot, 0);
        assert_eq!(first.nfft, 8);
        assert_eq!(first.solve.unwrap().particles_read, 500);

        let again = drv.prepare_plane(&comm, &cat, far + 1.0, &config).unwrap();
        assert!(!again.recomputed);

        let near = drv.prepare_plane(&comm, &cat, 0.0, &config).unwrap();
        assert!(near.recomputed);
        assert_eq!(near.snapshot, 2);
        assert_eq!(drv.current_snapshot(), Some(2));
    }
}
