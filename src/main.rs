// src/main.rs
//
// Demo driver: builds a small light cone of synthetic snapshots (or reads the
// snapshot list named in the config), lays a ring of bundle cells on the sky,
// and runs potential solve + ray projection for every lens plane on an
// in-process cluster of `ranks=` threads. Built with `--features mpi`, every
// MPI process is one rank instead and `ranks=` is ignored.
//
// Examples:
//
//   cargo run --release -- ranks=4 particles=50000 nfft=64 rays=16
//   cargo run --release -- config=run.json stencil=centered out=runs/cmp
//   cargo build --release --features mpi && mpirun -n 8 target/release/lenspot nfft=128
//
// RUST_LOG=info (or debug) shows per-phase timings.
//
// Outputs (per run directory):
//   <out>/
//     ├── config.json
//     └── rays.csv

use std::env;
use std::f64::consts::PI;
use std::fs::{File, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[cfg(not(feature = "mpi"))]
use lenspot::comm::run_local;
use lenspot::comm::Communicator;
#[cfg(feature = "mpi")]
use lenspot::comm::mpi::MpiComm;
use lenspot::config::RayTraceConfig;
use lenspot::driver::{PotentialDriver, lens_plane_radius};
use lenspot::error::{LensError, Result};
use lenspot::rays::{BundleCell, Ray, gather_cells};
use lenspot::snapshot::{InMemoryCatalog, InMemorySnapshot, ListCatalog, SnapshotCatalog};
use lenspot::stencil::StencilPolicy;

const DEMO_BOX: f64 = 500.0;
const DEMO_SCALE_FACTORS: [f64; 4] = [0.4, 0.55, 0.75, 1.0];
const DEMO_BUNDLE_CELLS: usize = 12;
// angular radius of one bundle cell's patch (radians)
const PATCH_RADIUS: f64 = 0.02;

fn print_usage() {
    eprintln!(
        r#"Usage: lenspot [key=value ...]

  ranks=N        in-process ranks (default 2; ignored under MPI)
  particles=N    particles per synthetic snapshot (default 20000)
  nfft=N         grid size hint and cap (default: from config / smoothing length)
  rays=N         rays per bundle cell (default 8)
  stencil=S      staggered | centered
  config=PATH    JSON config (LENSPOT_* env vars override it)
  out=DIR        output directory (default runs/lenspot)
"#
    );
}

/// Bundle cells on a ring at colatitude pi/3, each a small patch of rays.
/// Cell b is primary on rank b % size only.
fn build_bundle_cells(rank: usize, size: usize, rays_per_cell: usize) -> Vec<BundleCell> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    (0..DEMO_BUNDLE_CELLS)
        .map(|b| {
            let theta0 = PI / 3.0;
            let phi0 = 2.0 * PI * b as f64 / DEMO_BUNDLE_CELLS as f64;
            let rays = (0..rays_per_cell)
                .map(|_| {
                    let t = theta0 + PATCH_RADIUS * (2.0 * rng.random::<f64>() - 1.0);
                    let p = phi0 + PATCH_RADIUS * (2.0 * rng.random::<f64>() - 1.0);
                    Ray::new([t.sin() * p.cos(), t.sin() * p.sin(), t.cos()])
                })
                .collect();
            let mut cell = BundleCell::primary(rays);
            if b % size != rank {
                cell.flags = 0;
            }
            cell
        })
        .collect()
}

fn demo_catalog(particles: usize) -> InMemoryCatalog {
    let mut cat = InMemoryCatalog::new();
    for (i, &a) in DEMO_SCALE_FACTORS.iter().enumerate() {
        cat.push(
            format!("synthetic_a{:.2}", a),
            InMemorySnapshot::uniform_random(particles, 4, DEMO_BOX, a, 1000 + i as u64),
        );
    }
    cat
}

/// One rank's share of the run: every plane, then all primary cells
/// gathered on rank 0 (other ranks return an empty list).
fn run_rank<C: Communicator>(
    comm: &C,
    catalog: &dyn SnapshotCatalog,
    config: &RayTraceConfig,
    rays_per_cell: usize,
) -> Result<Vec<(usize, BundleCell)>> {
    let rank = comm.rank();
    if rank == 0 {
        log::info!(
            "[lenspot] {} ranks, {} snapshots, {} lens planes, stencil = {}",
            comm.size(),
            catalog.len(),
            config.num_lens_planes,
            config.stencil.name()
        );
    }
    let mut cells = build_bundle_cells(rank, comm.size(), rays_per_cell);
    let mut driver = PotentialDriver::new(comm, catalog, config)?;

    let mut solves = 0;
    for p in 0..config.num_lens_planes {
        let chi = lens_plane_radius(config, p);
        let info = driver.prepare_plane(comm, catalog, chi, config)?;
        if info.recomputed {
            solves += 1;
        }
        let stats = driver.project(comm, chi, config, &mut cells)?;
        log::debug!(
            "{:04}: plane {} chi = {:.1}: {} rounds, {} cells gathered",
            rank,
            p,
            chi,
            stats.rounds,
            stats.gathered_cells
        );
    }
    if rank == 0 {
        log::info!(
            "[lenspot] {} planes done, {} potential solves",
            config.num_lens_planes,
            solves
        );
    }

    let mine: Vec<(usize, BundleCell)> = cells
        .into_iter()
        .enumerate()
        .filter(|(_, c)| c.is_primary())
        .collect();
    Ok(gather_cells(comm, 0, &mine))
}

/// Threads as ranks. Returns rank 0's gathered cells.
#[cfg(not(feature = "mpi"))]
fn run_ranks(
    ranks: Option<usize>,
    catalog: &(dyn SnapshotCatalog + Sync),
    config: &RayTraceConfig,
    rays_per_cell: usize,
) -> Result<Option<Vec<(usize, BundleCell)>>> {
    let per_rank = run_local(ranks.unwrap_or(2), |comm| {
        run_rank(&comm, catalog, config, rays_per_cell)
    });
    let mut root = None;
    for (rank, r) in per_rank.into_iter().enumerate() {
        let cells = r?;
        if rank == 0 {
            root = Some(cells);
        }
    }
    Ok(root)
}

/// One MPI process per rank. Only rank 0 gets cells back.
#[cfg(feature = "mpi")]
fn run_ranks(
    ranks: Option<usize>,
    catalog: &(dyn SnapshotCatalog + Sync),
    config: &RayTraceConfig,
    rays_per_cell: usize,
) -> Result<Option<Vec<(usize, BundleCell)>>> {
    let universe = mpi::initialize()
        .ok_or_else(|| LensError::InvalidConfig("MPI was already initialised".to_string()))?;
    let comm = MpiComm::new(universe.world());
    if let Some(n) = ranks {
        if comm.rank() == 0 && n != comm.size() {
            log::warn!("ranks={} ignored: running on {} MPI processes", n, comm.size());
        }
    }
    let cells = run_rank(&comm, catalog, config, rays_per_cell)?;
    Ok((comm.rank() == 0).then_some(cells))
}

fn write_rays_csv(path: &PathBuf, cells: &[(usize, BundleCell)]) -> Result<()> {
    let file = File::create(path).map_err(|e| LensError::io(path, e))?;
    let mut w = BufWriter::new(file);
    let mut put = |line: String| writeln!(w, "{}", line).map_err(|e| LensError::io(path, e));
    put("bundle_cell,ray,nx,ny,nz,phi,alpha0,alpha1,u00,u01,u10,u11".to_string())?;
    for (b, cell) in cells {
        for (r, ray) in cell.rays.iter().enumerate() {
            put(format!(
                "{},{},{:.8},{:.8},{:.8},{:.10e},{:.10e},{:.10e},{:.10e},{:.10e},{:.10e},{:.10e}",
                b,
                r,
                ray.n[0],
                ray.n[1],
                ray.n[2],
                ray.phi,
                ray.alpha[0],
                ray.alpha[1],
                ray.u[0],
                ray.u[1],
                ray.u[2],
                ray.u[3]
            ))?;
        }
    }
    w.flush().map_err(|e| LensError::io(path, e))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut ranks: Option<usize> = None;
    let mut particles: usize = 20_000;
    let mut nfft: Option<usize> = None;
    let mut rays_per_cell: usize = 8;
    let mut stencil: Option<StencilPolicy> = None;
    let mut config_path: Option<PathBuf> = None;
    let mut out_dir = PathBuf::from("runs/lenspot");

    for arg in env::args().skip(1) {
        if arg == "-h" || arg == "--help" || arg == "help" {
            print_usage();
            return Ok(());
        }
        let parsed = if let Some(v) = arg.strip_prefix("ranks=") {
            v.parse().map(|n: usize| ranks = Some(n.max(1))).is_ok()
        } else if let Some(v) = arg.strip_prefix("particles=") {
            v.parse().map(|n| particles = n).is_ok()
        } else if let Some(v) = arg.strip_prefix("nfft=") {
            v.parse().map(|n: usize| nfft = Some(n.max(1))).is_ok()
        } else if let Some(v) = arg.strip_prefix("rays=") {
            v.parse().map(|n| rays_per_cell = n).is_ok()
        } else if let Some(v) = arg.strip_prefix("stencil=") {
            StencilPolicy::parse(v).map(|p| stencil = Some(p)).is_some()
        } else if let Some(v) = arg.strip_prefix("config=") {
            config_path = Some(PathBuf::from(v));
            true
        } else if let Some(v) = arg.strip_prefix("out=") {
            out_dir = PathBuf::from(v);
            true
        } else {
            false
        };
        if !parsed {
            log::warn!("ignoring argument '{}'", arg);
        }
    }

    let mut config = match &config_path {
        Some(p) => RayTraceConfig::from_json_file(p)?,
        None => RayTraceConfig {
            max_nfft: 32,
            num_lens_planes: 20,
            max_comoving_distance: 2000.0,
            ..RayTraceConfig::default()
        },
    };
    config.apply_env_overrides();
    if let Some(n) = nfft {
        config.nfft_hint = Some(n);
        config.max_nfft = n;
    }
    if let Some(s) = stencil {
        config.stencil = s;
    }
    config.validate()?;

    let catalog: Box<dyn SnapshotCatalog + Sync> = match &config.snapshot_list {
        Some(list) => Box::new(ListCatalog::from_list(list)?),
        None => Box::new(demo_catalog(particles)),
    };

    let Some(cells) = run_ranks(ranks, catalog.as_ref(), &config, rays_per_cell)? else {
        return Ok(());
    };

    create_dir_all(&out_dir).map_err(|e| LensError::io(&out_dir, e))?;
    config.write_to_dir(&out_dir)?;
    let csv = out_dir.join("rays.csv");
    write_rays_csv(&csv, &cells)?;

    let n_rays: usize = cells.iter().map(|(_, c)| c.rays.len()).sum();
    let mean = |f: &dyn Fn(&Ray) -> f64| {
        cells
            .iter()
            .flat_map(|(_, c)| c.rays.iter())
            .map(f)
            .sum::<f64>()
            / n_rays.max(1) as f64
    };
    log::info!(
        "[lenspot] {} rays: <phi> = {:.4e}, <|alpha|> = {:.4e}, <kappa> = {:.4e}",
        n_rays,
        mean(&|r: &Ray| r.phi),
        mean(&|r: &Ray| (r.alpha[0] * r.alpha[0] + r.alpha[1] * r.alpha[1]).sqrt()),
        mean(&|r: &Ray| 0.5 * (r.u[0] + r.u[3]))
    );
    log::info!("[lenspot] wrote {}", csv.display());
    Ok(())
}
