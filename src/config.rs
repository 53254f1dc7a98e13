// src/config.rs
//
// Run configuration: JSON file, then LENSPOT_* environment overrides, then
// validation. The effective configuration is written next to the outputs.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LensError, Result};
use crate::stencil::StencilPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RayTraceConfig {
    /// Matter density parameter today.
    pub omega_m: f64,

    /// Target grid size; when None it follows from the smoothing length.
    pub nfft_hint: Option<usize>,
    /// Hard ceiling on the grid size.
    pub max_nfft: usize,
    /// Smallest angular smoothing length to resolve (radians).
    pub min_smoothing_length: f64,

    pub num_lens_planes: usize,
    /// Comoving distance covered by all lens planes together (Mpc/h).
    pub max_comoving_distance: f64,

    /// Snapshot length unit -> Mpc/h.
    pub length_conv_fact: f64,
    pub snapshot_list: Option<PathBuf>,
    /// Ranks per I/O group when reading snapshot files.
    pub num_files_io_in_parallel: usize,

    pub stencil: StencilPolicy,
}

impl Default for RayTraceConfig {
    fn default() -> Self {
        Self {
            omega_m: 0.3,
            nfft_hint: None,
            max_nfft: 512,
            // 1 arcmin
            min_smoothing_length: 2.908_882_086_657_216e-4,
            num_lens_planes: 50,
            max_comoving_distance: 4000.0,
            length_conv_fact: 1.0,
            snapshot_list: None,
            num_files_io_in_parallel: 8,
            stencil: StencilPolicy::Staggered,
        }
    }
}

impl RayTraceConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| LensError::io(path, e))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|source| LensError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from LENSPOT_* environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        fn get<T: std::str::FromStr>(name: &str) -> Option<T> {
            let raw = std::env::var(name).ok()?;
            match raw.trim().parse::<T>() {
                Ok(v) => Some(v),
                Err(_) => {
                    log::warn!("[config] ignoring {}={:?} (not a valid value)", name, raw);
                    None
                }
            }
        }

        if let Some(v) = get::<usize>("LENSPOT_MAX_NFFT") {
            self.max_nfft = v.max(1);
        }
        if let Some(v) = get::<usize>("LENSPOT_NFFT_HINT") {
            self.nfft_hint = if v == 0 { None } else { Some(v) };
        }
        if let Some(v) = get::<f64>("LENSPOT_MIN_SL") {
            self.min_smoothing_length = v;
        }
        if let Some(v) = get::<usize>("LENSPOT_IO_FANOUT") {
            self.num_files_io_in_parallel = v.max(1);
        }
        if let Ok(v) = std::env::var("LENSPOT_STENCIL") {
            match StencilPolicy::parse(&v) {
                Some(p) => self.stencil = p,
                None => log::warn!("[config] ignoring LENSPOT_STENCIL={:?}", v),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(LensError::InvalidConfig(msg));
        if !(self.omega_m > 0.0 && self.omega_m <= 1.0) {
            return bad(format!("omega_m = {} must lie in (0, 1]", self.omega_m));
        }
        if self.max_nfft == 0 {
            return bad("max_nfft must be positive".into());
        }
        if self.nfft_hint == Some(0) {
            return bad("nfft_hint must be positive when given".into());
        }
        if !(self.min_smoothing_length > 0.0 && self.min_smoothing_length.is_finite()) {
            return bad(format!(
                "min_smoothing_length = {} must be positive",
                self.min_smoothing_length
            ));
        }
        if self.num_lens_planes == 0 {
            return bad("num_lens_planes must be positive".into());
        }
        if !(self.max_comoving_distance > 0.0) {
            return bad(format!(
                "max_comoving_distance = {} must be positive",
                self.max_comoving_distance
            ));
        }
        if !(self.length_conv_fact > 0.0) {
            return bad(format!(
                "length_conv_fact = {} must be positive",
                self.length_conv_fact
            ));
        }
        if self.num_files_io_in_parallel == 0 {
            return bad("num_files_io_in_parallel must be positive".into());
        }
        Ok(())
    }

    /// Thickness of one lens plane (Mpc/h).
    pub fn plane_thickness(&self) -> f64 {
        self.max_comoving_distance / self.num_lens_planes as f64
    }

    pub fn write_to_dir(&self, out_dir: &Path) -> Result<()> {
        let path = out_dir.join("config.json");
        let file = File::create(&path).map_err(|e| LensError::io(&path, e))?;
        serde_json::to_writer_pretty(file, self).map_err(|source| LensError::ConfigParse {
            path: path.clone(),
            source,
        })?;
        Ok(())
    }
}
