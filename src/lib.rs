// src/lib.rs

pub mod comm;
pub mod config;
pub mod constants;
pub mod cosmology;
pub mod decomp;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod fft;
pub mod grid;
pub mod gridcell_hash;
pub mod partio;
pub mod poisson;
pub mod projector;
pub mod rays;
pub mod slab;
pub mod snapshot;
pub mod stencil;
pub mod vec3;
