// src/rays.rs

use bytemuck::{Pod, Zeroable};

use crate::comm::{self, Communicator};

/// Flag bit of bundle cells this rank is responsible for.
pub const PRIMARY_BUNDLECELL: u32 = 1;

/// One ray: its direction and the lensing quantities accumulated along it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Ray {
    /// Direction on the sky; need not be normalised.
    pub n: [f64; 3],
    pub phi: f64,
    /// Deflection, (theta, phi) components.
    pub alpha: [f64; 2],
    /// Tidal tensor, row-major 2x2.
    pub u: [f64; 4],
}

impl Ray {
    pub fn new(n: [f64; 3]) -> Self {
        Self {
            n,
            ..Self::default()
        }
    }

    pub fn is_finite(&self) -> bool {
        self.phi.is_finite()
            && self.alpha.iter().all(|v| v.is_finite())
            && self.u.iter().all(|v| v.is_finite())
    }
}

/// A patch of sky whose rays are gathered and sampled together.
#[derive(Debug, Clone, Default)]
pub struct BundleCell {
    pub flags: u32,
    pub rays: Vec<Ray>,
}

impl BundleCell {
    /// A bundle cell flagged primary.
    pub fn primary(rays: Vec<Ray>) -> Self {
        Self {
            flags: PRIMARY_BUNDLECELL,
            rays,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.flags & PRIMARY_BUNDLECELL != 0
    }
}

fn to_root<T: Clone>(size: usize, root: usize, data: Vec<T>) -> Vec<Vec<T>> {
    (0..size)
        .map(|r| if r == root { data.clone() } else { Vec::new() })
        .collect()
}

/// Collective: every rank's `(bundle cell index, cell)` pairs end up on
/// `root`, sorted by index and flagged primary. Other ranks get an empty list.
pub fn gather_cells<C>(
    comm: &C,
    root: usize,
    cells: &[(usize, BundleCell)],
) -> Vec<(usize, BundleCell)>
where
    C: Communicator + ?Sized,
{
    let size = comm.size();
    let index: Vec<u64> = cells
        .iter()
        .flat_map(|(b, c)| [*b as u64, c.rays.len() as u64])
        .collect();
    let rays: Vec<Ray> = cells.iter().flat_map(|(_, c)| c.rays.iter().copied()).collect();

    let index = comm::all_to_all(comm, to_root(size, root, index));
    let rays = comm::all_to_all(comm, to_root(size, root, rays));
    if comm.rank() != root {
        return Vec::new();
    }

    let mut out = Vec::new();
    for (idx, from) in index.iter().zip(&rays) {
        let mut it = from.iter().copied();
        for pair in idx.chunks_exact(2) {
            let rays = it.by_ref().take(pair[1] as usize).collect();
            out.push((pair[0] as usize, BundleCell::primary(rays)));
        }
    }
    out.sort_by_key(|(b, _)| *b);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;

    #[test]
    fn cells_gather_on_root_in_index_order() {
        let out = run_local(3, |comm| {
            // rank r owns cells r and r + 3, with r + 1 rays each
            let mine: Vec<(usize, BundleCell)> = [comm.rank(), comm.rank() + 3]
                .into_iter()
                .map(|b| {
                    let rays = (0..=comm.rank())
                        .map(|i| {
                            let mut r = Ray::new([b as f64, i as f64, 1.0]);
                            r.phi = (10 * b + i) as f64;
                            r
                        })
                        .collect();
                    (b, BundleCell::primary(rays))
                })
                .collect();
            gather_cells(&comm, 1, &mine)
        });
        assert!(out[0].is_empty() && out[2].is_empty());

        let got = &out[1];
        assert_eq!(got.iter().map(|(b, _)| *b).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 5]);
        for (b, cell) in got {
            assert!(cell.is_primary());
            assert_eq!(cell.rays.len(), b % 3 + 1);
            for (i, r) in cell.rays.iter().enumerate() {
                assert_eq!(r.n, [*b as f64, i as f64, 1.0]);
                assert_eq!(r.phi, (10 * b + i) as f64);
            }
        }
    }
}
