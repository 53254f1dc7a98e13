// src/decomp.rs
//
// Slab ownership table for the current grid size.
//
// Rank r owns rows [starts[r], starts[r] + lengths[r]) of axis 0, hence the
// contiguous id range [starts[r]*n*n, (starts[r]+lengths[r])*n*n). Ranks are
// ordered by slab start, so sorting ids also groups them by owner.

use std::ops::Range;

use crate::comm::{self, Communicator};
use crate::fft::local_slab;

#[derive(Debug, Clone, PartialEq)]
pub struct SlabDecomposition {
    nfft: usize,
    rank: usize,
    starts: Vec<usize>,
    lengths: Vec<usize>,
    max_len: usize,
}

impl SlabDecomposition {
    /// Collective: query the local slab and all-gather every rank's
    /// (start, length). Must be called again whenever `nfft` changes.
    pub fn rebuild<C>(comm: &C, nfft: usize) -> Self
    where
        C: Communicator + ?Sized,
    {
        let (start, len) = local_slab(nfft, comm.rank(), comm.size());
        let table = comm::all_gather(comm, [start as u64, len as u64]);
        let (starts, lengths) = table
            .iter()
            .map(|&[s, l]| (s as usize, l as usize))
            .unzip();
        let d = Self::from_slabs(nfft, comm.rank(), starts, lengths);
        log::debug!(
            "{:04}: slab {}+{} of nfft={} (max slab {})",
            d.rank,
            start,
            len,
            nfft,
            d.max_len
        );
        d
    }

    /// Build a table from explicit per-rank slabs (used by `rebuild` and tests).
    pub fn from_slabs(nfft: usize, rank: usize, starts: Vec<usize>, lengths: Vec<usize>) -> Self {
        assert_eq!(starts.len(), lengths.len(), "one (start, length) per rank");
        assert!(rank < starts.len(), "rank {} outside {} slabs", rank, starts.len());
        let mut covered = 0;
        for (r, (&s, &l)) in starts.iter().zip(&lengths).enumerate() {
            if l == 0 {
                continue;
            }
            if s != covered {
                crate::fatal!(
                    "slab table not contiguous: rank {} starts at {}, expected {}",
                    r,
                    s,
                    covered
                );
            }
            covered = s + l;
        }
        if covered != nfft {
            crate::fatal!("slab table covers {} of {} rows", covered, nfft);
        }
        let max_len = lengths.iter().copied().max().unwrap_or(0);
        Self {
            nfft,
            rank,
            starts,
            lengths,
            max_len,
        }
    }

    pub fn nfft(&self) -> usize {
        self.nfft
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_ranks(&self) -> usize {
        self.starts.len()
    }

    pub fn local_start(&self) -> usize {
        self.starts[self.rank]
    }

    pub fn local_len(&self) -> usize {
        self.lengths[self.rank]
    }

    pub fn slab(&self, rank: usize) -> (usize, usize) {
        (self.starts[rank], self.lengths[rank])
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Linear ids owned by `rank`.
    pub fn id_range(&self, rank: usize) -> Range<i64> {
        let plane = (self.nfft * self.nfft) as i64;
        let s = self.starts[rank] as i64;
        let l = self.lengths[rank] as i64;
        s * plane..(s + l) * plane
    }

    pub fn owns(&self, rank: usize, id: i64) -> bool {
        self.id_range(rank).contains(&id)
    }

    /// Rank whose slab contains the row of `id`.
    pub fn owning_rank(&self, id: i64) -> usize {
        let n = self.nfft as i64;
        if id < 0 || id >= n * n * n {
            crate::fatal!("grid id {} outside nfft={} grid", id, self.nfft);
        }
        let i = (id / (n * n)) as usize;
        // last rank whose slab starts at or before row i and is non-empty
        let r = self
            .starts
            .iter()
            .zip(&self.lengths)
            .rposition(|(&s, &l)| l > 0 && s <= i);
        match r {
            Some(r) => r,
            None => crate::fatal!("no rank owns row {} (nfft={})", i, self.nfft),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;

    #[test]
    fn ownership_covers_every_row_exactly_once() {
        for n in 1..24usize {
            for p in 1..10usize {
                let starts: Vec<usize> = (0..p).map(|r| local_slab(n, r, p).0).collect();
                let lengths: Vec<usize> = (0..p).map(|r| local_slab(n, r, p).1).collect();
                let d = SlabDecomposition::from_slabs(n, 0, starts, lengths);

                let mut owner_count = vec![0usize; n];
                for r in 0..p {
                    let (s, l) = d.slab(r);
                    for i in s..s + l {
                        owner_count[i] += 1;
                    }
                }
                assert!(owner_count.iter().all(|&c| c == 1), "n={} p={}", n, p);

                let plane = (n * n) as i64;
                for i in 0..n {
                    let id = i as i64 * plane + (plane - 1);
                    let r = d.owning_rank(id);
                    assert!(d.owns(r, id), "n={} p={} row={}", n, p, i);
                }
            }
        }
    }

    #[test]
    fn rebuild_agrees_across_ranks() {
        let tables = run_local(3, |comm| SlabDecomposition::rebuild(&comm, 8));
        for (r, t) in tables.iter().enumerate() {
            assert_eq!(t.rank(), r);
            assert_eq!(t.max_len(), 3);
            assert_eq!(t.slab(0), (0, 3));
            assert_eq!(t.slab(1), (3, 3));
            assert_eq!(t.slab(2), (6, 2));
        }
        assert_eq!(tables[1].id_range(1), 3 * 64..6 * 64);
        assert_eq!(tables[0].owning_rank(6 * 64), 2);
    }

    #[test]
    fn idle_ranks_own_nothing() {
        let d = SlabDecomposition::from_slabs(2, 0, vec![0, 1, 2, 2], vec![1, 1, 0, 0]);
        assert!(d.id_range(3).is_empty());
        assert_eq!(d.owning_rank(7), 1);
        assert!(!d.owns(2, 7));
    }

    #[test]
    #[should_panic(expected = "not contiguous")]
    fn gapped_table_is_fatal() {
        SlabDecomposition::from_slabs(4, 0, vec![0, 3], vec![2, 1]);
    }
}
