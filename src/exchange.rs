// src/exchange.rs
//
// XOR-partner shuffle of sorted grid-cell runs between slab owners.
//
// At round `level` (0..next_pow2(P)) rank r talks to r ^ level; partners past
// the end of the group make the round a no-op for r. In every round each side
// locates the contiguous run of its (id-sorted) cells that falls inside the
// partner's slab, swaps counts, then swaps payload:
//
//   Deposit: the run carries values for the partner's rows. The owner hands
//            each received cell to `fill`, which adds it into its slab.
//   Fetch:   the run carries requested ids. The owner fills values through
//            `fill` and sends the cells straight back; the requester copies
//            the values into its own run.
//
// The self round (level 0) calls `fill` on the local run directly.
// Rounds are strictly sequential per rank; the paired sendrecv calls are the
// only suspension points.

use std::ops::Range;

use crate::comm::{self, Communicator};
use crate::decomp::SlabDecomposition;
use crate::gridcell_hash::GridCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeDirection {
    /// Values flow from the holder of `cells` to the slab owners.
    Deposit,
    /// Values flow from the slab owners into `cells`.
    Fetch,
}

/// Cell counts moved by one exchange on one rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    /// Cells filled without a message (self round).
    pub local: usize,
    /// Cells this rank shipped to partners.
    pub sent: usize,
    /// Cells this rank received from partners.
    pub received: usize,
}

/// Locate the cells of a sorted array whose ids fall in `range`.
///
/// Returns (offset, count): `(Some(o), n>0)` for a run starting at `o`, or
/// `(None, 0)` when nothing matches. Fatal if the matching cells are not one
/// contiguous run, which means the array was not sorted by id.
pub fn owner_run(cells: &[GridCell], range: &Range<i64>) -> (Option<usize>, usize) {
    let mut offset = None;
    let mut count = 0usize;
    for (n, c) in cells.iter().enumerate() {
        if range.contains(&c.id) {
            if offset.is_none() {
                offset = Some(n);
            }
            count += 1;
        }
    }
    check_pairing(offset, count);
    if let Some(o) = offset {
        if !cells[o..o + count].iter().all(|c| range.contains(&c.id)) {
            crate::fatal!(
                "cells for id range {:?} are not contiguous (offset {}, count {}); table not sorted?",
                range,
                o,
                count
            );
        }
    }
    (offset, count)
}

#[inline]
fn check_pairing(offset: Option<usize>, count: usize) {
    let ok = matches!((offset, count), (Some(_), n) if n > 0) || (offset.is_none() && count == 0);
    if !ok {
        crate::fatal!(
            "exchange offset/count mismatch: offset={:?} count={}",
            offset,
            count
        );
    }
}

/// Collective: run every exchange round. `cells` must be sorted by id.
///
/// `fill` is called once for every cell that lands in this rank's slab:
/// local cells, received deposits, and received fetch requests.
pub fn pairwise_exchange<C, F>(
    comm: &C,
    decomp: &SlabDecomposition,
    cells: &mut [GridCell],
    direction: ExchangeDirection,
    mut fill: F,
) -> ExchangeStats
where
    C: Communicator + ?Sized,
    F: FnMut(&mut GridCell),
{
    let rank = comm.rank();
    let size = comm.size();
    assert_eq!(
        decomp.num_ranks(),
        size,
        "slab table built for {} ranks, communicator has {}",
        decomp.num_ranks(),
        size
    );
    let mine = decomp.id_range(rank);
    let mut stats = ExchangeStats::default();

    for level in 0..comm::pairing_rounds(size) {
        let partner = rank ^ level;
        if partner >= size {
            continue;
        }

        let (offset, count) = owner_run(cells, &decomp.id_range(partner));
        let run = match offset {
            Some(o) => &mut cells[o..o + count],
            None => &mut cells[0..0],
        };

        if partner == rank {
            for c in run.iter_mut() {
                fill(c);
            }
            stats.local += count;
            continue;
        }

        let their_count = comm::sendrecv(comm, partner, &[count as u64]);
        let their_count = match their_count.as_slice() {
            [n] => *n as usize,
            other => crate::fatal!(
                "{:04}: bad count message from rank {}: {:?}",
                rank,
                partner,
                other
            ),
        };

        let payload: Vec<GridCell> = match direction {
            ExchangeDirection::Deposit => run.to_vec(),
            ExchangeDirection::Fetch => run.iter().map(|c| GridCell::new(c.id, 0.0)).collect(),
        };
        let mut incoming: Vec<GridCell> = comm::sendrecv(comm, partner, &payload);
        if incoming.len() != their_count {
            crate::fatal!(
                "{:04}: rank {} announced {} cells but sent {}",
                rank,
                partner,
                their_count,
                incoming.len()
            );
        }
        stats.sent += count;
        stats.received += their_count;

        for c in incoming.iter_mut() {
            if !mine.contains(&c.id) {
                crate::fatal!(
                    "{:04}: rank {} sent id {} outside local ids {:?}",
                    rank,
                    partner,
                    c.id,
                    mine
                );
            }
            fill(c);
        }

        if direction == ExchangeDirection::Fetch {
            let answers: Vec<GridCell> = comm::sendrecv(comm, partner, &incoming);
            if answers.len() != count {
                crate::fatal!(
                    "{:04}: asked rank {} for {} cells, got {}",
                    rank,
                    partner,
                    count,
                    answers.len()
                );
            }
            for (c, a) in run.iter_mut().zip(&answers) {
                if c.id != a.id {
                    crate::fatal!(
                        "{:04}: rank {} answered id {} for request {}",
                        rank,
                        partner,
                        a.id,
                        c.id
                    );
                }
                c.val = a.val;
            }
        }
    }

    log::trace!(
        "{:04}: exchange {:?} local={} sent={} received={}",
        rank,
        direction,
        stats.local,
        stats.sent,
        stats.received
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;

    fn cells(ids: &[i64]) -> Vec<GridCell> {
        ids.iter().map(|&id| GridCell::new(id, id as f64)).collect()
    }

    #[test]
    fn owner_run_finds_contiguous_block() {
        let c = cells(&[1, 4, 9, 10, 11, 30]);
        assert_eq!(owner_run(&c, &(9..12)), (Some(2), 3));
        assert_eq!(owner_run(&c, &(12..30)), (None, 0));
        assert_eq!(owner_run(&c, &(0..100)), (Some(0), 6));
        assert_eq!(owner_run(&[], &(0..100)), (None, 0));
    }

    #[test]
    #[should_panic(expected = "not contiguous")]
    fn unsorted_cells_are_fatal() {
        let c = cells(&[9, 40, 10]);
        owner_run(&c, &(9..12));
    }

    #[test]
    fn single_rank_exchange_is_all_local() {
        let comm = crate::comm::LocalComm::single();
        let d = SlabDecomposition::rebuild(&comm, 4);
        let mut c = cells(&[0, 5, 63]);
        let mut seen = Vec::new();
        let stats = pairwise_exchange(&comm, &d, &mut c, ExchangeDirection::Fetch, |cell| {
            seen.push(cell.id);
            cell.val = -1.0;
        });
        assert_eq!(seen, vec![0, 5, 63]);
        assert!(c.iter().all(|x| x.val == -1.0));
        assert_eq!(stats.local, 3);
        assert_eq!(stats.sent + stats.received, 0);
    }

    #[test]
    fn fetch_returns_owner_values_on_three_ranks() {
        // n = 5, 3 ranks: rows 0-1, 2-3, 4
        let n = 5usize;
        let out = run_local(3, |comm| {
            let d = SlabDecomposition::rebuild(&comm, n);
            // every rank asks for one id in every row, plus a rank-specific one
            let mut ids: Vec<i64> = (0..n as i64).map(|i| i * 25 + 7).collect();
            ids.push(comm.rank() as i64 * 40 + 3);
            ids.sort();
            ids.dedup();
            let mut req: Vec<GridCell> = ids.iter().map(|&id| GridCell::new(id, 0.0)).collect();
            let stats = pairwise_exchange(&comm, &d, &mut req, ExchangeDirection::Fetch, |c| {
                assert!(d.owns(comm.rank(), c.id));
                c.val = 1000.0 + c.id as f64;
            });
            (req, stats)
        });
        let mut sent = 0;
        let mut received = 0;
        for (req, stats) in &out {
            for c in req {
                assert_eq!(c.val, 1000.0 + c.id as f64, "id {}", c.id);
            }
            sent += stats.sent;
            received += stats.received;
        }
        assert_eq!(sent, received);
    }

    #[test]
    fn deposits_are_conserved() {
        let n = 6usize;
        let n3 = (n * n * n) as i64;
        let out = run_local(4, |comm| {
            let d = SlabDecomposition::rebuild(&comm, n);
            let r = comm.rank() as i64;
            // a deterministic spread of ids with values tied to the depositing rank
            let mut dep: Vec<GridCell> = (0..40)
                .map(|m| (m * 37 + r * 11) % n3)
                .map(|id| GridCell::new(id, (r + 1) as f64))
                .collect();
            dep.sort_by_key(|c| c.id);
            dep.dedup_by_key(|c| c.id);
            let before_sum: f64 = dep.iter().map(|c| c.val).sum();
            let before_ids: i64 = dep.iter().map(|c| c.id).sum();

            let mut got_sum = 0.0;
            let mut got_ids = 0i64;
            let stats = pairwise_exchange(&comm, &d, &mut dep, ExchangeDirection::Deposit, |c| {
                assert!(d.owns(comm.rank(), c.id));
                got_sum += c.val;
                got_ids += c.id;
            });
            (before_sum, before_ids, got_sum, got_ids, stats)
        });

        let total = |f: fn(&(f64, i64, f64, i64, ExchangeStats)) -> f64| -> f64 {
            out.iter().map(f).sum()
        };
        assert_eq!(total(|o| o.0), total(|o| o.2));
        assert_eq!(total(|o| o.1 as f64), total(|o| o.3 as f64));
        let sent: usize = out.iter().map(|o| o.4.sent).sum();
        let received: usize = out.iter().map(|o| o.4.received).sum();
        assert_eq!(sent, received);
    }
}
