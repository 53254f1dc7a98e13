// src/partio.rs
//
// Which snapshot sub-files each rank reads, and in which I/O group.
//
// With at least as many files as ranks, files are dealt in contiguous blocks
// of ceil(n_files / P); otherwise rank r < n_files reads file r alone.
// Ranks are grouped `fanout` at a time; groups read one after another with a
// barrier in between, which bounds how many ranks hit the filesystem at once.

use std::ops::Range;

use crate::comm::Communicator;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAssignment {
    pub files: Range<usize>,
    /// None when this rank reads nothing.
    pub io_group: Option<usize>,
    pub num_io_groups: usize,
}

pub fn assign_files(n_files: usize, rank: usize, size: usize, fanout: usize) -> FileAssignment {
    assert!(size > 0 && rank < size, "assign_files: rank {} of {}", rank, size);
    let fanout = fanout.max(1);

    let files = if n_files >= size {
        let per_rank = (n_files + size - 1) / size;
        let start = (rank * per_rank).min(n_files);
        start..(start + per_rank).min(n_files)
    } else if rank < n_files {
        rank..rank + 1
    } else {
        0..0
    };

    let num_io_groups = (size + fanout - 1) / fanout;
    let io_group = if files.is_empty() {
        None
    } else {
        Some(rank / fanout)
    };
    FileAssignment {
        files,
        io_group,
        num_io_groups,
    }
}

impl FileAssignment {
    /// Collective: call `read` on each assigned file while this rank's group
    /// has its turn. Every rank walks every group so the barriers match.
    ///
    /// An error stops this rank's reading but not its participation in the
    /// remaining barriers; the first error is returned at the end.
    pub fn for_each_file<C, F>(&self, comm: &C, mut read: F) -> Result<()>
    where
        C: Communicator + ?Sized,
        F: FnMut(usize) -> Result<()>,
    {
        let mut outcome = Ok(());
        for group in 0..self.num_io_groups {
            if self.io_group == Some(group) {
                log::debug!(
                    "{:04}: IO group = {}, files {:?}",
                    comm.rank(),
                    group,
                    self.files
                );
                for file in self.files.clone() {
                    if let Err(e) = read(file) {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            comm.barrier();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;

    fn all(n_files: usize, size: usize, fanout: usize) -> Vec<FileAssignment> {
        (0..size)
            .map(|r| assign_files(n_files, r, size, fanout))
            .collect()
    }

    #[test]
    fn every_file_is_read_exactly_once() {
        for n_files in 0..20 {
            for size in 1..9 {
                let mut seen = vec![0; n_files];
                for a in all(n_files, size, 2) {
                    for f in a.files {
                        seen[f] += 1;
                    }
                }
                assert!(seen.iter().all(|&c| c == 1), "n_files={} size={}", n_files, size);
            }
        }
    }

    #[test]
    fn blocks_and_groups() {
        let a = all(10, 4, 3);
        let files: Vec<_> = a.iter().map(|x| x.files.clone()).collect();
        assert_eq!(files, vec![0..3, 3..6, 6..9, 9..10]);
        assert_eq!(a[0].num_io_groups, 2);
        assert_eq!(a[2].io_group, Some(0));
        assert_eq!(a[3].io_group, Some(1));

        // 5 files over 4 ranks: the last block would start past the end
        let b = all(5, 4, 1);
        assert_eq!(b[2].files, 4..5);
        assert!(b[3].files.is_empty());
        assert_eq!(b[3].io_group, None);
    }

    #[test]
    fn idle_ranks_have_no_group() {
        let a = all(2, 4, 2);
        assert_eq!(a[0].files, 0..1);
        assert_eq!(a[1].files, 1..2);
        assert_eq!(a[2].io_group, None);
        assert_eq!(a[3].io_group, None);
        assert_eq!(a[3].num_io_groups, 2);
    }

    #[test]
    fn groups_take_turns() {
        let logs = run_local(4, |comm| {
            let a = assign_files(4, comm.rank(), comm.size(), 2);
            let mut read = Vec::new();
            a.for_each_file(&comm, |f| {
                read.push(f);
                Ok(())
            })
            .unwrap();
            read
        });
        assert_eq!(logs, vec![vec![0], vec![1], vec![2], vec![3]]);
    }
}
