// src/comm/mpi.rs
//
// MPI backend (feature "mpi"): one OS process per rank.

use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::{Count, Rank};

use super::Communicator;

pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }
}

fn displacements(counts: &[Count]) -> Vec<Count> {
    counts
        .iter()
        .scan(0, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect()
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn barrier(&self) {
        self.world.barrier();
    }

    fn sendrecv_bytes(&self, partner: usize, send: &[u8]) -> Vec<u8> {
        let process = self.world.process_at_rank(partner as Rank);
        mpi::request::scope(|scope| {
            let req = process.immediate_send(scope, send);
            let (msg, _status) = process.receive_vec::<u8>();
            req.wait();
            msg
        })
    }

    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        let size = self.size();
        assert_eq!(send.len(), size, "all_to_all: need one buffer per rank");

        let send_counts: Vec<Count> = send.iter().map(|v| v.len() as Count).collect();
        let mut recv_counts: Vec<Count> = vec![0; size];
        self.world
            .all_to_all_into(&send_counts[..], &mut recv_counts[..]);

        let send_displs = displacements(&send_counts);
        let recv_displs = displacements(&recv_counts);
        let flat: Vec<u8> = send.concat();
        let total: usize = recv_counts.iter().map(|&c| c as usize).sum();
        let mut recv = vec![0u8; total];
        {
            let partition = Partition::new(&flat[..], &send_counts[..], &send_displs[..]);
            let mut partition_mut =
                PartitionMut::new(&mut recv[..], &recv_counts[..], &recv_displs[..]);
            self.world
                .all_to_all_varcount_into(&partition, &mut partition_mut);
        }

        recv_counts
            .iter()
            .zip(recv_displs.iter())
            .map(|(&c, &d)| recv[d as usize..(d + c) as usize].to_vec())
            .collect()
    }
}
