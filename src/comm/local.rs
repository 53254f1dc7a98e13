// src/comm/local.rs
//
// In-process cluster: each rank is a scoped thread, each ordered (src, dst) pair
// has its own FIFO channel. All calls are matched collectives or paired exchanges,
// so per-pair FIFO order is all the protocol needs (no tags).
//
// Failure model: a rank that panics drops its senders on unwind; any peer that
// later waits on it gets a disconnect and panics too, so a broken run fails
// instead of hanging. `run_local` re-raises the root-cause panic, not the
// `PeerLost` cascade it triggered.

use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;

use super::Communicator;

/// Panic payload of a rank whose peer disappeared mid-protocol.
#[derive(Debug)]
pub struct PeerLost {
    pub rank: usize,
    pub peer: usize,
}

pub struct LocalComm {
    rank: usize,
    size: usize,
    to: Vec<Sender<Vec<u8>>>,
    from: Vec<Receiver<Vec<u8>>>,
}

impl LocalComm {
    /// A one-rank group; every collective degenerates to a local copy.
    pub fn single() -> Self {
        Self::group(1).pop().expect("group(1) yields one rank")
    }

    /// Build the endpoints for `size` ranks, indexed by rank.
    pub fn group(size: usize) -> Vec<LocalComm> {
        assert!(size > 0, "LocalComm::group: size must be positive");
        let mut to: Vec<Vec<Sender<Vec<u8>>>> = (0..size).map(|_| Vec::new()).collect();
        let mut from: Vec<Vec<Receiver<Vec<u8>>>> = (0..size).map(|_| Vec::new()).collect();
        for dst in 0..size {
            for src in 0..size {
                let (tx, rx) = channel();
                to[src].push(tx); // pushed in dst order
                from[dst].push(rx); // pushed in src order
            }
        }
        to.into_iter()
            .zip(from)
            .enumerate()
            .map(|(rank, (to, from))| LocalComm {
                rank,
                size,
                to,
                from,
            })
            .collect()
    }

    fn send(&self, dst: usize, msg: Vec<u8>) {
        if self.to[dst].send(msg).is_err() {
            self.peer_lost(dst);
        }
    }

    fn recv(&self, src: usize) -> Vec<u8> {
        match self.from[src].recv() {
            Ok(msg) => msg,
            Err(_) => self.peer_lost(src),
        }
    }

    fn peer_lost(&self, peer: usize) -> ! {
        log::error!("{:04}: rank {} hung up mid-exchange", self.rank, peer);
        std::panic::panic_any(PeerLost {
            rank: self.rank,
            peer,
        })
    }
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        let empty = (0..self.size).map(|_| Vec::new()).collect();
        self.all_to_all_bytes(empty);
    }

    fn sendrecv_bytes(&self, partner: usize, send: &[u8]) -> Vec<u8> {
        assert!(partner < self.size, "sendrecv: partner {} out of range", partner);
        // Channels are unbounded, so send-then-receive cannot deadlock.
        self.send(partner, send.to_vec());
        self.recv(partner)
    }

    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        assert_eq!(send.len(), self.size, "all_to_all: need one buffer per rank");
        for (dst, msg) in send.into_iter().enumerate() {
            self.send(dst, msg);
        }
        (0..self.size).map(|src| self.recv(src)).collect()
    }
}

/// Run `f` on `size` ranks concurrently and collect the results by rank.
///
/// Panics from any rank propagate to the caller after all threads finish; a
/// rank's own panic wins over the `PeerLost` panics it caused in others.
pub fn run_local<F, R>(size: usize, f: F) -> Vec<R>
where
    F: Fn(LocalComm) -> R + Sync,
    R: Send,
{
    let comms = LocalComm::group(size);
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                thread::Builder::new()
                    .name(format!("rank-{:04}", comm.rank))
                    .spawn_scoped(s, move || f(comm))
                    .expect("failed to spawn rank thread")
            })
            .collect();

        let mut results = Vec::with_capacity(size);
        let mut panics = Vec::new();
        for h in handles {
            match h.join() {
                Ok(r) => results.push(r),
                Err(p) => panics.push(p),
            }
        }
        if !panics.is_empty() {
            let root = panics
                .iter()
                .position(|p| p.downcast_ref::<PeerLost>().is_none())
                .unwrap_or(0);
            std::panic::resume_unwind(panics.swap_remove(root));
        }
        results
    })
}
