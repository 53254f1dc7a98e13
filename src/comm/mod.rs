// src/comm/mod.rs
//
// Rank-to-rank message passing.
//
// Everything above this layer talks to a `Communicator`: a fixed group of ranks
// exchanging byte buffers in matched, blocking calls. Typed helpers on top move
// any `bytemuck::Pod` payload (grid cells, counts, FFT planes).
//
// Backends:
// - `local`: ranks are scoped threads joined by channels (tests, single-node runs).
// - `mpi` (feature "mpi"): one process per rank over an MPI world communicator.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

pub use local::{LocalComm, run_local};

use bytemuck::Pod;

pub trait Communicator {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Block until every rank has entered the barrier.
    fn barrier(&self);

    /// Send `send` to `partner` and receive the buffer `partner` sends back.
    /// Both sides must call this with each other as partner.
    fn sendrecv_bytes(&self, partner: usize, send: &[u8]) -> Vec<u8>;

    /// `send[r]` goes to rank r; returns what each rank sent to us, indexed by source.
    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>) -> Vec<Vec<u8>>;
}

/// Reinterpret a received byte buffer as a vector of `T`.
pub(crate) fn from_bytes<T: Pod>(bytes: &[u8]) -> Vec<T> {
    let sz = std::mem::size_of::<T>();
    assert!(
        bytes.len() % sz == 0,
        "from_bytes: {} bytes is not a multiple of element size {}",
        bytes.len(),
        sz
    );
    let mut out = vec![T::zeroed(); bytes.len() / sz];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
    out
}

/// Typed pairwise exchange.
pub fn sendrecv<C, T>(comm: &C, partner: usize, send: &[T]) -> Vec<T>
where
    C: Communicator + ?Sized,
    T: Pod,
{
    let bytes = comm.sendrecv_bytes(partner, bytemuck::cast_slice(send));
    from_bytes(&bytes)
}

/// Typed all-to-all with per-destination element counts.
pub fn all_to_all<C, T>(comm: &C, send: Vec<Vec<T>>) -> Vec<Vec<T>>
where
    C: Communicator + ?Sized,
    T: Pod,
{
    assert_eq!(send.len(), comm.size(), "all_to_all: need one buffer per rank");
    let raw: Vec<Vec<u8>> = send
        .iter()
        .map(|v| bytemuck::cast_slice::<T, u8>(v).to_vec())
        .collect();
    comm.all_to_all_bytes(raw)
        .iter()
        .map(|b| from_bytes(b))
        .collect()
}

/// Every rank contributes one value; everybody gets all of them, by rank.
pub fn all_gather<C, T>(comm: &C, value: T) -> Vec<T>
where
    C: Communicator + ?Sized,
    T: Pod,
{
    let send = vec![vec![value]; comm.size()];
    all_to_all(comm, send)
        .into_iter()
        .map(|v| {
            assert_eq!(v.len(), 1, "all_gather: expected exactly one value per rank");
            v[0]
        })
        .collect()
}

/// Copy `root`'s `data` to every rank. Non-root ranks pass what they have
/// (typically an empty slice); it is ignored.
pub fn broadcast<C, T>(comm: &C, root: usize, data: &[T]) -> Vec<T>
where
    C: Communicator + ?Sized,
    T: Pod,
{
    let send: Vec<Vec<T>> = (0..comm.size())
        .map(|_| {
            if comm.rank() == root {
                data.to_vec()
            } else {
                Vec::new()
            }
        })
        .collect();
    let mut recv = all_to_all(comm, send);
    std::mem::take(&mut recv[root])
}

/// Global maximum of one value per rank.
pub fn all_reduce_max<C>(comm: &C, value: u64) -> u64
where
    C: Communicator + ?Sized,
{
    all_gather(comm, value).into_iter().max().unwrap_or(value)
}

/// Number of XOR-partner rounds covering `size` ranks: the next power of two.
pub fn pairing_rounds(size: usize) -> usize {
    size.max(1).next_power_of_two()
}
