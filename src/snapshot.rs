// src/snapshot.rs
//
// Particle snapshots: the source trait the solver reads from, a header that
// can be broadcast as plain bytes, an in-memory implementation for tests and
// the demo, and a JSON file set (`<base>.0`, `<base>.1`, ...) for runs that
// want their particles on disk.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::comm::{self, Communicator};
use crate::error::{LensError, Result};

/// Global description of one snapshot, identical in every sub-file.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Particles over all sub-files.
    pub n_total: u64,
    /// Number of sub-files.
    pub n_files: u64,
    /// Periodic box side, in the snapshot's own length unit.
    pub box_len: f64,
    pub scale_factor: f64,
}

pub trait SnapshotSource {
    fn header(&self) -> Result<SnapshotHeader>;

    /// Positions of sub-file `file`, in the snapshot's own length unit.
    fn read_positions(&self, file: usize) -> Result<Vec<[f32; 3]>>;
}

impl<S: SnapshotSource + ?Sized> SnapshotSource for &S {
    fn header(&self) -> Result<SnapshotHeader> {
        (**self).header()
    }

    fn read_positions(&self, file: usize) -> Result<Vec<[f32; 3]>> {
        (**self).read_positions(file)
    }
}

/// An ordered list of snapshots along the light cone.
pub trait SnapshotCatalog {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self, idx: usize) -> String;

    fn open(&self, idx: usize) -> Result<Box<dyn SnapshotSource + '_>>;
}

/// Collective: rank 0 reads the header and every rank receives it, with the
/// box length converted by `length_conv_fact`.
pub fn broadcast_header<C>(
    comm: &C,
    source: &dyn SnapshotSource,
    length_conv_fact: f64,
) -> Result<SnapshotHeader>
where
    C: Communicator + ?Sized,
{
    let mine = if comm.rank() == 0 {
        match source.header() {
            Ok(h) => vec![h],
            Err(e) => {
                // Ship an empty payload so peers fail instead of waiting forever.
                let _ = comm::broadcast::<C, SnapshotHeader>(comm, 0, &[]);
                return Err(e);
            }
        }
    } else {
        Vec::new()
    };
    let got = comm::broadcast(comm, 0, &mine);
    let Some(mut h) = got.first().copied() else {
        return Err(LensError::Snapshot(
            "rank 0 could not read the snapshot header".to_string(),
        ));
    };
    h.box_len *= length_conv_fact;
    Ok(h)
}

#[derive(Debug, Clone)]
pub struct InMemorySnapshot {
    header: SnapshotHeader,
    files: Vec<Vec<[f32; 3]>>,
}

impl InMemorySnapshot {
    pub fn new(box_len: f64, scale_factor: f64, files: Vec<Vec<[f32; 3]>>) -> Self {
        let n_total = files.iter().map(|f| f.len() as u64).sum();
        Self {
            header: SnapshotHeader {
                n_total,
                n_files: files.len() as u64,
                box_len,
                scale_factor,
            },
            files,
        }
    }

    /// `n` particles uniformly at random in the box, dealt round-robin into
    /// `n_files` sub-files. Deterministic for a given seed.
    pub fn uniform_random(n: usize, n_files: usize, box_len: f64, scale_factor: f64, seed: u64) -> Self {
        assert!(n_files > 0, "uniform_random: need at least one file");
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut files = vec![Vec::with_capacity(n / n_files + 1); n_files];
        for p in 0..n {
            let pos = [
                (rng.random::<f64>() * box_len) as f32,
                (rng.random::<f64>() * box_len) as f32,
                (rng.random::<f64>() * box_len) as f32,
            ];
            files[p % n_files].push(pos.map(|x| if x as f64 >= box_len { 0.0 } else { x }));
        }
        Self::new(box_len, scale_factor, files)
    }

    /// One particle on every vertex of a `per_side`^3 lattice.
    pub fn lattice(per_side: usize, n_files: usize, box_len: f64, scale_factor: f64) -> Self {
        assert!(n_files > 0, "lattice: need at least one file");
        let spacing = box_len / per_side as f64;
        let mut files = vec![Vec::new(); n_files];
        let mut p = 0usize;
        for i in 0..per_side {
            for j in 0..per_side {
                for k in 0..per_side {
                    let pos = [i, j, k].map(|m| (m as f64 * spacing) as f32);
                    files[p % n_files].push(pos);
                    p += 1;
                }
            }
        }
        Self::new(box_len, scale_factor, files)
    }

    /// Write as a JSON file set `<base>.0 .. <base>.{n_files-1}`.
    pub fn write_json(&self, base: &Path) -> Result<()> {
        for (k, positions) in self.files.iter().enumerate() {
            let path = file_path(base, k);
            let file = File::create(&path).map_err(|e| LensError::io(&path, e))?;
            let rec = SnapshotFileRef {
                header: &self.header,
                positions,
            };
            let mut w = BufWriter::new(file);
            serde_json::to_writer(&mut w, &rec)
                .map_err(|e| LensError::Snapshot(format!("{}: {}", path.display(), e)))?;
            w.flush().map_err(|e| LensError::io(&path, e))?;
        }
        Ok(())
    }
}

impl SnapshotSource for InMemorySnapshot {
    fn header(&self) -> Result<SnapshotHeader> {
        Ok(self.header)
    }

    fn read_positions(&self, file: usize) -> Result<Vec<[f32; 3]>> {
        self.files.get(file).cloned().ok_or_else(|| {
            LensError::Snapshot(format!(
                "sub-file {} requested from a snapshot with {} files",
                file,
                self.files.len()
            ))
        })
    }
}

#[derive(Serialize)]
struct SnapshotFileRef<'a> {
    header: &'a SnapshotHeader,
    positions: &'a [[f32; 3]],
}

#[derive(Deserialize)]
struct SnapshotFile {
    header: SnapshotHeader,
    positions: Vec<[f32; 3]>,
}

fn file_path(base: &Path, k: usize) -> PathBuf {
    let mut s = base.as_os_str().to_owned();
    s.push(format!(".{}", k));
    PathBuf::from(s)
}

/// Snapshot stored as `<base>.<k>` JSON files.
#[derive(Debug, Clone)]
pub struct JsonSnapshot {
    base: PathBuf,
}

impl JsonSnapshot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn load(&self, k: usize) -> Result<SnapshotFile> {
        let path = file_path(&self.base, k);
        let file = File::open(&path).map_err(|e| LensError::io(&path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| LensError::Snapshot(format!("{}: {}", path.display(), e)))
    }
}

impl SnapshotSource for JsonSnapshot {
    fn header(&self) -> Result<SnapshotHeader> {
        Ok(self.load(0)?.header)
    }

    fn read_positions(&self, file: usize) -> Result<Vec<[f32; 3]>> {
        Ok(self.load(file)?.positions)
    }
}

/// Snapshot base names, one per line; lines starting with '#' and blank
/// lines are skipped.
pub fn read_snapshot_list(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| LensError::io(path, e))?;
    let mut names = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| LensError::io(path, e))?;
        let line = line.trim_end();
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        names.push(line.to_string());
    }
    if names.is_empty() {
        return Err(LensError::EmptyCatalog);
    }
    Ok(names)
}

/// Catalog of JSON file sets named in a snapshot list.
#[derive(Debug, Clone)]
pub struct ListCatalog {
    names: Vec<String>,
}

impl ListCatalog {
    pub fn from_list(path: &Path) -> Result<Self> {
        let names = read_snapshot_list(path)?;
        // relative names are taken relative to the list's directory
        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let names = names
            .into_iter()
            .map(|n| {
                let p = Path::new(&n);
                if p.is_absolute() || dir.as_os_str().is_empty() {
                    n
                } else {
                    dir.join(p).to_string_lossy().into_owned()
                }
            })
            .collect();
        Ok(Self { names })
    }
}

impl SnapshotCatalog for ListCatalog {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn name(&self, idx: usize) -> String {
        self.names[idx].clone()
    }

    fn open(&self, idx: usize) -> Result<Box<dyn SnapshotSource + '_>> {
        let base = PathBuf::from(&self.names[idx]);
        if fs::metadata(file_path(&base, 0)).is_err() {
            return Err(LensError::Snapshot(format!(
                "snapshot {} has no file {}",
                self.names[idx],
                file_path(&base, 0).display()
            )));
        }
        Ok(Box::new(JsonSnapshot::new(base)))
    }
}

/// Catalog held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCatalog {
    entries: Vec<(String, InMemorySnapshot)>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, snap: InMemorySnapshot) {
        self.entries.push((name.into(), snap));
    }
}

impl SnapshotCatalog for InMemoryCatalog {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn name(&self, idx: usize) -> String {
        self.entries[idx].0.clone()
    }

    fn open(&self, idx: usize) -> Result<Box<dyn SnapshotSource + '_>> {
        match self.entries.get(idx) {
            Some((_, s)) => Ok(Box::new(s)),
            None => Err(LensError::Snapshot(format!(
                "catalog entry {} out of {}",
                idx,
                self.entries.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run_local;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("lenspot-{}-{}", tag, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn random_snapshot_is_inside_the_box() {
        let s = InMemorySnapshot::uniform_random(1000, 3, 50.0, 0.5, 7);
        let h = s.header().unwrap();
        assert_eq!(h.n_total, 1000);
        assert_eq!(h.n_files, 3);
        let mut n = 0;
        for f in 0..3 {
            for p in s.read_positions(f).unwrap() {
                assert!(p.iter().all(|&x| x >= 0.0 && (x as f64) < 50.0));
                n += 1;
            }
        }
        assert_eq!(n, 1000);
        assert!(s.read_positions(3).is_err());

        let again = InMemorySnapshot::uniform_random(1000, 3, 50.0, 0.5, 7);
        assert_eq!(again.read_positions(1).unwrap(), s.read_positions(1).unwrap());
    }

    #[test]
    fn header_broadcast_converts_units() {
        let snap = InMemorySnapshot::lattice(2, 1, 1000.0, 0.25);
        let out = run_local(3, |comm| broadcast_header(&comm, &snap, 1e-3).unwrap());
        for h in out {
            assert_eq!(h.n_total, 8);
            assert!((h.box_len - 1.0).abs() < 1e-12);
            assert_eq!(h.scale_factor, 0.25);
        }
    }

    #[test]
    fn json_file_set_roundtrips() {
        let dir = scratch_dir("json");
        let base = dir.join("snap_042");
        let snap = InMemorySnapshot::uniform_random(20, 2, 10.0, 0.8, 1);
        snap.write_json(&base).unwrap();

        let list = dir.join("snaps.txt");
        fs::write(&list, "# light cone\nsnap_042\n\n").unwrap();
        let cat = ListCatalog::from_list(&list).unwrap();
        assert_eq!(cat.len(), 1);
        let src = cat.open(0).unwrap();
        assert_eq!(src.header().unwrap(), snap.header().unwrap());
        assert_eq!(src.read_positions(1).unwrap(), snap.read_positions(1).unwrap());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn list_skips_comments_and_rejects_empty() {
        let dir = scratch_dir("list");
        let p = dir.join("a.txt");
        fs::write(&p, "#x\n/abs/one\ntwo\n# y\n").unwrap();
        assert_eq!(read_snapshot_list(&p).unwrap(), vec!["/abs/one", "two"]);
        fs::write(&p, "# nothing\n").unwrap();
        assert!(matches!(read_snapshot_list(&p), Err(LensError::EmptyCatalog)));
        fs::remove_dir_all(&dir).ok();
    }
}
