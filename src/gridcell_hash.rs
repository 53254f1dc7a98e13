// src/gridcell_hash.rs
//
// Sparse storage for an arbitrary, data-dependent subset of a periodic grid.
//
// Cells live in a dense `Vec<GridCell>` (the "slots"); an open-addressed,
// power-of-two index table maps a linear grid id to its slot. After
// `sort_by_id` the slot array is in ascending id order, which is what the
// pairwise exchange relies on to find the contiguous run owned by each rank.

use bytemuck::{Pod, Zeroable};

/// One grid vertex value, keyed by its linear id.
///
/// `#[repr(C)]` + Pod so that runs of cells can be shipped between ranks as bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GridCell {
    pub id: i64,
    pub val: f64,
}

impl GridCell {
    pub fn new(id: i64, val: f64) -> Self {
        Self { id, val }
    }
}

const EMPTY: u32 = u32::MAX;
const MIN_TABLE: usize = 64;

#[derive(Debug, Clone)]
pub struct GridCellHash {
    table: Vec<u32>,
    cells: Vec<GridCell>,
}

impl Default for GridCellHash {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn hash_id(id: i64) -> u64 {
    // splitmix64 finaliser
    let mut z = (id as u64).wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Smallest power-of-two table that keeps the load factor at or below 1/2.
#[inline]
fn table_size_for(n: usize) -> usize {
    (2 * n).next_power_of_two().max(MIN_TABLE)
}

impl GridCellHash {
    pub fn new() -> Self {
        Self {
            table: vec![EMPTY; MIN_TABLE],
            cells: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[GridCell] {
        &self.cells
    }

    /// Mutable access to values. Ids must not be changed through this slice.
    pub fn cells_mut(&mut self) -> &mut [GridCell] {
        &mut self.cells
    }

    /// Probe for `id`: Ok(slot) if present, Err(table position) of the empty
    /// bucket where it would go.
    #[inline]
    fn probe(&self, id: i64) -> Result<usize, usize> {
        let mask = self.table.len() - 1;
        let mut pos = (hash_id(id) as usize) & mask;
        loop {
            let slot = self.table[pos];
            if slot == EMPTY {
                return Err(pos);
            }
            if self.cells[slot as usize].id == id {
                return Ok(slot as usize);
            }
            pos = (pos + 1) & mask;
        }
    }

    /// Slot of `id`, inserting a zero-valued cell if it is not present yet.
    pub fn get_or_insert(&mut self, id: i64) -> usize {
        match self.probe(id) {
            Ok(slot) => slot,
            Err(mut pos) => {
                if 2 * (self.cells.len() + 1) > self.table.len() {
                    self.rebuild_index(table_size_for(self.cells.len() + 1));
                    pos = match self.probe(id) {
                        Err(p) => p,
                        Ok(_) => unreachable!("id appeared during rehash"),
                    };
                }
                let slot = self.cells.len();
                assert!(slot < EMPTY as usize, "GridCellHash: too many cells");
                self.cells.push(GridCell::new(id, 0.0));
                self.table[pos] = slot as u32;
                slot
            }
        }
    }

    /// Slot of `id` if present. Never inserts.
    #[inline]
    pub fn get_existing(&self, id: i64) -> Option<usize> {
        self.probe(id).ok()
    }

    /// Convenience: value stored for `id`, if present.
    #[inline]
    pub fn value(&self, id: i64) -> Option<f64> {
        self.get_existing(id).map(|s| self.cells[s].val)
    }

    /// Add `w` to the value of `id`, inserting it first if needed.
    #[inline]
    pub fn accumulate(&mut self, id: i64, w: f64) {
        let slot = self.get_or_insert(id);
        self.cells[slot].val += w;
    }

    /// Reorder slots by ascending id and rebuild the index so lookups stay valid.
    pub fn sort_by_id(&mut self) {
        self.cells.sort_by_key(|c| c.id);
        self.rebuild_index(self.table.len());
    }

    /// Release spare capacity and shrink the index to the smallest legal size.
    pub fn shrink_to_fit(&mut self) {
        self.cells.shrink_to_fit();
        self.rebuild_index(table_size_for(self.cells.len()));
        self.table.shrink_to_fit();
    }

    /// Sort and hand back the bare cell array, dropping the index.
    pub fn into_sorted_cells(mut self) -> Vec<GridCell> {
        self.cells.sort_by_key(|c| c.id);
        self.cells
    }

    fn rebuild_index(&mut self, size: usize) {
        debug_assert!(size.is_power_of_two());
        self.table.clear();
        self.table.resize(size, EMPTY);
        let mask = size - 1;
        for (slot, c) in self.cells.iter().enumerate() {
            let mut pos = (hash_id(c.id) as usize) & mask;
            while self.table[pos] != EMPTY {
                pos = (pos + 1) & mask;
            }
            self.table[pos] = slot as u32;
        }
    }
}
