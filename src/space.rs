//! Region-partitioned heap space.
//!
//! The heap is a set of fixed-size [`HeapRegion`]s, each owned exclusively by
//! the allocator and mutated only during allocation and collection.
//! Allocation is bump-pointer within a region when possible and falls back to
//! first-fit free-list search once sweeping has fragmented a region.

use bit_vec::BitVec;

use crate::generation::Generation;
use crate::object::ObjectId;

/// Allocation granule. Every size is rounded up to a multiple of this.
pub const MIN_ALLOCATION: usize = 4;

/// Rounds `value` up to the nearest multiple of `align`.
pub(crate) fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }
    (value + align - 1) / align * align
}

/// Contiguous block of abstract heap memory.
pub struct HeapRegion {
    id: usize,
    generation: Option<Generation>,
    capacity: usize,
    top: usize,
    used: usize,
    free_list: Vec<(usize, usize)>,
    live_bits: BitVec,
    members: Vec<ObjectId>,
    evacuating: bool,
}

impl HeapRegion {
    fn new(id: usize, generation: Option<Generation>, capacity: usize) -> Self {
        Self {
            id,
            generation,
            capacity,
            top: 0,
            used: 0,
            free_list: Vec::new(),
            live_bits: BitVec::from_elem(capacity / MIN_ALLOCATION, false),
            members: Vec::new(),
            evacuating: false,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn generation(&self) -> Option<Generation> {
        self.generation
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free_list_bytes(&self) -> usize {
        self.free_list.iter().map(|&(_, len)| len).sum()
    }

    pub(crate) fn members(&self) -> &[ObjectId] {
        &self.members
    }

    fn free_list_allocate(&mut self, size: usize) -> Option<usize> {
        let index = self.free_list.iter().position(|&(_, len)| len >= size)?;
        let (offset, len) = self.free_list[index];
        if len == size {
            self.free_list.swap_remove(index);
        } else {
            self.free_list[index] = (offset + size, len - size);
        }
        self.commit(offset, size);
        Some(offset)
    }

    fn bump_allocate(&mut self, size: usize) -> Option<usize> {
        if self.top + size > self.capacity {
            return None;
        }
        let offset = self.top;
        self.top += size;
        self.commit(offset, size);
        Some(offset)
    }

    fn commit(&mut self, offset: usize, size: usize) {
        self.used += size;
        for granule in offset / MIN_ALLOCATION..(offset + size) / MIN_ALLOCATION {
            self.live_bits.set(granule, true);
        }
    }

    /// Returns bytes at `offset` to the free list. `false` means the span was
    /// not fully allocated, which the caller treats as graph corruption.
    pub(crate) fn free(&mut self, offset: usize, size: usize) -> bool {
        if offset + size > self.capacity {
            return false;
        }
        let granules = offset / MIN_ALLOCATION..(offset + size) / MIN_ALLOCATION;
        for granule in granules.clone() {
            if !self.live_bits.get(granule).unwrap_or(false) {
                return false;
            }
        }
        for granule in granules {
            self.live_bits.set(granule, false);
        }
        self.used -= size;
        self.free_list.push((offset, size));
        true
    }

    /// Commits a placement computed outside the allocator (parallel
    /// compaction workers bump inside pre-reserved regions).
    pub(crate) fn place_at(&mut self, offset: usize, size: usize) {
        debug_assert!(offset + size <= self.capacity);
        self.top = self.top.max(offset + size);
        self.commit(offset, size);
    }

    /// Merges adjacent free spans and rolls the bump cursor back over a free
    /// tail so bump allocation recovers after sweeping.
    pub(crate) fn coalesce(&mut self) {
        if self.free_list.is_empty() {
            return;
        }
        self.free_list.sort_unstable();
        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(self.free_list.len());
        for &(offset, len) in self.free_list.iter() {
            match merged.last_mut() {
                Some((last_offset, last_len)) if *last_offset + *last_len == offset => {
                    *last_len += len;
                }
                _ => merged.push((offset, len)),
            }
        }
        if let Some(&(offset, len)) = merged.last() {
            if offset + len == self.top {
                self.top = offset;
                merged.pop();
            }
        }
        self.free_list = merged;
    }

    pub(crate) fn reset(&mut self) {
        self.top = 0;
        self.used = 0;
        self.free_list.clear();
        self.live_bits.clear();
        self.members.clear();
        self.evacuating = false;
    }
}

/// The full region set for one heap, partitioned by generation tag for the
/// generational strategies or left untagged for the uniform ones.
pub struct RegionSpace {
    region_size: usize,
    regions: Vec<HeapRegion>,
}

impl RegionSpace {
    pub(crate) fn generational(
        young_capacity: usize,
        old_capacity: usize,
        region_size: usize,
    ) -> Self {
        let mut space = Self {
            region_size,
            regions: Vec::new(),
        };
        space.carve(Some(Generation::Young), young_capacity);
        space.carve(Some(Generation::Old), old_capacity);
        space
    }

    pub(crate) fn uniform(capacity: usize, region_size: usize) -> Self {
        let mut space = Self {
            region_size,
            regions: Vec::new(),
        };
        space.carve(None, capacity);
        space
    }

    fn carve(&mut self, generation: Option<Generation>, capacity: usize) {
        let mut remaining = capacity;
        while remaining > 0 {
            let size = remaining.min(self.region_size);
            let id = self.regions.len();
            self.regions.push(HeapRegion::new(id, generation, size));
            remaining -= size;
        }
    }

    pub(crate) fn allocate(
        &mut self,
        generation: Option<Generation>,
        size: usize,
    ) -> Option<(usize, usize)> {
        // Bump allocation everywhere first; the free lists only exist after a
        // non-moving sweep and are the slower path.
        for region in self.regions.iter_mut() {
            if region.generation != generation || region.evacuating {
                continue;
            }
            if let Some(offset) = region.bump_allocate(size) {
                return Some((region.id, offset));
            }
        }
        for region in self.regions.iter_mut() {
            if region.generation != generation || region.evacuating {
                continue;
            }
            if let Some(offset) = region.free_list_allocate(size) {
                return Some((region.id, offset));
            }
        }
        None
    }

    pub(crate) fn note_member(&mut self, region: usize, id: ObjectId) {
        self.regions[region].members.push(id);
    }

    pub(crate) fn place_at(&mut self, region: usize, offset: usize, size: usize) {
        self.regions[region].place_at(offset, size);
    }

    /// Region ids carrying the given generation tag, in id order.
    pub(crate) fn region_ids(&self, generation: Option<Generation>) -> Vec<usize> {
        self.regions
            .iter()
            .filter(|r| r.generation == generation)
            .map(|r| r.id)
            .collect()
    }

    pub(crate) fn free(&mut self, region: usize, offset: usize, size: usize) -> bool {
        match self.regions.get_mut(region) {
            Some(region) => region.free(offset, size),
            None => false,
        }
    }

    pub(crate) fn set_evacuating(&mut self, region: usize, evacuating: bool) {
        self.regions[region].evacuating = evacuating;
    }

    pub(crate) fn reset_region(&mut self, region: usize) {
        self.regions[region].reset();
    }

    pub(crate) fn reset_generation(&mut self, generation: Option<Generation>) {
        for region in self.regions.iter_mut() {
            if region.generation == generation {
                region.reset();
            }
        }
    }

    pub(crate) fn coalesce(&mut self) {
        for region in self.regions.iter_mut() {
            region.coalesce();
        }
    }

    pub fn region(&self, id: usize) -> &HeapRegion {
        &self.regions[id]
    }

    pub fn regions(&self) -> &[HeapRegion] {
        &self.regions
    }

    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn used_bytes(&self) -> usize {
        self.regions.iter().map(|r| r.used).sum()
    }

    pub fn capacity(&self) -> usize {
        self.regions.iter().map(|r| r.capacity).sum()
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity() - self.used_bytes()
    }

    pub fn occupancy(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.used_bytes() as f64 / capacity as f64
    }

    pub fn used_in(&self, generation: Option<Generation>) -> usize {
        self.regions
            .iter()
            .filter(|r| r.generation == generation)
            .map(|r| r.used)
            .sum()
    }

    pub fn capacity_in(&self, generation: Option<Generation>) -> usize {
        self.regions
            .iter()
            .filter(|r| r.generation == generation)
            .map(|r| r.capacity)
            .sum()
    }

    /// Free-list bytes as a fraction of capacity. Grows as non-moving sweeps
    /// punch holes into regions; compared against the escalation threshold by
    /// the concurrent mark-sweep strategy.
    pub fn fragmentation(&self) -> f64 {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0.0;
        }
        self.regions
            .iter()
            .map(|r| r.free_list_bytes())
            .sum::<usize>() as f64
            / capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_then_free_list() {
        let mut space = RegionSpace::uniform(64, 64);
        let (r0, a) = space.allocate(None, 32).unwrap();
        let (_, b) = space.allocate(None, 32).unwrap();
        assert_eq!((a, b), (0, 32));
        assert!(space.allocate(None, 4).is_none());
        assert!(space.free(r0, a, 32));
        // bump cursor is exhausted, the hole must be found by first-fit
        let (_, c) = space.allocate(None, 16).unwrap();
        assert_eq!(c, 0);
        assert_eq!(space.used_bytes(), 48);
    }

    #[test]
    fn double_free_is_rejected() {
        let mut space = RegionSpace::uniform(64, 64);
        let (r0, a) = space.allocate(None, 16).unwrap();
        assert!(space.free(r0, a, 16));
        assert!(!space.free(r0, a, 16));
    }

    #[test]
    fn coalesce_recovers_bump_space() {
        let mut space = RegionSpace::uniform(96, 96);
        let (r0, _a) = space.allocate(None, 32).unwrap();
        let (_, b) = space.allocate(None, 32).unwrap();
        let (_, c) = space.allocate(None, 32).unwrap();
        assert!(space.free(r0, b, 32));
        assert!(space.free(r0, c, 32));
        space.coalesce();
        // freed tail rolled back into bump space, one 64-byte span available
        let (_, d) = space.allocate(None, 64).unwrap();
        assert_eq!(d, 32);
    }

    #[test]
    fn generational_partitioning() {
        let space = RegionSpace::generational(128, 256, 64);
        assert_eq!(space.region_count(), 6);
        assert_eq!(space.capacity_in(Some(Generation::Young)), 128);
        assert_eq!(space.capacity_in(Some(Generation::Old)), 256);
    }
}
