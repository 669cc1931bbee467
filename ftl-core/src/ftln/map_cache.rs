//! Fixed-capacity write-back map-page cache.
//!
//! Arena + indices: every slot lives in a flat
//! `Vec`, and the LRU order is an intrusive doubly-linked list of indices
//! through that vec, MRU at `head`.

use crate::error::FtlResult;
use std::collections::HashMap;

struct Entry {
    mpn: u32,
    dirty: bool,
    data: Vec<u8>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Callbacks the cache uses to actually move pages to/from NAND. Kept as a
/// trait so `MapCache` stays ignorant of `Ndm`/driver generics.
pub trait MapPageIo {
    fn write_map_page(&mut self, mpn: u32, data: &[u8]) -> FtlResult<()>;
    /// `Ok(true)` if `data` was filled from an existing copy; `Ok(false)` if
    /// `mpn` has never been written (caller should leave it as all-unmapped).
    fn read_map_page(&mut self, mpn: u32, data: &mut [u8]) -> FtlResult<bool>;
}

pub struct MapCache {
    entries: Vec<Entry>,
    index: HashMap<u32, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    num_dirty: usize,
    page_size: usize,
}

impl MapCache {
    pub fn new(capacity: usize, page_size: usize) -> Self {
        MapCache {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            num_dirty: 0,
            page_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity().max(self.entries.len())
    }

    pub fn num_dirty(&self) -> usize {
        self.num_dirty
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.entries[slot].prev, self.entries[slot].next);
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
        self.entries[slot].prev = None;
        self.entries[slot].next = None;
    }

    fn push_front(&mut self, slot: usize) {
        self.entries[slot].prev = None;
        self.entries[slot].next = self.head;
        if let Some(h) = self.head {
            self.entries[h].prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn touch_mru(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }

    /// Ensure `mpn` is resident and return its slot index, loading it
    /// (evicting an LRU victim if the cache is full) if necessary. If
    /// `for_write`, marks the entry dirty once loaded/found.
    pub fn access(
        &mut self,
        mpn: u32,
        for_write: bool,
        io: &mut dyn MapPageIo,
    ) -> FtlResult<usize> {
        if let Some(&slot) = self.index.get(&mpn) {
            self.touch_mru(slot);
            if for_write && !self.entries[slot].dirty {
                self.entries[slot].dirty = true;
                self.num_dirty += 1;
            }
            return Ok(slot);
        }

        let slot = if self.entries.len() < self.entries.capacity() {
            let data = vec![0xFFu8; self.page_size];
            self.entries.push(Entry {
                mpn,
                dirty: false,
                data,
                prev: None,
                next: None,
            });
            self.entries.len() - 1
        } else {
            let victim = self.pick_victim(io)?;
            self.index.remove(&self.entries[victim].mpn);
            self.unlink(victim);
            victim
        };

        let found = io.read_map_page(mpn, &mut self.entries[slot].data)?;
        if !found {
            self.entries[slot].data.fill(0xFF);
        }
        self.entries[slot].mpn = mpn;
        self.entries[slot].dirty = for_write;
        if for_write {
            self.num_dirty += 1;
        }
        self.index.insert(mpn, slot);
        self.push_front(slot);
        Ok(slot)
    }

    /// Walk LRU -> MRU, preferring the oldest clean entry; if all are dirty,
    /// flush the oldest dirty one and reuse its slot.
    fn pick_victim(&mut self, io: &mut dyn MapPageIo) -> FtlResult<usize> {
        let mut cursor = self.tail;
        let mut first_dirty = None;
        while let Some(slot) = cursor {
            if !self.entries[slot].dirty {
                return Ok(slot);
            }
            if first_dirty.is_none() {
                first_dirty = Some(slot);
            }
            cursor = self.entries[slot].prev;
        }
        let victim = first_dirty.expect("nonempty full cache always has a tail");
        self.flush_slot(victim, io)?;
        Ok(victim)
    }

    fn flush_slot(&mut self, slot: usize, io: &mut dyn MapPageIo) -> FtlResult<()> {
        if self.entries[slot].dirty {
            io.write_map_page(self.entries[slot].mpn, &self.entries[slot].data)?;
            self.entries[slot].dirty = false;
            self.num_dirty -= 1;
        }
        Ok(())
    }

    pub fn data(&self, slot: usize) -> &[u8] {
        &self.entries[slot].data
    }

    pub fn data_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.entries[slot].data
    }

    pub fn mark_dirty(&mut self, slot: usize) {
        if !self.entries[slot].dirty {
            self.entries[slot].dirty = true;
            self.num_dirty += 1;
        }
    }

    /// Flush every dirty entry, MRU-first (matches `flush-all`'s ordering in
    /// the reference, which is otherwise unobserved by callers).
    pub fn flush_all(&mut self, io: &mut dyn MapPageIo) -> FtlResult<()> {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            self.flush_slot(slot, io)?;
            cursor = self.entries[slot].next;
        }
        Ok(())
    }

    /// If `mpn` is resident and dirty, flush just that one entry.
    pub fn flush_one(&mut self, mpn: u32, io: &mut dyn MapPageIo) -> FtlResult<()> {
        if let Some(&slot) = self.index.get(&mpn) {
            self.flush_slot(slot, io)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeIo {
        written: Vec<(u32, Vec<u8>)>,
    }

    impl MapPageIo for FakeIo {
        fn write_map_page(&mut self, mpn: u32, data: &[u8]) -> FtlResult<()> {
            self.written.push((mpn, data.to_vec()));
            Ok(())
        }
        fn read_map_page(&mut self, _mpn: u32, _data: &mut [u8]) -> FtlResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn lru_evicts_clean_before_dirty() {
        let mut cache = MapCache::new(2, 16);
        let mut io = FakeIo { written: Vec::new() };
        cache.access(1, false, &mut io).unwrap();
        cache.access(2, true, &mut io).unwrap();
        // 1 is clean (LRU), 2 is dirty (MRU). Miss on 3 should evict 1, not 2.
        let slot3 = cache.access(3, false, &mut io).unwrap();
        assert_eq!(cache.num_dirty(), 1);
        assert!(io.written.is_empty());
        assert_eq!(cache.data(slot3).len(), 16);
    }

    #[test]
    fn evicting_all_dirty_flushes_oldest() {
        let mut cache = MapCache::new(1, 16);
        let mut io = FakeIo { written: Vec::new() };
        let slot = cache.access(1, true, &mut io).unwrap();
        cache.data_mut(slot)[0] = 0xAB;
        cache.access(2, false, &mut io).unwrap();
        assert_eq!(io.written.len(), 1);
        assert_eq!(io.written[0].0, 1);
        assert_eq!(cache.num_dirty(), 0);
    }

    #[test]
    fn write_hit_marks_dirty_once() {
        let mut cache = MapCache::new(2, 16);
        let mut io = FakeIo { written: Vec::new() };
        cache.access(1, false, &mut io).unwrap();
        assert_eq!(cache.num_dirty(), 0);
        cache.access(1, true, &mut io).unwrap();
        assert_eq!(cache.num_dirty(), 1);
        cache.access(1, true, &mut io).unwrap();
        assert_eq!(cache.num_dirty(), 1);
    }
}
