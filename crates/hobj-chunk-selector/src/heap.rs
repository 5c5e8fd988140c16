//! Max-priority queues over chunk keys.
//!
//! [`ChunkPriorityQueue`] is generic over the key it orders by; the selector
//! uses it twice, once keyed on available blocks for allocation and once keyed
//! on defragmentable blocks for GC. The key is captured when a chunk is
//! pushed, so a chunk's key must not change while it sits in a queue without
//! being re-pushed.
//!
//! [`ChunkHeap`] wraps an available-blocks queue in a mutex together with a
//! cached available-block counter. The counter is only ever modified through
//! [`LockedChunkHeap`], inside the same critical section as the queue, so
//! it always equals the sum of the member keys once the lock is released.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use hobj_types::ChunkNum;
use parking_lot::{Mutex, MutexGuard};

use crate::chunk::Chunk;

/// Extracts the ordering key of a chunk.
pub trait HeapKey {
    fn key(chunk: &Chunk) -> u64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ByAvailableBlks;

impl HeapKey for ByAvailableBlks {
    fn key(chunk: &Chunk) -> u64 {
        chunk.available_blks()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ByDefragBlks;

impl HeapKey for ByDefragBlks {
    fn key(chunk: &Chunk) -> u64 {
        chunk.defrag_blks()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    key: u64,
    chunk: ChunkNum,
}

impl Ord for Entry {
    // Larger key first; on ties the smaller chunk number wins so that
    // selection order is deterministic.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.chunk.cmp(&self.chunk))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPriorityQueue<K> {
    entries: BinaryHeap<Entry>,
    _key: PhantomData<fn() -> K>,
}

/// Allocation queue: the top is the chunk with the most available blocks.
pub type VChunkHeap = ChunkPriorityQueue<ByAvailableBlks>;
/// GC queue: the top is the chunk with the most defragmentable blocks.
pub type DefragHeap = ChunkPriorityQueue<ByDefragBlks>;

impl<K> Default for ChunkPriorityQueue<K> {
    fn default() -> Self {
        Self {
            entries: BinaryHeap::new(),
            _key: PhantomData,
        }
    }
}

impl<K: HeapKey> ChunkPriorityQueue<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `chunk` keyed on its current value. Returns the captured key.
    pub fn push(&mut self, chunk: &Chunk) -> u64 {
        let key = K::key(chunk);
        self.entries.push(Entry {
            key,
            chunk: chunk.chunk_num(),
        });
        key
    }

    pub fn pop(&mut self) -> Option<(ChunkNum, u64)> {
        self.entries.pop().map(|e| (e.chunk, e.key))
    }

    pub fn peek(&self) -> Option<(ChunkNum, u64)> {
        self.entries.peek().map(|e| (e.chunk, e.key))
    }

    /// Remove a specific chunk regardless of its rank. O(n).
    pub fn remove(&mut self, chunk: ChunkNum) -> Option<u64> {
        let key = self.entries.iter().find(|e| e.chunk == chunk)?.key;
        self.entries.retain(|e| e.chunk != chunk);
        Some(key)
    }

    pub fn contains(&self, chunk: ChunkNum) -> bool {
        self.entries.iter().any(|e| e.chunk == chunk)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Members with their captured keys, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (ChunkNum, u64)> + '_ {
        self.entries.iter().map(|e| (e.chunk, e.key))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The idle pool of one device or one PG.
#[derive(Debug, Default)]
pub struct ChunkHeap {
    heap: Mutex<VChunkHeap>,
    available_blk_count: AtomicU64,
    // Grows only while chunks are being registered at boot.
    total_blks: AtomicU64,
}

impl ChunkHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_total_blks(total_blks: u64) -> Self {
        Self {
            total_blks: AtomicU64::new(total_blks),
            ..Self::default()
        }
    }

    pub fn lock(&self) -> LockedChunkHeap<'_> {
        LockedChunkHeap {
            heap: self.heap.lock(),
            available_blk_count: &self.available_blk_count,
        }
    }

    /// Cached sum of available blocks over idle members. May lag a
    /// concurrent push/pop by one critical section.
    pub fn available_blks(&self) -> u64 {
        self.available_blk_count.load(Ordering::Acquire)
    }

    pub fn total_blks(&self) -> u64 {
        self.total_blks.load(Ordering::Acquire)
    }

    pub(crate) fn add_total_blks(&self, nblks: u64) {
        self.total_blks.fetch_add(nblks, Ordering::AcqRel);
    }

    pub fn size(&self) -> usize {
        self.heap.lock().len()
    }
}

/// Exclusive access to a [`ChunkHeap`]; keeps the cached counter in step with
/// every mutation.
pub struct LockedChunkHeap<'a> {
    heap: MutexGuard<'a, VChunkHeap>,
    available_blk_count: &'a AtomicU64,
}

impl LockedChunkHeap<'_> {
    pub fn push(&mut self, chunk: &Chunk) {
        let key = self.heap.push(chunk);
        self.available_blk_count.fetch_add(key, Ordering::AcqRel);
    }

    pub fn pop(&mut self) -> Option<(ChunkNum, u64)> {
        let (chunk, key) = self.heap.pop()?;
        self.available_blk_count.fetch_sub(key, Ordering::AcqRel);
        Some((chunk, key))
    }

    /// Pop the top only if it has at least `nblks` available blocks.
    pub fn pop_if_fits(&mut self, nblks: u64) -> Option<(ChunkNum, u64)> {
        match self.heap.peek() {
            Some((_, key)) if key >= nblks => self.pop(),
            _ => None,
        }
    }

    pub fn peek(&self) -> Option<(ChunkNum, u64)> {
        self.heap.peek()
    }

    pub fn remove(&mut self, chunk: ChunkNum) -> Option<u64> {
        let key = self.heap.remove(chunk)?;
        self.available_blk_count.fetch_sub(key, Ordering::AcqRel);
        Some(key)
    }

    pub fn contains(&self, chunk: ChunkNum) -> bool {
        self.heap.contains(chunk)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = (ChunkNum, u64)> + '_ {
        self.heap.iter()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        self.available_blk_count.store(0, Ordering::Release);
    }

    /// Sum of member keys, recomputed from the queue itself.
    pub fn recount(&self) -> u64 {
        self.heap.iter().map(|(_, key)| key).sum()
    }

    /// The cached counter, read under the lock.
    pub fn cached_available_blks(&self) -> u64 {
        self.available_blk_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hobj_types::DevId;

    fn chunk(n: u16, avail: u64, defrag: u64) -> Chunk {
        Chunk::new(ChunkNum(n), DevId(0), 100, avail, defrag)
    }

    #[test]
    fn test_pop_order_by_available() {
        let chunks = [chunk(1, 60, 0), chunk(2, 100, 0), chunk(3, 80, 0)];
        let mut q = VChunkHeap::new();
        for c in &chunks {
            q.push(c);
        }
        assert_eq!(q.pop(), Some((ChunkNum(2), 100)));
        assert_eq!(q.peek(), Some((ChunkNum(3), 80)));
        assert_eq!(q.pop(), Some((ChunkNum(3), 80)));
        assert_eq!(q.pop(), Some((ChunkNum(1), 60)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_ties_prefer_smaller_chunk() {
        let chunks = [chunk(7, 50, 0), chunk(3, 50, 0), chunk(5, 50, 0)];
        let mut q = VChunkHeap::new();
        for c in &chunks {
            q.push(c);
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pop().map(|(c, _)| c)).collect();
        assert_eq!(order, vec![ChunkNum(3), ChunkNum(5), ChunkNum(7)]);
    }

    #[test]
    fn test_defrag_ordering() {
        // Defrag counts are clamped to used blocks, so leave room for them.
        let chunks = [chunk(1, 50, 5), chunk(2, 50, 40), chunk(3, 50, 12)];
        let mut q = DefragHeap::new();
        for c in &chunks {
            q.push(c);
        }
        assert_eq!(q.pop(), Some((ChunkNum(2), 40)));
        assert_eq!(q.pop(), Some((ChunkNum(3), 12)));
    }

    #[test]
    fn test_remove_specific() {
        let chunks = [chunk(1, 10, 0), chunk(2, 20, 0), chunk(3, 30, 0)];
        let mut q = VChunkHeap::new();
        for c in &chunks {
            q.push(c);
        }
        assert_eq!(q.remove(ChunkNum(2)), Some(20));
        assert_eq!(q.remove(ChunkNum(2)), None);
        assert!(!q.contains(ChunkNum(2)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some((ChunkNum(3), 30)));
    }

    #[test]
    fn test_chunk_heap_counter_follows_mutations() {
        let chunks = [chunk(1, 100, 0), chunk(2, 80, 0), chunk(3, 60, 0)];
        let heap = ChunkHeap::with_total_blks(300);
        {
            let mut h = heap.lock();
            for c in &chunks {
                h.push(c);
            }
            assert_eq!(h.cached_available_blks(), h.recount());
        }
        assert_eq!(heap.available_blks(), 240);
        assert_eq!(heap.total_blks(), 300);

        assert_eq!(heap.lock().pop(), Some((ChunkNum(1), 100)));
        assert_eq!(heap.available_blks(), 140);

        assert_eq!(heap.lock().remove(ChunkNum(3)), Some(60));
        assert_eq!(heap.available_blks(), 80);
        assert_eq!(heap.size(), 1);

        heap.lock().clear();
        assert_eq!(heap.available_blks(), 0);
        assert_eq!(heap.size(), 0);
    }

    #[test]
    fn test_pop_if_fits() {
        let c = chunk(1, 30, 0);
        let heap = ChunkHeap::new();
        heap.lock().push(&c);
        assert_eq!(heap.lock().pop_if_fits(31), None);
        assert_eq!(heap.size(), 1);
        assert_eq!(heap.lock().pop_if_fits(30), Some((ChunkNum(1), 30)));
        assert_eq!(heap.lock().pop_if_fits(0), None);
    }
}
