//! Chunk records held in the selector's registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hobj_types::{ChunkNum, DevId};
use serde::{Deserialize, Serialize};

/// A fixed-capacity allocation unit on one physical device.
///
/// The registry owns every `Chunk`; heaps, PG maps and the defrag index refer
/// to it only by [`ChunkNum`]. Occupancy fields are atomic so that lookups
/// under the registry read lock can observe them.
#[derive(Debug)]
pub struct Chunk {
    chunk_num: ChunkNum,
    pdev_id: DevId,
    total_blks: u64,
    available_blks: AtomicU64,
    defrag_blks: AtomicU64,
    busy: AtomicBool,
}

/// Point-in-time copy of a chunk's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_num: ChunkNum,
    pub pdev_id: DevId,
    pub total_blks: u64,
    pub available_blks: u64,
    pub defrag_blks: u64,
    pub busy: bool,
}

impl Chunk {
    pub fn new(
        chunk_num: ChunkNum,
        pdev_id: DevId,
        total_blks: u64,
        available_blks: u64,
        defrag_blks: u64,
    ) -> Self {
        let available_blks = available_blks.min(total_blks);
        let defrag_blks = defrag_blks.min(total_blks - available_blks);
        Self {
            chunk_num,
            pdev_id,
            total_blks,
            available_blks: AtomicU64::new(available_blks),
            defrag_blks: AtomicU64::new(defrag_blks),
            busy: AtomicBool::new(false),
        }
    }

    pub fn chunk_num(&self) -> ChunkNum {
        self.chunk_num
    }

    pub fn pdev_id(&self) -> DevId {
        self.pdev_id
    }

    pub fn total_blks(&self) -> u64 {
        self.total_blks
    }

    pub fn available_blks(&self) -> u64 {
        self.available_blks.load(Ordering::Acquire)
    }

    pub fn defrag_blks(&self) -> u64 {
        self.defrag_blks.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn info(&self) -> ChunkInfo {
        ChunkInfo {
            chunk_num: self.chunk_num,
            pdev_id: self.pdev_id,
            total_blks: self.total_blks,
            available_blks: self.available_blks(),
            defrag_blks: self.defrag_blks(),
            busy: self.is_busy(),
        }
    }

    /// Flip idle -> busy. Returns false if the chunk was already busy.
    pub(crate) fn try_mark_busy(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Flip busy -> idle. Returns false if the chunk was not busy.
    pub(crate) fn try_mark_idle(&self) -> bool {
        self.busy
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consume `nblks` available blocks. Returns the remaining count, or
    /// `None` (leaving the chunk untouched) if they do not fit.
    pub(crate) fn consume(&self, nblks: u64) -> Option<u64> {
        self.available_blks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |avail| {
                avail.checked_sub(nblks)
            })
            .ok()
            .map(|prev| prev - nblks)
    }

    /// Mark up to `nblks` used blocks as stale. Returns the new defrag count.
    pub(crate) fn add_defrag(&self, nblks: u64) -> u64 {
        let used = self.total_blks - self.available_blks();
        let mut updated = 0;
        let _ = self
            .defrag_blks
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |defrag| {
                updated = defrag.saturating_add(nblks).min(used);
                Some(updated)
            });
        updated
    }

    /// Return the chunk to its pristine state after GC moved its live data
    /// away. Returns the number of blocks that became available.
    pub(crate) fn reset(&self) -> u64 {
        let prev = self.available_blks.swap(self.total_blks, Ordering::AcqRel);
        self.defrag_blks.store(0, Ordering::Release);
        self.total_blks - prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(avail: u64) -> Chunk {
        Chunk::new(ChunkNum(1), DevId(0), 100, avail, 0)
    }

    #[test]
    fn test_new_clamps_counts() {
        let c = Chunk::new(ChunkNum(1), DevId(0), 100, 150, 10);
        assert_eq!(c.available_blks(), 100);
        assert_eq!(c.defrag_blks(), 0);

        let c = Chunk::new(ChunkNum(2), DevId(0), 100, 60, 70);
        assert_eq!(c.defrag_blks(), 40);
    }

    #[test]
    fn test_busy_transitions() {
        let c = chunk(100);
        assert!(!c.is_busy());
        assert!(c.try_mark_busy());
        assert!(!c.try_mark_busy());
        assert!(c.try_mark_idle());
        assert!(!c.try_mark_idle());
    }

    #[test]
    fn test_consume() {
        let c = chunk(100);
        assert_eq!(c.consume(30), Some(70));
        assert_eq!(c.consume(71), None);
        assert_eq!(c.available_blks(), 70);
        assert_eq!(c.consume(70), Some(0));
    }

    #[test]
    fn test_add_defrag_bounded_by_used() {
        let c = chunk(100);
        c.consume(20);
        assert_eq!(c.add_defrag(5), 5);
        assert_eq!(c.add_defrag(50), 20);
        assert_eq!(c.defrag_blks(), 20);
    }

    #[test]
    fn test_reset() {
        let c = chunk(100);
        c.consume(60);
        c.add_defrag(40);
        assert_eq!(c.reset(), 60);
        assert_eq!(c.available_blks(), 100);
        assert_eq!(c.defrag_blks(), 0);
    }

    #[test]
    fn test_info_snapshot() {
        let c = Chunk::new(ChunkNum(9), DevId(2), 100, 80, 5);
        c.try_mark_busy();
        let info = c.info();
        assert_eq!(info.chunk_num, ChunkNum(9));
        assert_eq!(info.pdev_id, DevId(2));
        assert_eq!(info.total_blks, 100);
        assert_eq!(info.available_blks, 80);
        assert_eq!(info.defrag_blks, 5);
        assert!(info.busy);
    }
}
