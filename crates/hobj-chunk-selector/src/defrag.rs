//! Defrag index used by garbage collection.
//!
//! Chunks whose defragmentable block count exceeds `defrag_min_blks` are kept
//! in a max-heap keyed on that count. The index is only advisory: GC pops a
//! candidate, then claims it through [`HeapChunkSelector::select_specific_chunk`]
//! before touching it, so a stale or busy entry costs one failed claim.

use std::sync::Arc;

use hobj_types::{ChunkNum, ChunkSelectorCode, Result, make_error_msg};

use crate::chunk::{Chunk, ChunkInfo};
use crate::selector::HeapChunkSelector;

impl HeapChunkSelector {
    /// Pop the chunk with the most defragmentable blocks.
    ///
    /// The returned snapshot may already be busy; callers must claim it with
    /// `select_specific_chunk` and handle `CHUNK_BUSY`. A popped chunk re-enters
    /// the index the next time it is released or freed into.
    pub fn most_defrag_chunk(&self) -> Option<ChunkInfo> {
        let (chunk_num, key) = self.defrag_heap.lock().pop()?;
        let info = self.state.read().chunks.get(&chunk_num).map(|c| c.info());
        if let Some(info) = &info {
            tracing::debug!(
                chunk = %chunk_num,
                indexed_blks = key,
                defrag_blks = info.defrag_blks,
                busy = info.busy,
                "defrag candidate popped"
            );
        }
        info
    }

    /// Drop `chunk` from the defrag index. Returns whether it was indexed.
    pub fn remove_chunk_from_defrag_heap(&self, chunk: ChunkNum) -> Result<bool> {
        self.state.read().chunk(chunk)?;
        Ok(self.defrag_heap.lock().remove(chunk).is_some())
    }

    /// Number of chunks currently indexed for GC.
    pub fn defrag_heap_size(&self) -> usize {
        self.defrag_heap.lock().len()
    }

    /// Mark a checked-out chunk empty after GC moved its live data away.
    /// Returns the number of blocks that became available. The chunk stays
    /// busy; releasing it puts it back into its PG heap at full capacity.
    pub fn reclaim_chunk(&self, chunk_num: ChunkNum) -> Result<u64> {
        let chunk = self.state.read().chunk(chunk_num)?.clone();
        if !chunk.is_busy() {
            return make_error_msg(
                ChunkSelectorCode::CHUNK_NOT_BUSY,
                format!("chunk {} must be checked out before reclaim", chunk_num),
            );
        }
        let reclaimed = chunk.reset();
        self.defrag_heap.lock().remove(chunk_num);
        tracing::info!(chunk = %chunk_num, reclaimed_blks = reclaimed, "chunk reclaimed");
        Ok(reclaimed)
    }

    /// Re-key `chunk` in the defrag index from its current count, dropping it
    /// when the count is at or below the configured minimum.
    pub(crate) fn sync_defrag_membership(&self, chunk: &Arc<Chunk>) {
        let threshold = self.defrag_min_blks();
        let mut heap = self.defrag_heap.lock();
        heap.remove(chunk.chunk_num());
        if chunk.defrag_blks() > threshold {
            heap.push(chunk);
        }
    }
}
