//! The heap chunk selector.
//!
//! Owns every chunk of the node and decides which one serves a write. Idle
//! chunks live in exactly one heap: their device's heap until a PG claims
//! them, their PG's heap afterwards. A chunk handed out by a selection call
//! is *busy* and sits in no heap until [`HeapChunkSelector::release_chunk`]
//! puts it back.
//!
//! Lock order is registry (`state`) before any heap mutex. The defrag mutex
//! is never held together with a heap mutex.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hobj_config::{Config, ConfigManager};
use hobj_types::{
    ChunkNum, ChunkSelectorCode, DevId, PgId, Result, Status, StatusCode, VChunkNum,
    make_error_msg,
};
use parking_lot::{Mutex, RwLock};

use crate::chunk::{Chunk, ChunkInfo};
use crate::config::ChunkSelectorConfig;
use crate::heap::{ChunkHeap, DefragHeap};
use crate::hints::BlkAllocHints;
use crate::vchunk::VChunkMap;

#[derive(Debug, Default)]
pub(crate) struct SelectorState {
    /// Every registered chunk, busy or idle.
    pub(crate) chunks: HashMap<ChunkNum, Arc<Chunk>>,
    pub(crate) per_dev_heap: HashMap<DevId, Arc<ChunkHeap>>,
    pub(crate) per_pg_heap: HashMap<PgId, Arc<ChunkHeap>>,
    pub(crate) pg_chunks: HashMap<PgId, Arc<VChunkMap>>,
    /// Reverse index of `pg_chunks`.
    pub(crate) chunk_owner: HashMap<ChunkNum, PgId>,
    /// Block count shared by all chunks, fixed by the first registration.
    pub(crate) chunk_blks: Option<u64>,
    pub(crate) dev_heaps_recovered: bool,
}

impl SelectorState {
    pub(crate) fn chunk(&self, chunk: ChunkNum) -> Result<&Arc<Chunk>> {
        match self.chunks.get(&chunk) {
            Some(c) => Ok(c),
            None => make_error_msg(
                ChunkSelectorCode::UNKNOWN_CHUNK,
                format!("chunk {} is not registered", chunk),
            ),
        }
    }

    pub(crate) fn dev_heap(&self, dev: DevId) -> Result<&Arc<ChunkHeap>> {
        match self.per_dev_heap.get(&dev) {
            Some(h) => Ok(h),
            None => make_error_msg(
                ChunkSelectorCode::UNKNOWN_DEVICE,
                format!("device {} has no chunks", dev),
            ),
        }
    }

    pub(crate) fn pg_map(&self, pg: PgId) -> Result<&Arc<VChunkMap>> {
        match self.pg_chunks.get(&pg) {
            Some(m) => Ok(m),
            None => make_error_msg(ChunkSelectorCode::UNKNOWN_PG, format!("pg {}", pg)),
        }
    }

    pub(crate) fn pg_heap(&self, pg: PgId) -> Result<&Arc<ChunkHeap>> {
        if let Some(h) = self.per_pg_heap.get(&pg) {
            return Ok(h);
        }
        if self.pg_chunks.contains_key(&pg) {
            return make_error_msg(
                ChunkSelectorCode::PG_NOT_RECOVERED,
                format!("pg {} membership is known but its heap is not rebuilt yet", pg),
            );
        }
        make_error_msg(ChunkSelectorCode::UNKNOWN_PG, format!("pg {}", pg))
    }

    pub(crate) fn check_owner(&self, pg: PgId, chunk: ChunkNum) -> Result<()> {
        match self.chunk_owner.get(&chunk) {
            Some(&owner) if owner == pg => Ok(()),
            Some(&owner) => make_error_msg(
                ChunkSelectorCode::CHUNK_NOT_OWNED,
                format!("chunk {} belongs to pg {}, not pg {}", chunk, owner, pg),
            ),
            None => make_error_msg(
                ChunkSelectorCode::CHUNK_NOT_OWNED,
                format!("chunk {} belongs to no pg", chunk),
            ),
        }
    }
}

/// Chunk allocation core shared by the shard, PG and GC layers.
///
/// Construct one per process at boot and pass it around by reference or
/// `Arc`; every method takes `&self`.
pub struct HeapChunkSelector {
    config: ConfigManager<ChunkSelectorConfig>,
    pub(crate) state: RwLock<SelectorState>,
    pub(crate) defrag_heap: Mutex<DefragHeap>,
}

impl HeapChunkSelector {
    pub fn new(config: ChunkSelectorConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Status::with_message(StatusCode::INVALID_CONFIG, e.to_string()))?;
        Ok(Self {
            config: ConfigManager::new(config),
            state: RwLock::new(SelectorState::default()),
            defrag_heap: Mutex::new(DefragHeap::new()),
        })
    }

    pub fn config(&self) -> ChunkSelectorConfig {
        self.config.snapshot()
    }

    /// Apply the hot-updatable fields of `config`.
    pub fn update_config(&self, config: &ChunkSelectorConfig) -> Result<()> {
        let mut next = self.config.snapshot();
        next.hot_update(config);
        self.config
            .update(next)
            .map_err(|e| Status::with_message(StatusCode::INVALID_CONFIG, e.to_string()))
    }

    pub(crate) fn defrag_min_blks(&self) -> u64 {
        self.config.get().defrag_min_blks
    }

    // ── Registry ────────────────────────────────────────────────────────────

    /// Register a newly discovered chunk and make it idle on its device.
    pub fn add_chunk(
        &self,
        chunk_num: ChunkNum,
        pdev_id: DevId,
        total_blks: u64,
        available_blks: u64,
        defrag_blks: u64,
    ) -> Result<()> {
        if available_blks > total_blks || defrag_blks > total_blks - available_blks {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                format!(
                    "chunk {}: {} available and {} defrag blocks do not fit in {}",
                    chunk_num, available_blks, defrag_blks, total_blks
                ),
            );
        }
        if total_blks
            .checked_mul(u64::from(self.config.get().blk_size))
            .is_none()
        {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                format!("chunk {}: {} blocks overflow the byte size", chunk_num, total_blks),
            );
        }

        let chunk = {
            let mut state = self.state.write();
            if state.chunks.contains_key(&chunk_num) {
                return make_error_msg(
                    ChunkSelectorCode::CHUNK_EXISTS,
                    format!("chunk {} registered twice", chunk_num),
                );
            }
            match state.chunk_blks {
                Some(blks) if blks != total_blks => {
                    return make_error_msg(
                        ChunkSelectorCode::CHUNK_SIZE_MISMATCH,
                        format!(
                            "chunk {} has {} blocks, other chunks have {}",
                            chunk_num, total_blks, blks
                        ),
                    );
                }
                Some(_) => {}
                None => state.chunk_blks = Some(total_blks),
            }

            let chunk = Arc::new(Chunk::new(
                chunk_num,
                pdev_id,
                total_blks,
                available_blks,
                defrag_blks,
            ));
            let heap = state
                .per_dev_heap
                .entry(pdev_id)
                .or_insert_with(|| Arc::new(ChunkHeap::new()));
            heap.add_total_blks(total_blks);
            heap.lock().push(&chunk);
            state.chunks.insert(chunk_num, chunk.clone());
            chunk
        };

        self.sync_defrag_membership(&chunk);
        tracing::debug!(
            chunk = %chunk_num,
            dev = %pdev_id,
            total_blks,
            available_blks = chunk.available_blks(),
            "chunk registered"
        );
        Ok(())
    }

    /// Visit every registered chunk in chunk-number order. The callback runs
    /// on a snapshot, outside any selector lock.
    pub fn foreach_chunks(&self, mut cb: impl FnMut(&ChunkInfo)) {
        let mut infos: Vec<ChunkInfo> = {
            let state = self.state.read();
            state.chunks.values().map(|c| c.info()).collect()
        };
        infos.sort_by_key(|info| info.chunk_num);
        for info in &infos {
            cb(info);
        }
    }

    pub fn chunk_info(&self, chunk: ChunkNum) -> Result<ChunkInfo> {
        Ok(self.state.read().chunk(chunk)?.info())
    }

    /// Hints that steer a later `select_chunk` back to `chunk`.
    pub fn chunk_to_hints(&self, chunk: ChunkNum) -> Result<BlkAllocHints> {
        let state = self.state.read();
        let c = state.chunk(chunk)?;
        Ok(BlkAllocHints {
            pg_id: state.chunk_owner.get(&chunk).copied(),
            chunk_id: Some(chunk),
            pdev_id: Some(c.pdev_id()),
        })
    }

    // ── PG formation ────────────────────────────────────────────────────────

    /// Carve `pg_size` blocks out of a single device for a new PG.
    ///
    /// Picks the device with the most available blocks and pops its chunks in
    /// descending available-block order until the size is covered. Returns
    /// the number of chunks taken, or `None` if no device has room.
    pub fn select_chunks_for_pg(&self, pg_id: PgId, pg_size: u64) -> Result<Option<u32>> {
        if pg_size == 0 {
            return make_error_msg(StatusCode::INVALID_ARG, "pg size must be positive");
        }

        let mut state = self.state.write();
        if state.pg_chunks.contains_key(&pg_id) {
            return make_error_msg(
                ChunkSelectorCode::PG_EXISTS,
                format!("pg {} already has chunks", pg_id),
            );
        }

        let Some((dev, dev_heap)) = state
            .per_dev_heap
            .iter()
            .max_by(|a, b| {
                a.1.available_blks()
                    .cmp(&b.1.available_blks())
                    .then_with(|| b.0.cmp(a.0))
            })
            .map(|(dev, heap)| (*dev, heap.clone()))
        else {
            tracing::warn!(pg = %pg_id, "no device registered, cannot form pg");
            return Ok(None);
        };

        // Held across the whole scan-and-pop so no other formation can take
        // the same chunks.
        let mut dev_locked = dev_heap.lock();
        if dev_locked.cached_available_blks() < pg_size {
            tracing::warn!(
                pg = %pg_id,
                pg_size,
                most_avail = dev_locked.cached_available_blks(),
                "no device can hold the pg"
            );
            return Ok(None);
        }

        let mut selected = Vec::new();
        let mut accumulated = 0u64;
        while accumulated < pg_size {
            let Some((chunk, avail)) = dev_locked.pop() else {
                break;
            };
            accumulated += avail;
            selected.push(chunk);
        }

        let vmap = match VChunkMap::new(selected.clone()) {
            Ok(m) => m,
            Err(e) => {
                for chunk in &selected {
                    if let Some(c) = state.chunks.get(chunk) {
                        dev_locked.push(c);
                    }
                }
                return Err(e);
            }
        };
        drop(dev_locked);

        let pg_heap = ChunkHeap::new();
        {
            let mut locked = pg_heap.lock();
            for chunk in &selected {
                let c = state.chunk(*chunk)?.clone();
                pg_heap.add_total_blks(c.total_blks());
                locked.push(&c);
            }
        }
        for chunk in &selected {
            state.chunk_owner.insert(*chunk, pg_id);
        }
        state.per_pg_heap.insert(pg_id, Arc::new(pg_heap));
        state.pg_chunks.insert(pg_id, Arc::new(vmap));

        tracing::info!(
            pg = %pg_id,
            dev = %dev,
            num_chunks = selected.len(),
            pg_blks = accumulated,
            "pg chunks selected"
        );
        Ok(Some(selected.len() as u32))
    }

    // ── Selection and release ───────────────────────────────────────────────

    /// Check out the chunk that should serve an `nblks` write.
    ///
    /// With a `chunk_id` hint only that exact chunk is considered; otherwise
    /// the top of the hinted PG's heap is taken. Returns `None` when the
    /// candidate is busy or too small; the heap is left untouched then.
    pub fn select_chunk(&self, nblks: u64, hints: &BlkAllocHints) -> Result<Option<ChunkNum>> {
        let state = self.state.read();
        let selected = match (hints.chunk_id, hints.pg_id) {
            (Some(chunk_num), pg_hint) => {
                let chunk = state.chunk(chunk_num)?;
                let Some(&owner) = state.chunk_owner.get(&chunk_num) else {
                    return make_error_msg(
                        ChunkSelectorCode::CHUNK_NOT_OWNED,
                        format!("chunk {} belongs to no pg", chunk_num),
                    );
                };
                if let Some(pg) = pg_hint {
                    state.check_owner(pg, chunk_num)?;
                }
                let mut heap = state.pg_heap(owner)?.lock();
                if chunk.available_blks() >= nblks && heap.remove(chunk_num).is_some() {
                    mark_busy(chunk)?;
                    Some(chunk_num)
                } else {
                    None
                }
            }
            (None, Some(pg)) => {
                let mut heap = state.pg_heap(pg)?.lock();
                match heap.pop_if_fits(nblks) {
                    Some((chunk_num, _)) => {
                        mark_busy(state.chunk(chunk_num)?)?;
                        Some(chunk_num)
                    }
                    None => None,
                }
            }
            (None, None) => {
                return make_error_msg(
                    StatusCode::INVALID_ARG,
                    "select_chunk needs a pg or chunk hint",
                );
            }
        };

        match selected {
            Some(chunk) => tracing::debug!(%chunk, nblks, "chunk selected"),
            None => tracing::debug!(nblks, ?hints, "no chunk fits"),
        }
        Ok(selected)
    }

    /// Check out one named chunk of `pg_id` regardless of its rank. Used by
    /// GC and recovery; fails with `CHUNK_BUSY` if it is already checked
    /// out.
    pub fn select_specific_chunk(&self, pg_id: PgId, chunk_num: ChunkNum) -> Result<()> {
        let state = self.state.read();
        let chunk = state.chunk(chunk_num)?;
        let heap = state.pg_heap(pg_id)?;
        state.check_owner(pg_id, chunk_num)?;

        let mut heap = heap.lock();
        if heap.remove(chunk_num).is_none() {
            return make_error_msg(
                ChunkSelectorCode::CHUNK_BUSY,
                format!("chunk {} of pg {} is already checked out", chunk_num, pg_id),
            );
        }
        mark_busy(chunk)?;
        tracing::debug!(pg = %pg_id, chunk = %chunk_num, "specific chunk selected");
        Ok(())
    }

    /// Return a checked-out chunk to its PG heap, keyed on its current
    /// available blocks. Each checkout must be released exactly once; a
    /// second release fails with `CHUNK_NOT_BUSY`.
    pub fn release_chunk(&self, pg_id: PgId, chunk_num: ChunkNum) -> Result<()> {
        let chunk = {
            let state = self.state.read();
            let chunk = state.chunk(chunk_num)?.clone();
            let heap = state.pg_heap(pg_id)?;
            state.check_owner(pg_id, chunk_num)?;

            let mut heap = heap.lock();
            if !chunk.try_mark_idle() {
                tracing::warn!(pg = %pg_id, chunk = %chunk_num, "release of an idle chunk");
                return make_error_msg(
                    ChunkSelectorCode::CHUNK_NOT_BUSY,
                    format!("chunk {} of pg {} is not checked out", chunk_num, pg_id),
                );
            }
            heap.push(&chunk);
            chunk
        };

        self.sync_defrag_membership(&chunk);
        tracing::debug!(
            pg = %pg_id,
            chunk = %chunk_num,
            available_blks = chunk.available_blks(),
            "chunk released"
        );
        Ok(())
    }

    // ── Occupancy ───────────────────────────────────────────────────────────

    /// Consume `nblks` of a checked-out chunk. Returns the blocks left, or
    /// `None` if the write does not fit. Idle chunks are rejected because
    /// their heap key would go stale.
    pub fn alloc_blks(&self, chunk_num: ChunkNum, nblks: u64) -> Result<Option<u64>> {
        let state = self.state.read();
        let chunk = state.chunk(chunk_num)?;
        if !chunk.is_busy() {
            return make_error_msg(
                ChunkSelectorCode::CHUNK_NOT_BUSY,
                format!("chunk {} must be checked out before writing", chunk_num),
            );
        }
        Ok(chunk.consume(nblks))
    }

    /// Record `nblks` of a chunk's data as overwritten or deleted. Returns
    /// the chunk's new defragmentable block count.
    pub fn free_blks(&self, chunk_num: ChunkNum, nblks: u64) -> Result<u64> {
        let chunk = self.state.read().chunk(chunk_num)?.clone();
        let defrag = chunk.add_defrag(nblks);
        self.sync_defrag_membership(&chunk);
        Ok(defrag)
    }

    // ── Introspection ───────────────────────────────────────────────────────

    /// Available blocks of `dev`'s idle pool, or the largest such value over
    /// all devices when `dev` is `None`.
    pub fn avail_blks(&self, dev: Option<DevId>) -> Result<u64> {
        let state = self.state.read();
        match dev {
            Some(dev) => Ok(state.dev_heap(dev)?.available_blks()),
            None => Ok(state
                .per_dev_heap
                .values()
                .map(|h| h.available_blks())
                .max()
                .unwrap_or(0)),
        }
    }

    pub fn total_blks(&self, dev: DevId) -> Result<u64> {
        Ok(self.state.read().dev_heap(dev)?.total_blks())
    }

    pub fn avail_num_chunks(&self, dev: DevId) -> Result<u32> {
        Ok(self.state.read().dev_heap(dev)?.size() as u32)
    }

    /// The largest idle chunk count over all devices.
    pub fn most_avail_num_chunks(&self) -> u32 {
        let state = self.state.read();
        state
            .per_dev_heap
            .values()
            .map(|h| h.size() as u32)
            .max()
            .unwrap_or(0)
    }

    pub fn total_chunks(&self) -> u32 {
        self.state.read().chunks.len() as u32
    }

    /// Chunk size in bytes, 0 before any chunk is registered.
    pub fn get_chunk_size(&self) -> u64 {
        let blks = self.state.read().chunk_blks.unwrap_or(0);
        blks.saturating_mul(u64::from(self.config.get().blk_size))
    }

    /// Real chunk ids of `pg_id` in virtual order.
    pub fn get_pg_chunks(&self, pg_id: PgId) -> Result<Vec<ChunkNum>> {
        Ok(self.state.read().pg_map(pg_id)?.chunks().to_vec())
    }

    pub fn v_chunk_to_r(&self, pg_id: PgId, v_chunk: VChunkNum) -> Result<ChunkNum> {
        let state = self.state.read();
        match state.pg_map(pg_id)?.to_real(v_chunk) {
            Some(r) => Ok(r),
            None => make_error_msg(
                ChunkSelectorCode::UNKNOWN_CHUNK,
                format!("pg {} has no virtual chunk {}", pg_id, v_chunk),
            ),
        }
    }

    pub fn r_chunk_to_v(&self, pg_id: PgId, r_chunk: ChunkNum) -> Result<VChunkNum> {
        let state = self.state.read();
        match state.pg_map(pg_id)?.to_virtual(r_chunk) {
            Some(v) => Ok(v),
            None => make_error_msg(
                ChunkSelectorCode::CHUNK_NOT_OWNED,
                format!("chunk {} is not part of pg {}", r_chunk, pg_id),
            ),
        }
    }

    pub fn pg_avail_blks(&self, pg_id: PgId) -> Result<u64> {
        Ok(self.state.read().pg_heap(pg_id)?.available_blks())
    }

    pub fn pg_avail_num_chunks(&self, pg_id: PgId) -> Result<u32> {
        Ok(self.state.read().pg_heap(pg_id)?.size() as u32)
    }

    pub fn pg_total_blks(&self, pg_id: PgId) -> Result<u64> {
        Ok(self.state.read().pg_heap(pg_id)?.total_blks())
    }

    /// Verify the structural invariants: every heap counter equals the sum
    /// of its members, every idle chunk is in exactly one heap keyed on its
    /// current available blocks, busy chunks are in none, and each PG's
    /// virtual/real map is a bijection over the chunks it owns. Idle chunks
    /// of a PG whose heap has not been recovered yet are exempt from the
    /// heap membership check.
    ///
    /// Meaningful only while no other thread mutates the selector.
    pub fn check_invariants(&self) -> Result<()> {
        let state = self.state.read();
        let mut seen: HashSet<ChunkNum> = HashSet::new();

        let heaps = state
            .per_dev_heap
            .iter()
            .map(|(dev, heap)| (HeapOwner::Dev(*dev), heap))
            .chain(
                state
                    .per_pg_heap
                    .iter()
                    .map(|(pg, heap)| (HeapOwner::Pg(*pg), heap)),
            );
        for (owner, heap) in heaps {
            let locked = heap.lock();
            if locked.recount() != locked.cached_available_blks() {
                return found_bug(format!(
                    "{:?}: counter {} != member sum {}",
                    owner,
                    locked.cached_available_blks(),
                    locked.recount()
                ));
            }
            for (chunk_num, key) in locked.members() {
                let chunk = state.chunk(chunk_num)?;
                if !seen.insert(chunk_num) {
                    return found_bug(format!("chunk {} is in more than one heap", chunk_num));
                }
                if chunk.is_busy() {
                    return found_bug(format!("busy chunk {} is in {:?}", chunk_num, owner));
                }
                if key != chunk.available_blks() {
                    return found_bug(format!(
                        "chunk {} keyed {} but has {} available",
                        chunk_num,
                        key,
                        chunk.available_blks()
                    ));
                }
                let pg = state.chunk_owner.get(&chunk_num).copied();
                let consistent = match owner {
                    HeapOwner::Dev(dev) => pg.is_none() && chunk.pdev_id() == dev,
                    HeapOwner::Pg(heap_pg) => pg == Some(heap_pg),
                };
                if !consistent {
                    return found_bug(format!(
                        "chunk {} (pg {:?}) misplaced in {:?}",
                        chunk_num, pg, owner
                    ));
                }
            }
        }

        // An owned chunk whose PG heap is not rebuilt yet sits in no heap.
        for (chunk_num, chunk) in &state.chunks {
            if chunk.is_busy() || seen.contains(chunk_num) {
                continue;
            }
            let heap_expected = match state.chunk_owner.get(chunk_num) {
                None => true,
                Some(pg) => state.per_pg_heap.contains_key(pg),
            };
            if heap_expected {
                return found_bug(format!("idle chunk {} is in no heap", chunk_num));
            }
        }

        let mut owned = 0usize;
        for (pg, vmap) in &state.pg_chunks {
            if !vmap.check() {
                return found_bug(format!("pg {} virtual/real maps disagree", pg));
            }
            for &chunk in vmap.chunks() {
                if state.chunk_owner.get(&chunk) != Some(pg) {
                    return found_bug(format!("chunk {} of pg {} has another owner", chunk, pg));
                }
            }
            owned += vmap.len();
        }
        if owned != state.chunk_owner.len() {
            return found_bug(format!(
                "{} owned chunks but pg maps cover {}",
                state.chunk_owner.len(),
                owned
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum HeapOwner {
    Dev(DevId),
    Pg(PgId),
}

fn found_bug<T>(msg: String) -> Result<T> {
    tracing::error!("{}", msg);
    make_error_msg(StatusCode::FOUND_BUG, msg)
}

/// Flag a chunk just removed from a heap as checked out.
fn mark_busy(chunk: &Chunk) -> Result<()> {
    if chunk.try_mark_busy() {
        Ok(())
    } else {
        found_bug(format!("chunk {} was idle in a heap but flagged busy", chunk.chunk_num()))
    }
}
