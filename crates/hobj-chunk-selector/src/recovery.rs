//! Boot-time reconstruction of PG membership and heaps.
//!
//! Runs in three steps once every chunk is registered:
//!
//! 1. [`HeapChunkSelector::set_pg_chunks`] for each persisted PG record, in
//!    the stored chunk order, which is the virtual numbering.
//! 2. [`HeapChunkSelector::recover_per_dev_chunk_heap`] once.
//! 3. [`HeapChunkSelector::recover_pg_chunk_heap`] for each PG, excluding
//!    the chunks held by open shards.
//!
//! Calls made out of this order fail with `RECOVERY_OUT_OF_ORDER`.

use std::collections::HashSet;
use std::sync::Arc;

use hobj_types::{ChunkNum, ChunkSelectorCode, PgId, Result, make_error_msg};

use crate::heap::ChunkHeap;
use crate::selector::HeapChunkSelector;
use crate::vchunk::VChunkMap;

impl HeapChunkSelector {
    /// Restore the membership of `pg_id` from its persisted record. No heap
    /// is built yet; the chunks leave their device pool immediately.
    pub fn set_pg_chunks(&self, pg_id: PgId, chunks: Vec<ChunkNum>) -> Result<()> {
        let mut state = self.state.write();
        if state.dev_heaps_recovered {
            return make_error_msg(
                ChunkSelectorCode::RECOVERY_OUT_OF_ORDER,
                format!("pg {} membership replayed after device heaps were rebuilt", pg_id),
            );
        }
        if state.pg_chunks.contains_key(&pg_id) {
            return make_error_msg(
                ChunkSelectorCode::PG_EXISTS,
                format!("pg {} membership replayed twice", pg_id),
            );
        }

        let mut dev = None;
        for &chunk_num in &chunks {
            let chunk = state.chunk(chunk_num)?;
            if let Some(owner) = state.chunk_owner.get(&chunk_num) {
                return make_error_msg(
                    ChunkSelectorCode::CHUNK_CLAIMED,
                    format!("chunk {} already belongs to pg {}", chunk_num, owner),
                );
            }
            match dev {
                None => dev = Some(chunk.pdev_id()),
                Some(d) if d != chunk.pdev_id() => {
                    return make_error_msg(
                        ChunkSelectorCode::CROSS_DEVICE_PG,
                        format!(
                            "pg {} spans device {} and device {}",
                            pg_id,
                            d,
                            chunk.pdev_id()
                        ),
                    );
                }
                Some(_) => {}
            }
        }
        let vmap = VChunkMap::new(chunks)?;

        if let Some(dev) = dev {
            let mut heap = state.dev_heap(dev)?.lock();
            for &chunk in vmap.chunks() {
                heap.remove(chunk);
            }
        }
        for &chunk in vmap.chunks() {
            state.chunk_owner.insert(chunk, pg_id);
        }
        tracing::debug!(pg = %pg_id, num_chunks = vmap.len(), "pg membership restored");
        state.pg_chunks.insert(pg_id, Arc::new(vmap));
        Ok(())
    }

    /// Rebuild every device heap from the chunks no PG has claimed.
    pub fn recover_per_dev_chunk_heap(&self) {
        let mut state = self.state.write();

        let mut idle: Vec<_> = state
            .chunks
            .values()
            .filter(|c| !state.chunk_owner.contains_key(&c.chunk_num()) && !c.is_busy())
            .cloned()
            .collect();
        idle.sort_by_key(|c| c.chunk_num());

        for heap in state.per_dev_heap.values() {
            heap.lock().clear();
        }
        for chunk in &idle {
            if let Some(heap) = state.per_dev_heap.get(&chunk.pdev_id()) {
                heap.lock().push(chunk);
            }
        }
        state.dev_heaps_recovered = true;

        tracing::info!(
            num_devices = state.per_dev_heap.len(),
            idle_chunks = idle.len(),
            claimed_chunks = state.chunk_owner.len(),
            "device heaps recovered"
        );
    }

    /// Build the idle heap of `pg_id` from its membership minus `excluding`.
    /// Excluded chunks are held by open shards and stay checked out until
    /// released.
    pub fn recover_pg_chunk_heap(&self, pg_id: PgId, excluding: &HashSet<ChunkNum>) -> Result<()> {
        let mut state = self.state.write();
        if !state.dev_heaps_recovered {
            return make_error_msg(
                ChunkSelectorCode::RECOVERY_OUT_OF_ORDER,
                format!("pg {} heap recovered before device heaps", pg_id),
            );
        }
        let vmap = state.pg_map(pg_id)?.clone();
        if state.per_pg_heap.contains_key(&pg_id) {
            return make_error_msg(
                ChunkSelectorCode::PG_EXISTS,
                format!("pg {} heap already recovered", pg_id),
            );
        }
        if let Some(stray) = excluding.iter().find(|c| !vmap.contains(**c)) {
            return make_error_msg(
                ChunkSelectorCode::CHUNK_NOT_OWNED,
                format!("excluded chunk {} is not part of pg {}", stray, pg_id),
            );
        }

        let heap = ChunkHeap::new();
        {
            let mut locked = heap.lock();
            for &chunk_num in vmap.chunks() {
                let chunk = state.chunk(chunk_num)?;
                heap.add_total_blks(chunk.total_blks());
                if excluding.contains(&chunk_num) {
                    if !chunk.try_mark_busy() {
                        tracing::warn!(pg = %pg_id, chunk = %chunk_num, "excluded chunk already busy");
                    }
                } else {
                    locked.push(chunk);
                }
            }
        }

        tracing::info!(
            pg = %pg_id,
            num_chunks = vmap.len(),
            busy_chunks = excluding.len(),
            available_blks = heap.available_blks(),
            "pg heap recovered"
        );
        state.per_pg_heap.insert(pg_id, Arc::new(heap));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hints::BlkAllocHints;
    use crate::selector::tests::{add_chunks, selector};
    use hobj_types::DevId;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    #[test]
    fn test_recovery_reproduces_virtual_order() {
        let before = selector();
        // Distinct fill levels so formation order differs from chunk order.
        for n in 0..6u16 {
            before
                .add_chunk(ChunkNum(n), DevId(0), 100, 40 + 10 * n as u64, 0)
                .unwrap();
        }
        for n in 6..10u16 {
            before.add_chunk(ChunkNum(n), DevId(1), 100, 100, 0).unwrap();
        }
        before.select_chunks_for_pg(PgId(1), 200).unwrap().unwrap();
        before.select_chunks_for_pg(PgId(2), 240).unwrap().unwrap();
        let records: Vec<(PgId, Vec<ChunkNum>)> = [PgId(1), PgId(2)]
            .into_iter()
            .map(|pg| (pg, before.get_pg_chunks(pg).unwrap()))
            .collect();
        assert_eq!(records[0].1, vec![ChunkNum(6), ChunkNum(7)]);
        assert_eq!(records[1].1, vec![ChunkNum(5), ChunkNum(4), ChunkNum(3)]);

        let mut infos = Vec::new();
        before.foreach_chunks(|info| infos.push(*info));
        infos.shuffle(&mut StdRng::seed_from_u64(7));

        let after = selector();
        for info in &infos {
            after
                .add_chunk(
                    info.chunk_num,
                    info.pdev_id,
                    info.total_blks,
                    info.available_blks,
                    info.defrag_blks,
                )
                .unwrap();
        }
        for (pg, chunks) in &records {
            after.set_pg_chunks(*pg, chunks.clone()).unwrap();
        }
        after.recover_per_dev_chunk_heap();
        for (pg, _) in &records {
            after.recover_pg_chunk_heap(*pg, &HashSet::new()).unwrap();
        }

        for (pg, chunks) in &records {
            assert_eq!(&after.get_pg_chunks(*pg).unwrap(), chunks);
            assert_eq!(
                after.pg_avail_blks(*pg).unwrap(),
                before.pg_avail_blks(*pg).unwrap()
            );
        }
        for dev in [DevId(0), DevId(1)] {
            assert_eq!(after.avail_blks(Some(dev)).unwrap(), before.avail_blks(Some(dev)).unwrap());
            assert_eq!(after.total_blks(dev).unwrap(), before.total_blks(dev).unwrap());
        }
        after.check_invariants().unwrap();
    }

    #[test]
    fn test_excluded_chunks_stay_busy() {
        let sel = selector();
        add_chunks(&sel, 0, 0, 4, 100);
        sel.set_pg_chunks(PgId(1), vec![ChunkNum(2), ChunkNum(0), ChunkNum(3)])
            .unwrap();
        sel.recover_per_dev_chunk_heap();
        assert_eq!(sel.avail_num_chunks(DevId(0)).unwrap(), 1);
        assert_eq!(sel.avail_blks(Some(DevId(0))).unwrap(), 100);

        let excluding: HashSet<_> = [ChunkNum(0)].into_iter().collect();
        sel.recover_pg_chunk_heap(PgId(1), &excluding).unwrap();
        assert_eq!(sel.pg_avail_num_chunks(PgId(1)).unwrap(), 2);
        assert!(sel.chunk_info(ChunkNum(0)).unwrap().busy);

        let anchor = BlkAllocHints::for_chunk(ChunkNum(0));
        assert_eq!(sel.select_chunk(1, &anchor).unwrap(), None);
        sel.release_chunk(PgId(1), ChunkNum(0)).unwrap();
        assert_eq!(sel.select_chunk(1, &anchor).unwrap(), Some(ChunkNum(0)));
        assert_eq!(sel.r_chunk_to_v(PgId(1), ChunkNum(0)).unwrap().0, 1);
        sel.check_invariants().unwrap();
    }

    #[test]
    fn test_recovery_out_of_order() {
        let sel = selector();
        add_chunks(&sel, 0, 0, 4, 100);
        sel.set_pg_chunks(PgId(1), vec![ChunkNum(0)]).unwrap();

        let err = sel.recover_pg_chunk_heap(PgId(1), &HashSet::new()).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::RECOVERY_OUT_OF_ORDER);
        let err = sel.pg_avail_blks(PgId(1)).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::PG_NOT_RECOVERED);

        sel.recover_per_dev_chunk_heap();
        let err = sel.set_pg_chunks(PgId(2), vec![ChunkNum(1)]).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::RECOVERY_OUT_OF_ORDER);

        sel.recover_pg_chunk_heap(PgId(1), &HashSet::new()).unwrap();
        let err = sel.recover_pg_chunk_heap(PgId(1), &HashSet::new()).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::PG_EXISTS);
        let err = sel.recover_pg_chunk_heap(PgId(9), &HashSet::new()).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::UNKNOWN_PG);
        sel.check_invariants().unwrap();
    }

    #[test]
    fn test_set_pg_chunks_rejects_bad_records() {
        let sel = selector();
        add_chunks(&sel, 0, 0, 3, 100);
        add_chunks(&sel, 1, 3, 3, 100);

        sel.set_pg_chunks(PgId(1), vec![ChunkNum(0), ChunkNum(1)]).unwrap();
        let err = sel.set_pg_chunks(PgId(1), vec![ChunkNum(2)]).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::PG_EXISTS);
        let err = sel.set_pg_chunks(PgId(2), vec![ChunkNum(1)]).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::CHUNK_CLAIMED);
        let err = sel.set_pg_chunks(PgId(2), vec![ChunkNum(2), ChunkNum(3)]).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::CROSS_DEVICE_PG);
        let err = sel.set_pg_chunks(PgId(2), vec![ChunkNum(4), ChunkNum(4)]).unwrap_err();
        assert_eq!(err.code(), hobj_types::StatusCode::INVALID_ARG);
        let err = sel.set_pg_chunks(PgId(2), vec![ChunkNum(40)]).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::UNKNOWN_CHUNK);

        // Failed records leave no trace.
        assert!(sel.get_pg_chunks(PgId(2)).is_err());
        sel.set_pg_chunks(PgId(2), vec![ChunkNum(4), ChunkNum(5)]).unwrap();

        let excluding: HashSet<_> = [ChunkNum(4)].into_iter().collect();
        sel.recover_per_dev_chunk_heap();
        let err = sel.recover_pg_chunk_heap(PgId(1), &excluding).unwrap_err();
        assert_eq!(err.code(), ChunkSelectorCode::CHUNK_NOT_OWNED);
    }
}
