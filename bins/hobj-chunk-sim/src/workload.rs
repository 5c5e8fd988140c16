//! Simulation phases driven against a [`HeapChunkSelector`].

use std::collections::{HashMap, HashSet};

use anyhow::{Context, ensure};
use hobj_chunk_selector::{BlkAllocHints, ChunkInfo, HeapChunkSelector};
use hobj_types::{ChunkNum, ChunkSelectorCode, DevId, PgId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::config::{SimConfig, WorkloadConfig};

/// Persisted PG record: membership in virtual order.
pub type PgRecord = (PgId, Vec<ChunkNum>);

#[derive(Debug, Default, Clone, Copy)]
pub struct WriteStats {
    pub writes: u64,
    pub written_blks: u64,
    pub deletes: u64,
    pub no_space: u64,
}

impl std::ops::AddAssign for WriteStats {
    fn add_assign(&mut self, other: Self) {
        self.writes += other.writes;
        self.written_blks += other.written_blks;
        self.deletes += other.deletes;
        self.no_space += other.no_space;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GcStats {
    pub reclaimed_chunks: u64,
    pub reclaimed_blks: u64,
    pub moved_blks: u64,
    pub skipped_busy: u64,
}

/// Register every configured chunk. Chunk ids are assigned sequentially
/// across devices in configuration order.
pub fn register_chunks(sel: &HeapChunkSelector, config: &SimConfig) -> anyhow::Result<()> {
    let mut next: u32 = 0;
    for dev in &config.devices {
        for _ in 0..dev.num_chunks {
            let chunk = ChunkNum(u16::try_from(next).context("chunk id overflow")?);
            sel.add_chunk(chunk, DevId(dev.dev_id), dev.chunk_blks, dev.chunk_blks, 0)?;
            next += 1;
        }
    }
    tracing::info!(
        num_chunks = sel.total_chunks(),
        chunk_size = sel.get_chunk_size(),
        "chunks registered"
    );
    Ok(())
}

/// PG ids handled by worker `idx` out of `threads`.
fn pgs_for_worker(num_pgs: u16, threads: usize, idx: usize) -> Vec<PgId> {
    (0..num_pgs)
        .filter(|pg| usize::from(*pg) % threads == idx)
        .map(PgId)
        .collect()
}

/// Form `num_pgs` PGs from `threads` workers at once. Returns the PGs that
/// found space, in id order.
pub fn form_pgs(
    sel: &HeapChunkSelector,
    workload: &WorkloadConfig,
    threads: usize,
) -> anyhow::Result<Vec<PgId>> {
    let results: Vec<anyhow::Result<Vec<PgId>>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|idx| {
                s.spawn(move || -> anyhow::Result<Vec<PgId>> {
                    let mut formed = Vec::new();
                    for pg in pgs_for_worker(workload.num_pgs, threads, idx) {
                        match sel.select_chunks_for_pg(pg, workload.pg_size_blks)? {
                            Some(_) => formed.push(pg),
                            None => tracing::warn!(%pg, "no space for pg"),
                        }
                    }
                    Ok(formed)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("pg formation worker panicked")))
            })
            .collect()
    });

    let mut formed = Vec::new();
    for r in results {
        formed.extend(r?);
    }
    formed.sort();

    let mut claimed = HashSet::new();
    for pg in &formed {
        for chunk in sel.get_pg_chunks(*pg)? {
            ensure!(claimed.insert(chunk), "chunk {} claimed by two pgs", chunk);
        }
    }
    tracing::info!(formed = formed.len(), requested = workload.num_pgs, "pgs formed");
    Ok(formed)
}

fn write_pg(
    sel: &HeapChunkSelector,
    pg: PgId,
    workload: &WorkloadConfig,
    rng: &mut StdRng,
) -> anyhow::Result<WriteStats> {
    let mut stats = WriteStats::default();
    let mut blobs: Vec<(ChunkNum, u64)> = Vec::new();
    let hints = BlkAllocHints::for_pg(pg);

    for _ in 0..workload.writes_per_pg {
        if !blobs.is_empty() && rng.gen_range(0..100) < workload.delete_percent {
            let (chunk, nblks) = blobs.swap_remove(rng.gen_range(0..blobs.len()));
            sel.free_blks(chunk, nblks)?;
            stats.deletes += 1;
            continue;
        }

        let nblks = rng.gen_range(1..=workload.max_write_blks);
        let Some(chunk) = sel.select_chunk(nblks, &hints)? else {
            stats.no_space += 1;
            continue;
        };
        let left = sel.alloc_blks(chunk, nblks)?;
        sel.release_chunk(pg, chunk)?;
        ensure!(left.is_some(), "chunk {} shrank while checked out", chunk);
        blobs.push((chunk, nblks));
        stats.writes += 1;
        stats.written_blks += nblks;
    }
    Ok(stats)
}

/// Random writes and deletes on every PG, one worker per PG subset.
pub fn run_writes(
    sel: &HeapChunkSelector,
    pgs: &[PgId],
    workload: &WorkloadConfig,
    threads: usize,
    seed: u64,
) -> anyhow::Result<WriteStats> {
    let results: Vec<anyhow::Result<WriteStats>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|idx| {
                s.spawn(move || -> anyhow::Result<WriteStats> {
                    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(idx as u64));
                    let mut stats = WriteStats::default();
                    for pg in pgs.iter().skip(idx).step_by(threads) {
                        stats += write_pg(sel, *pg, workload, &mut rng)?;
                    }
                    Ok(stats)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("write worker panicked")))
            })
            .collect()
    });

    let mut total = WriteStats::default();
    for r in results {
        total += r?;
    }
    tracing::info!(
        writes = total.writes,
        written_blks = total.written_blks,
        deletes = total.deletes,
        no_space = total.no_space,
        "write phase done"
    );
    Ok(total)
}

/// Drain the defrag index once, reclaiming every candidate that can be
/// claimed. Live blocks are counted as moved.
pub fn gc_pass(sel: &HeapChunkSelector) -> anyhow::Result<GcStats> {
    let mut stats = GcStats::default();
    while let Some(info) = sel.most_defrag_chunk() {
        if info.busy {
            stats.skipped_busy += 1;
            continue;
        }
        let Some(pg) = sel.chunk_to_hints(info.chunk_num)?.pg_id else {
            continue;
        };
        match sel.select_specific_chunk(pg, info.chunk_num) {
            Ok(()) => {}
            Err(e) if e.code() == ChunkSelectorCode::CHUNK_BUSY => {
                stats.skipped_busy += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        let current = sel.chunk_info(info.chunk_num)?;
        let used = current.total_blks - current.available_blks;
        let reclaimed = sel.reclaim_chunk(info.chunk_num)?;
        sel.release_chunk(pg, info.chunk_num)?;

        stats.reclaimed_chunks += 1;
        stats.reclaimed_blks += reclaimed;
        stats.moved_blks += used.saturating_sub(current.defrag_blks);
    }
    tracing::info!(
        reclaimed_chunks = stats.reclaimed_chunks,
        reclaimed_blks = stats.reclaimed_blks,
        moved_blks = stats.moved_blks,
        skipped_busy = stats.skipped_busy,
        "gc pass done"
    );
    Ok(stats)
}

/// State captured before a simulated restart.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub chunks: Vec<ChunkInfo>,
    pub records: Vec<PgRecord>,
    /// Chunks held by open shards at shutdown.
    pub open: HashMap<PgId, HashSet<ChunkNum>>,
}

/// Leave one chunk per PG checked out, as an open shard would, and capture
/// everything recovery needs.
pub fn snapshot(sel: &HeapChunkSelector, pgs: &[PgId]) -> anyhow::Result<Snapshot> {
    let mut open: HashMap<PgId, HashSet<ChunkNum>> = HashMap::new();
    for pg in pgs {
        if let Some(chunk) = sel.select_chunk(1, &BlkAllocHints::for_pg(*pg))? {
            open.entry(*pg).or_default().insert(chunk);
        }
    }

    let mut chunks = Vec::new();
    sel.foreach_chunks(|info| chunks.push(*info));
    let records = pgs
        .iter()
        .map(|pg| -> anyhow::Result<PgRecord> { Ok((*pg, sel.get_pg_chunks(*pg)?)) })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(Snapshot {
        chunks,
        records,
        open,
    })
}

/// Boot a fresh selector from `snap`, discovering chunks in shuffled order,
/// and replay recovery.
pub fn restart(
    config: &SimConfig,
    snap: &Snapshot,
    rng: &mut StdRng,
) -> anyhow::Result<HeapChunkSelector> {
    let sel = HeapChunkSelector::new(config.selector.clone())?;

    let mut discovered = snap.chunks.clone();
    discovered.shuffle(rng);
    for info in &discovered {
        sel.add_chunk(
            info.chunk_num,
            info.pdev_id,
            info.total_blks,
            info.available_blks,
            info.defrag_blks,
        )?;
    }

    for (pg, chunks) in &snap.records {
        sel.set_pg_chunks(*pg, chunks.clone())?;
    }
    sel.recover_per_dev_chunk_heap();
    let none = HashSet::new();
    for (pg, _) in &snap.records {
        sel.recover_pg_chunk_heap(*pg, snap.open.get(pg).unwrap_or(&none))?;
    }
    Ok(sel)
}

/// Compare a recovered selector with the one it replaces.
pub fn verify_restart(
    before: &HeapChunkSelector,
    after: &HeapChunkSelector,
    snap: &Snapshot,
    config: &SimConfig,
) -> anyhow::Result<()> {
    for (pg, chunks) in &snap.records {
        let recovered = after.get_pg_chunks(*pg)?;
        ensure!(
            &recovered == chunks,
            "pg {} recovered as {:?}, expected {:?}",
            pg,
            recovered,
            chunks
        );
        ensure!(
            after.pg_avail_blks(*pg)? == before.pg_avail_blks(*pg)?,
            "pg {} available blocks differ after restart",
            pg
        );
    }
    for dev in &config.devices {
        let dev = DevId(dev.dev_id);
        ensure!(
            after.avail_blks(Some(dev))? == before.avail_blks(Some(dev))?,
            "device {} available blocks differ after restart",
            dev
        );
        ensure!(
            after.avail_num_chunks(dev)? == before.avail_num_chunks(dev)?,
            "device {} idle chunk count differs after restart",
            dev
        );
    }
    before.check_invariants()?;
    after.check_invariants()?;

    // Closing the open shards must work on the recovered side.
    for (pg, chunks) in &snap.open {
        for chunk in chunks {
            after.release_chunk(*pg, *chunk)?;
        }
    }
    after.check_invariants()?;
    tracing::info!(pgs = snap.records.len(), "restart verified");
    Ok(())
}
