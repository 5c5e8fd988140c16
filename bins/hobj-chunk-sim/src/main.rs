mod config;
mod workload;

use std::path::PathBuf;

use clap::Parser;
use hobj_chunk_selector::HeapChunkSelector;
use hobj_config::ConfigManager;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SimConfig;

/// Chunk selector simulator
///
/// Boots a chunk selector over a simulated device layout and drives it
/// through the lifecycle of a storage node:
///   1. Register chunks and form PGs concurrently
///   2. Run random writes and deletes
///   3. Run one GC pass over the defrag index
///   4. Restart: rediscover chunks in random order and replay recovery
///   5. Verify the recovered state matches
#[derive(Parser, Debug)]
#[command(name = "hobj-chunk-sim", version, about)]
struct Args {
    /// Path to configuration file. Built-in defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the default configuration as TOML and exit.
    #[arg(long, default_value_t = false)]
    dump_default_config: bool,

    /// Number of worker threads for PG formation and writes.
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Seed for the workload generator. Random when omitted.
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        print!("{}", toml::to_string_pretty(&SimConfig::default())?);
        return Ok(());
    }

    let manager = match &args.config {
        Some(path) => ConfigManager::<SimConfig>::load(path)?,
        None => ConfigManager::new(SimConfig::default()),
    };
    let config = manager.snapshot();
    let _log_guard = hobj_logging::init_logging(&config.log)?;

    let threads = args.threads.max(1);
    let seed = args.seed.unwrap_or_else(|| rand::thread_rng().gen());
    tracing::info!(
        config = ?args.config,
        threads,
        seed,
        devices = config.devices.len(),
        "starting chunk selector simulation"
    );

    let sel = HeapChunkSelector::new(config.selector.clone())?;
    workload::register_chunks(&sel, &config)?;

    let pgs = workload::form_pgs(&sel, &config.workload, threads)?;
    let writes = workload::run_writes(&sel, &pgs, &config.workload, threads, seed)?;
    sel.check_invariants()?;
    let gc = workload::gc_pass(&sel)?;
    sel.check_invariants()?;

    // Pick up edits made to the config file while the node was running.
    manager.reload()?;
    let config = manager.snapshot();
    if let Some(path) = manager.path() {
        tracing::info!(
            path = %path.display(),
            defrag_min_blks = config.selector.defrag_min_blks,
            "config reloaded before restart"
        );
    }
    sel.update_config(&config.selector)?;

    let snap = workload::snapshot(&sel, &pgs)?;
    let mut rng = StdRng::seed_from_u64(seed);
    let recovered = workload::restart(&config, &snap, &mut rng)?;
    workload::verify_restart(&sel, &recovered, &snap, &config)?;

    println!(
        "pgs formed: {}/{}  writes: {} ({} blks)  deletes: {}  no-space: {}  \
         gc reclaimed: {} chunks ({} blks)  restart: ok  seed: {}",
        pgs.len(),
        config.workload.num_pgs,
        writes.writes,
        writes.written_blks,
        writes.deletes,
        writes.no_space,
        gc.reclaimed_chunks,
        gc.reclaimed_blks,
        seed,
    );
    Ok(())
}
