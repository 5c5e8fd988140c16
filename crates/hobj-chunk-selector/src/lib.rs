//! Heap-based chunk selection for a blob store.
//!
//! Disk space is carved into fixed-size chunks. Chunks are grouped into
//! placement groups (PGs), each bound to one physical device, and every write
//! goes to the chunk of its PG with the most free blocks. This crate keeps
//! the idle pools as max-heaps, tracks which chunks are checked out, maps a
//! PG's stable virtual chunk numbers to real chunk ids, and ranks chunks for
//! garbage collection.
//!
//! Everything here is in memory; persistence of PG records and chunk
//! occupancy belongs to the caller.

pub mod chunk;
pub mod config;
mod defrag;
pub mod heap;
pub mod hints;
mod recovery;
pub mod selector;
pub mod vchunk;

pub use chunk::{Chunk, ChunkInfo};
pub use config::ChunkSelectorConfig;
pub use heap::{ChunkHeap, ChunkPriorityQueue, DefragHeap, HeapKey, VChunkHeap};
pub use hints::BlkAllocHints;
pub use selector::HeapChunkSelector;
pub use vchunk::VChunkMap;
