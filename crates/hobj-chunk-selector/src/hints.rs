use hobj_types::{ChunkNum, DevId, PgId};
use serde::{Deserialize, Serialize};

/// Placement hints passed to [`crate::HeapChunkSelector::select_chunk`].
///
/// `chunk_id` asks for one exact chunk (append locality), `pg_id` asks for
/// the best chunk of that PG. `pdev_id` is carried for callers that route on
/// it; the selector does not consult it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkAllocHints {
    pub pg_id: Option<PgId>,
    pub chunk_id: Option<ChunkNum>,
    pub pdev_id: Option<DevId>,
}

impl BlkAllocHints {
    pub fn for_pg(pg_id: PgId) -> Self {
        Self {
            pg_id: Some(pg_id),
            ..Self::default()
        }
    }

    pub fn for_chunk(chunk_id: ChunkNum) -> Self {
        Self {
            chunk_id: Some(chunk_id),
            ..Self::default()
        }
    }
}
