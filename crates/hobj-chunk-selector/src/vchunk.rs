//! Virtual/real chunk translation for one placement group.
//!
//! Blob locations are persisted as `(virtual chunk, offset)`. A PG's virtual
//! numbering is the order its chunks were selected at creation, and the same
//! order is what gets persisted in the PG record, so replaying that record
//! rebuilds an identical map even when the real chunk ids were discovered in
//! a different order.

use std::collections::HashMap;

use hobj_types::{ChunkNum, Result, StatusCode, VChunkNum, make_error_msg};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VChunkMap {
    // Index is the virtual chunk number.
    v2r: Vec<ChunkNum>,
    r2v: HashMap<ChunkNum, VChunkNum>,
}

impl VChunkMap {
    /// Build the map from real chunk ids in virtual order.
    pub fn new(chunks: Vec<ChunkNum>) -> Result<Self> {
        if chunks.len() > usize::from(u16::MAX) + 1 {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                format!("{} chunks exceed the virtual chunk id space", chunks.len()),
            );
        }
        let mut r2v = HashMap::with_capacity(chunks.len());
        for (v, &r) in chunks.iter().enumerate() {
            if r2v.insert(r, VChunkNum(v as u16)).is_some() {
                return make_error_msg(
                    StatusCode::INVALID_ARG,
                    format!("chunk {} listed twice", r),
                );
            }
        }
        Ok(Self { v2r: chunks, r2v })
    }

    pub fn to_real(&self, v: VChunkNum) -> Option<ChunkNum> {
        self.v2r.get(v.as_usize()).copied()
    }

    pub fn to_virtual(&self, r: ChunkNum) -> Option<VChunkNum> {
        self.r2v.get(&r).copied()
    }

    pub fn contains(&self, r: ChunkNum) -> bool {
        self.r2v.contains_key(&r)
    }

    /// Real chunk ids in virtual order.
    pub fn chunks(&self) -> &[ChunkNum] {
        &self.v2r
    }

    pub fn iter(&self) -> impl Iterator<Item = (VChunkNum, ChunkNum)> + '_ {
        self.v2r
            .iter()
            .enumerate()
            .map(|(v, &r)| (VChunkNum(v as u16), r))
    }

    pub fn len(&self) -> usize {
        self.v2r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v2r.is_empty()
    }

    /// Whether both directions are exact inverses of each other.
    pub fn check(&self) -> bool {
        self.v2r.len() == self.r2v.len()
            && self
                .iter()
                .all(|(v, r)| self.r2v.get(&r).copied() == Some(v))
    }
}
