strong_type!(
    /// Real chunk id assigned by the device layer. Stable for the lifetime of
    /// the attached device, but not guaranteed to be discovered in the same
    /// order across restarts or replicas.
    ChunkNum,
    u16
);
strong_type!(
    /// PG-local ordinal of a chunk. This is the value encoded into blob
    /// locations, so it must survive restarts unchanged.
    VChunkNum,
    u16
);
strong_type!(PgId, u16);
strong_type!(DevId, u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_num() {
        let c = ChunkNum(17);
        assert_eq!(*c, 17u16);
        assert_eq!(format!("{:?}", c), "ChunkNum(17)");
    }

    #[test]
    fn test_vchunk_num_indexing() {
        let chunks = [ChunkNum(40), ChunkNum(41), ChunkNum(42)];
        assert_eq!(chunks[VChunkNum(2).as_usize()], ChunkNum(42));
    }

    #[test]
    fn test_dev_id_conversion() {
        let d: DevId = 3u32.into();
        let raw: u32 = d.into();
        assert_eq!(raw, 3);
    }

    #[test]
    fn test_pg_id_serde() {
        let pg = PgId(12);
        let json = serde_json::to_string(&pg).unwrap();
        assert_eq!(json, "12");
        let parsed: PgId = serde_json::from_str("12").unwrap();
        assert_eq!(parsed, pg);
    }
}
