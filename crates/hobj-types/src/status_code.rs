/// Status code type alias.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Chunk selector status codes (12xxx).
pub mod ChunkSelectorCode {
    use super::status_code_t;

    pub const UNKNOWN_CHUNK: status_code_t = 12000;
    pub const UNKNOWN_PG: status_code_t = 12001;
    pub const UNKNOWN_DEVICE: status_code_t = 12002;
    pub const NO_SPACE: status_code_t = 12010;
    pub const CHUNK_EXISTS: status_code_t = 12020;
    pub const PG_EXISTS: status_code_t = 12021;
    pub const CHUNK_BUSY: status_code_t = 12022;
    pub const CHUNK_NOT_BUSY: status_code_t = 12023;
    pub const CHUNK_NOT_OWNED: status_code_t = 12024;
    pub const CHUNK_CLAIMED: status_code_t = 12025;
    pub const CHUNK_SIZE_MISMATCH: status_code_t = 12026;
    pub const CROSS_DEVICE_PG: status_code_t = 12027;
    pub const PG_NOT_RECOVERED: status_code_t = 12028;
    pub const RECOVERY_OUT_OF_ORDER: status_code_t = 12029;
}

/// Caller-facing error taxonomy.
///
/// Every code maps onto one class so callers can branch on the kind of
/// failure without matching individual codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Ok,
    /// An unknown device, PG or chunk id was passed in.
    NotFound,
    /// Capacity could not satisfy the request.
    NoSpace,
    /// A caller contract was broken: double release, wrong owner, recovery
    /// steps out of order.
    InvalidState,
    InvalidArg,
    Other,
}

/// Map a status code onto the [`ErrorClass`] taxonomy.
pub fn error_class(code: status_code_t) -> ErrorClass {
    use ChunkSelectorCode as C;
    match code {
        StatusCode::OK => ErrorClass::Ok,
        C::UNKNOWN_CHUNK | C::UNKNOWN_PG | C::UNKNOWN_DEVICE => ErrorClass::NotFound,
        C::NO_SPACE => ErrorClass::NoSpace,
        C::CHUNK_EXISTS
        | C::PG_EXISTS
        | C::CHUNK_BUSY
        | C::CHUNK_NOT_BUSY
        | C::CHUNK_NOT_OWNED
        | C::CHUNK_CLAIMED
        | C::CROSS_DEVICE_PG
        | C::PG_NOT_RECOVERED
        | C::RECOVERY_OUT_OF_ORDER => ErrorClass::InvalidState,
        StatusCode::INVALID_ARG | StatusCode::INVALID_CONFIG | C::CHUNK_SIZE_MISMATCH => {
            ErrorClass::InvalidArg
        }
        _ => ErrorClass::Other,
    }
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        // ChunkSelector
        ChunkSelectorCode::UNKNOWN_CHUNK => "ChunkSelector::UnknownChunk",
        ChunkSelectorCode::UNKNOWN_PG => "ChunkSelector::UnknownPg",
        ChunkSelectorCode::UNKNOWN_DEVICE => "ChunkSelector::UnknownDevice",
        ChunkSelectorCode::NO_SPACE => "ChunkSelector::NoSpace",
        ChunkSelectorCode::CHUNK_EXISTS => "ChunkSelector::ChunkExists",
        ChunkSelectorCode::PG_EXISTS => "ChunkSelector::PgExists",
        ChunkSelectorCode::CHUNK_BUSY => "ChunkSelector::ChunkBusy",
        ChunkSelectorCode::CHUNK_NOT_BUSY => "ChunkSelector::ChunkNotBusy",
        ChunkSelectorCode::CHUNK_NOT_OWNED => "ChunkSelector::ChunkNotOwned",
        ChunkSelectorCode::CHUNK_CLAIMED => "ChunkSelector::ChunkClaimed",
        ChunkSelectorCode::CHUNK_SIZE_MISMATCH => "ChunkSelector::ChunkSizeMismatch",
        ChunkSelectorCode::CROSS_DEVICE_PG => "ChunkSelector::CrossDevicePg",
        ChunkSelectorCode::PG_NOT_RECOVERED => "ChunkSelector::PgNotRecovered",
        ChunkSelectorCode::RECOVERY_OUT_OF_ORDER => "ChunkSelector::RecoveryOutOfOrder",

        _ => "UnknownStatusCode",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_class() {
        assert_eq!(error_class(StatusCode::OK), ErrorClass::Ok);
        assert_eq!(error_class(ChunkSelectorCode::UNKNOWN_PG), ErrorClass::NotFound);
        assert_eq!(error_class(ChunkSelectorCode::UNKNOWN_DEVICE), ErrorClass::NotFound);
        assert_eq!(error_class(ChunkSelectorCode::NO_SPACE), ErrorClass::NoSpace);
        assert_eq!(error_class(ChunkSelectorCode::CHUNK_NOT_BUSY), ErrorClass::InvalidState);
        assert_eq!(
            error_class(ChunkSelectorCode::RECOVERY_OUT_OF_ORDER),
            ErrorClass::InvalidState
        );
        assert_eq!(error_class(StatusCode::INVALID_ARG), ErrorClass::InvalidArg);
        assert_eq!(error_class(StatusCode::FOUND_BUG), ErrorClass::Other);
    }

    #[test]
    fn test_to_string() {
        assert_eq!(to_string(StatusCode::OK), "OK");
        assert_eq!(to_string(StatusCode::INVALID_ARG), "InvalidArg");
        assert_eq!(to_string(ChunkSelectorCode::CHUNK_BUSY), "ChunkSelector::ChunkBusy");
        assert_eq!(to_string(12345), "UnknownStatusCode");
    }
}
