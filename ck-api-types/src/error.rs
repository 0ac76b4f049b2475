use thiserror::Error;

/// The clone engine's error taxonomy.
///
/// Every fallible operation inside the engine returns one of these variants
/// (wrapped in `anyhow::Error` at call sites that only need to propagate and
/// log). `begin`/`copy`/`apply`/`end` translate a `CloneError` into a MySQL
/// `ER_*` code at the outermost boundary; nothing below that boundary should
/// see SQL-layer error codes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloneError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("cannot open file {0:?}")]
    CannotOpenFile(String),

    #[error("tablespace already exists at {0:?}")]
    TablespaceExists(String),

    #[error("corrupt page: {0}")]
    CorruptPage(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("query interrupted")]
    QueryInterrupted,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("too many concurrent clones")]
    TooManyConcurrent,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CloneError {
    /// First-non-network-error-wins propagation policy: a
    /// network error may be overwritten by any later, more specific error,
    /// but never the other way around.
    pub fn is_network(&self) -> bool {
        matches!(self, CloneError::NetworkError(_))
    }

    /// Whether a fresh error should replace a stored one under
    /// `TaskManager::set_error` (the crate is ck-datastore; this type stays
    /// abstract over it to avoid a dependency cycle).
    pub fn supersedes(&self, existing: &CloneError) -> bool {
        existing.is_network() && !self.is_network()
    }

    /// Maps the internal taxonomy onto the small set of MySQL `ER_*` codes
    /// that `begin`/`copy`/`apply`/`end` are allowed to return.
    pub fn mysql_errno(&self) -> u32 {
        match self {
            CloneError::OutOfMemory => 1037,           // ER_OUTOFMEMORY
            CloneError::InvalidDescriptor(_) => 1007,  // ER_CLONE_PROTOCOL (placeholder slot)
            CloneError::IoError(_) => 29,               // ER_FILE_NOT_FOUND-ish slot
            CloneError::CannotOpenFile(_) => 29,
            CloneError::TablespaceExists(_) => 1813,    // ER_TABLESPACE_EXISTS
            CloneError::CorruptPage(_) => 1877,         // ER_INNODB_CLONE slot
            CloneError::Timeout(_) => 1205,             // ER_LOCK_WAIT_TIMEOUT
            CloneError::QueryInterrupted => 1317,       // ER_QUERY_INTERRUPTED
            CloneError::NetworkError(_) => 2013,        // CR_SERVER_LOST
            CloneError::TooManyConcurrent => 1461,      // ER_TOO_MANY_CONCURRENT_TRXS slot
            CloneError::Internal(_) => 1105,            // ER_UNKNOWN_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_error_is_overwritten_by_fatal() {
        let net = CloneError::NetworkError("reset".into());
        let corrupt = CloneError::CorruptPage("page 4".into());
        assert!(corrupt.supersedes(&net));
        assert!(!net.supersedes(&corrupt));
    }

    #[test]
    fn network_error_does_not_overwrite_network_error() {
        let a = CloneError::NetworkError("a".into());
        let b = CloneError::NetworkError("b".into());
        assert!(!b.supersedes(&a));
    }
}
