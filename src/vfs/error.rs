//! Internal error taxonomy and the single errno conversion point.

use crate::engine::types::EngineError;
use log::{debug, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("no record or directory matches {0}")]
    NotFound(String),
    /// A download cannot fit even after evicting every evictable entry.
    #[error("{needed} bytes do not fit in a cache budget of {budget}")]
    CapacityExceeded { needed: u64, budget: u64 },
    /// The engine reports no size for this record. Never surfaced to the
    /// syscall layer; always converted into a forced full download first.
    #[error("record {0} reports no size")]
    UnknownSize(String),
    /// Record cannot be cached (too large) and cannot be streamed either.
    #[error("record {0} is not streamable")]
    NotStreamable(String),
    /// Read/release on a handle not present in any table.
    #[error("stale handle {0}")]
    StaleHandle(u64),
    #[error("timed out waiting for range response {read_id}")]
    ReadTimeout { read_id: u64 },
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FsError {
    /// Collapse to the nearest POSIX error code. Engine failures downgrade
    /// to ENOENT (behavioral parity with the query layer, which does not
    /// distinguish "does not exist" from "engine malfunctioned"); the
    /// structured error is logged before the information is lost.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound(path) => {
                debug!("not found: {path}");
                libc::ENOENT
            }
            FsError::StaleHandle(fh) => {
                debug!("stale handle {fh}");
                libc::ENOENT
            }
            FsError::Engine(e) => {
                warn!("engine error downgraded to ENOENT: {e}");
                libc::ENOENT
            }
            FsError::UnknownSize(path) => {
                warn!("unresolved unknown-size record {path}");
                libc::ENOENT
            }
            FsError::CapacityExceeded { needed, budget } => {
                debug!("capacity exceeded: need {needed} of {budget}");
                libc::EFBIG
            }
            FsError::NotStreamable(path) => {
                warn!("{path} exceeds the cache budget and cannot be streamed");
                libc::EFBIG
            }
            FsError::ReadTimeout { read_id } => {
                warn!("range response {read_id} never arrived");
                libc::EIO
            }
            FsError::Io(e) => {
                warn!("local I/O error: {e}");
                libc::EIO
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound("/x".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::StaleHandle(9).errno(), libc::ENOENT);
        assert_eq!(
            FsError::Engine(EngineError::Backend("boom".into())).errno(),
            libc::ENOENT
        );
        assert_eq!(
            FsError::CapacityExceeded { needed: 10, budget: 1 }.errno(),
            libc::EFBIG
        );
        assert_eq!(FsError::NotStreamable("/x".into()).errno(), libc::EFBIG);
        assert_eq!(FsError::ReadTimeout { read_id: 1 }.errno(), libc::EIO);
    }
}
