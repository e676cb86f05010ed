//! Block device adapter for the log engine.
//!
//! The engine talks to storage through [`BlockDevice`], a narrow capability
//! interface over one fixed-size file: aligned positioned reads and writes,
//! flush, trim, allocation queries and sparse/priority hints. Absent blocks
//! of a sparse file read as zeros and are treated as holes by the engine,
//! never as errors.

use async_trait::async_trait;
use ringlog_common::LogError;

pub mod backend;
pub mod fault;
pub mod file;

pub use backend::{FileBackend, StorageBackend};
pub use fault::FaultDevice;
pub use file::FileDevice;

/// Priority hint attached to device writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoPriority {
    Low,
    Normal,
    High,
}

/// One allocated byte range of the underlying file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocatedRange {
    pub offset: u64,
    pub len: u64,
}

/// Aligned async access to one log file.
///
/// All offsets and lengths are multiples of [`ringlog_common::BLOCK_SIZE`].
/// Implementations must preserve request identity so a decorator (the test
/// fault injector) can observe and modify individual requests.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Read `len` bytes at `offset`. Holes in a sparse file come back as
    /// zeros; the result is always exactly `len` bytes.
    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, LogError>;

    /// Write `buf` at `offset`.
    async fn write(&self, offset: u64, buf: &[u8], priority: IoPriority) -> Result<(), LogError>;

    /// Make all acknowledged writes durable.
    async fn flush(&self) -> Result<(), LogError>;

    /// Mark a byte range as discardable. Subsequent reads of the range
    /// return zeros.
    async fn trim(&self, offset: u64, len: u64) -> Result<(), LogError>;

    /// Report which parts of the given range are backed by allocated file
    /// space.
    async fn query_allocations(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<Vec<AllocatedRange>, LogError>;

    /// Default priority applied to writes issued without an explicit hint.
    fn set_priority_hint(&self, priority: IoPriority);

    /// Toggle sparse-file behavior.
    async fn set_sparse(&self, sparse: bool) -> Result<(), LogError>;

    /// Fixed size of the underlying file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reject offsets or lengths that are not block multiples.
pub(crate) fn check_alignment(offset: u64, len: u64) -> Result<(), LogError> {
    if offset % ringlog_common::BLOCK_SIZE as u64 != 0 || len % ringlog_common::BLOCK_SIZE as u64 != 0 {
        return Err(LogError::InvalidParameter("unaligned device access"));
    }
    Ok(())
}
