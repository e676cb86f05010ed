use ringlog_common::{round_up_to_block, LogError, BLOCK_SIZE};

use crate::checkpoint::{PHYSICAL_CHECKPOINT_ENTRY_SIZE, PHYSICAL_CHECKPOINT_HEADER_SIZE};
use ringlog_common::RECORD_HEADER_SIZE;

/// Sizing knobs fixed at log creation. All but
/// `stream_checkpoint_record_interval` are persisted in the master blocks;
/// that one is a runtime tuning value re-suppliable at every open.
#[derive(Clone, Debug)]
pub struct LogOptions {
    /// Total file size including the two master blocks.
    pub log_file_size: u64,
    /// Largest framed user record.
    pub max_record_size: u32,
    /// Largest framed checkpoint record (physical or one stream-checkpoint
    /// segment).
    pub max_checkpoint_record_size: u32,
    /// Upper bound on `NextLsnToWrite - HighestCompletedLsn`; bounds the
    /// chaos region recovery has to tolerate.
    pub max_queued_write_depth: u32,
    pub max_streams: u32,
    /// Physical checkpoint cadence in LSN bytes.
    pub checkpoint_interval: u64,
    /// Free-space floor reserved for checkpoint records.
    pub min_free_space: u64,
    /// Emit a stream checkpoint after this many user records.
    pub stream_checkpoint_record_interval: u32,
    /// Create the file sparse.
    pub sparse: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_file_size: 256 << 20,
            max_record_size: 16 << 20,
            max_checkpoint_record_size: 1 << 20,
            max_queued_write_depth: 16 << 20,
            max_streams: 64,
            checkpoint_interval: 64 << 20,
            min_free_space: 2 * (16 << 20),
            stream_checkpoint_record_interval: 1024,
            sparse: true,
        }
    }
}

impl LogOptions {
    /// Check internal consistency; every size must be block aligned and the
    /// pieces must fit together.
    pub fn validate(&self) -> Result<(), LogError> {
        let block = BLOCK_SIZE as u64;
        if self.log_file_size % block != 0
            || self.max_record_size as u64 % block != 0
            || self.max_checkpoint_record_size as u64 % block != 0
            || self.max_queued_write_depth as u64 % block != 0
        {
            return Err(LogError::InvalidParameter("sizes must be block aligned"));
        }
        let lsn_space = self.log_file_size.saturating_sub(2 * block);
        if lsn_space < 16 * block {
            return Err(LogError::InvalidParameter("log file too small"));
        }
        if self.max_record_size == 0 || self.max_checkpoint_record_size == 0 {
            return Err(LogError::InvalidParameter("zero record size limit"));
        }
        if (self.max_queued_write_depth as u64) < self.max_record_size as u64 {
            return Err(LogError::InvalidParameter(
                "queued write depth below max record size",
            ));
        }
        if self.min_free_space + self.max_record_size as u64 >= lsn_space {
            return Err(LogError::InvalidParameter("min free space too large"));
        }
        if self.max_streams == 0 {
            return Err(LogError::InvalidParameter("max streams is zero"));
        }
        // Every live stream descriptor must fit in one physical checkpoint
        // record.
        let physical_payload = PHYSICAL_CHECKPOINT_HEADER_SIZE as u64
            + self.max_streams as u64 * PHYSICAL_CHECKPOINT_ENTRY_SIZE as u64;
        if round_up_to_block(RECORD_HEADER_SIZE as u64 + physical_payload)
            > self.max_checkpoint_record_size as u64
        {
            return Err(LogError::InvalidParameter(
                "max streams exceed checkpoint record budget",
            ));
        }
        if self.stream_checkpoint_record_interval == 0 {
            return Err(LogError::InvalidParameter(
                "stream checkpoint interval is zero",
            ));
        }
        Ok(())
    }

    /// LSN-region bytes for this file size.
    pub fn lsn_space(&self) -> u64 {
        (self.log_file_size - 2 * BLOCK_SIZE as u64) / BLOCK_SIZE as u64 * BLOCK_SIZE as u64
    }
}
