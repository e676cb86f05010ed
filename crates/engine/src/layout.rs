use std::sync::Arc;

use ringlog_common::{
    LogError, LogId, LogSignature, Lsn, MasterBlock, RecordHeader, BLOCK_SIZE,
    RECORD_HEADER_SIZE,
};
use ringlog_device::{BlockDevice, IoPriority};

/// First byte of the circular LSN region (right after the two masters).
pub const LOG_REGION_START: u64 = 2 * BLOCK_SIZE as u64;

/// Circular LSN-to-file-offset mapping. The wrap is purely a file-offset
/// artifact; LSN arithmetic never wraps.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub lsn_space: u64,
}

/// One contiguous file range of a (possibly wrapped) record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub file_offset: u64,
    pub len: u64,
}

impl Geometry {
    pub fn from_master(master: &MasterBlock) -> Self {
        Self {
            lsn_space: master.log_file_lsn_space,
        }
    }

    pub fn file_offset(&self, lsn: Lsn) -> u64 {
        LOG_REGION_START + lsn % self.lsn_space
    }

    /// Map `[lsn, lsn + len)` onto one or two file extents. Two extents
    /// mean the range wraps the region end.
    pub fn extents(&self, lsn: Lsn, len: u64) -> (Extent, Option<Extent>) {
        debug_assert!(len <= self.lsn_space);
        let start = self.file_offset(lsn);
        let to_end = LOG_REGION_START + self.lsn_space - start;
        if len <= to_end {
            (
                Extent {
                    file_offset: start,
                    len,
                },
                None,
            )
        } else {
            (
                Extent {
                    file_offset: start,
                    len: to_end,
                },
                Some(Extent {
                    file_offset: LOG_REGION_START,
                    len: len - to_end,
                }),
            )
        }
    }
}

/// Record-granular I/O over one log device: framing, checksums, wrap
/// splitting, and structural validation of headers against the master
/// block's identity fields.
pub struct RecordIo {
    pub device: Arc<dyn BlockDevice>,
    pub geom: Geometry,
    pub log_id: LogId,
    pub signature: LogSignature,
    /// Upper bound for structural size sanity checks.
    pub max_framed_size: u64,
}

impl RecordIo {
    pub fn new(device: Arc<dyn BlockDevice>, master: &MasterBlock) -> Self {
        Self {
            device,
            geom: Geometry::from_master(master),
            log_id: master.log_id,
            signature: master.log_signature,
            max_framed_size: master.max_record_size.max(master.max_checkpoint_record_size) as u64,
        }
    }

    /// Structural checks that do not require reading the whole record: the
    /// header must belong to this log and to this file position, and its
    /// sizes must be coherent. Failing any of these means "absent", never
    /// "corrupt retry".
    pub fn plausible_header(&self, header: &RecordHeader, at_offset: u64) -> bool {
        header.log_signature == self.signature
            && header.log_id == self.log_id
            && self.geom.file_offset(header.lsn) == at_offset
            && header.io_buffer_size as u64 % BLOCK_SIZE as u64 == 0
            && header.framed_size() <= self.max_framed_size
            && header.framed_size() <= self.geom.lsn_space
    }

    /// Read and structurally validate the header block at `lsn`. The
    /// checksum is not verified here (it covers the metadata as well); use
    /// [`RecordIo::read_header_and_metadata`] for that.
    pub async fn read_header(&self, lsn: Lsn) -> Result<Option<RecordHeader>, LogError> {
        let offset = self.geom.file_offset(lsn);
        let block = self.device.read(offset, BLOCK_SIZE).await?;
        Ok(RecordHeader::decode(&block).filter(|h| self.plausible_header(h, offset)))
    }

    /// Read the header + metadata region at `lsn` and verify the record
    /// checksum. Returns the header and the metadata bytes, or `None` for
    /// any structural fault.
    pub async fn read_header_and_metadata(
        &self,
        lsn: Lsn,
    ) -> Result<Option<(RecordHeader, Vec<u8>)>, LogError> {
        let header = match self.read_header(lsn).await? {
            Some(h) => h,
            None => return Ok(None),
        };
        let hm_size = header.header_and_metadata_size();
        let bytes = self.read_range(lsn, hm_size).await?;
        let meta_start = RECORD_HEADER_SIZE;
        let meta_end = meta_start + header.metadata_size as usize;
        if meta_end > bytes.len() {
            return Ok(None);
        }
        let metadata = bytes[meta_start..meta_end].to_vec();
        if !header.verify_checksum(&metadata) {
            return Ok(None);
        }
        Ok(Some((header, metadata)))
    }

    /// Read a validated record's payload region.
    pub async fn read_payload(&self, header: &RecordHeader) -> Result<Vec<u8>, LogError> {
        if header.io_buffer_size == 0 {
            return Ok(Vec::new());
        }
        let payload_lsn = header.lsn + header.header_and_metadata_size();
        self.read_range(payload_lsn, header.io_buffer_size as u64)
            .await
    }

    /// Read an arbitrary block-aligned LSN range, joining wrapped extents.
    pub async fn read_range(&self, lsn: Lsn, len: u64) -> Result<Vec<u8>, LogError> {
        let (first, second) = self.geom.extents(lsn, len);
        let mut bytes = self.device.read(first.file_offset, first.len as usize).await?;
        if let Some(second) = second {
            let tail = self
                .device
                .read(second.file_offset, second.len as usize)
                .await?;
            bytes.extend_from_slice(&tail);
        }
        Ok(bytes)
    }

    /// Frame and write one record at `header.lsn`: seal the checksum, pad
    /// the header + metadata region to a block boundary, append the payload
    /// and issue one device write per extent (two when the record wraps),
    /// then flush.
    pub async fn write_record(
        &self,
        header: &mut RecordHeader,
        metadata: &[u8],
        payload: &[u8],
        priority: IoPriority,
    ) -> Result<(), LogError> {
        debug_assert_eq!(metadata.len(), header.metadata_size as usize);
        debug_assert_eq!(payload.len(), header.io_buffer_size as usize);
        header.seal(metadata);

        let hm_size = header.header_and_metadata_size() as usize;
        let mut buf = Vec::with_capacity(hm_size + payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(metadata);
        buf.resize(hm_size, 0);
        buf.extend_from_slice(payload);

        let (first, second) = self.geom.extents(header.lsn, buf.len() as u64);
        self.device
            .write(first.file_offset, &buf[..first.len as usize], priority)
            .await?;
        if let Some(second) = second {
            self.device
                .write(second.file_offset, &buf[first.len as usize..], priority)
                .await?;
        }
        self.device.flush().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Master block I/O
// ---------------------------------------------------------------------------

/// Write both master copies, A then B, with a flush between so at least one
/// is intact at every instant.
pub async fn write_masters(
    device: &Arc<dyn BlockDevice>,
    master: &MasterBlock,
) -> Result<(), LogError> {
    let encoded = master.encode();
    device.write(0, &encoded, IoPriority::High).await?;
    device.flush().await?;
    device
        .write(BLOCK_SIZE as u64, &encoded, IoPriority::High)
        .await?;
    device.flush().await?;
    Ok(())
}

/// Outcome of master-block validation: the surviving master plus which
/// copies validated.
pub struct MasterReadResult {
    pub master: MasterBlock,
    pub copy_a_valid: bool,
    pub copy_b_valid: bool,
}

/// Read both masters; either validating is sufficient. Neither validating
/// is `CorruptLog`.
pub async fn read_masters(device: &Arc<dyn BlockDevice>) -> Result<MasterReadResult, LogError> {
    let block_a = device.read(0, BLOCK_SIZE).await?;
    let block_b = device.read(BLOCK_SIZE as u64, BLOCK_SIZE).await?;
    let a = MasterBlock::decode(&block_a);
    let b = MasterBlock::decode(&block_b);
    let (copy_a_valid, copy_b_valid) = (a.is_some(), b.is_some());
    let master = match (a, b) {
        (Some(a), Some(b)) => {
            if a != b {
                return Err(LogError::CorruptLog(
                    "master blocks disagree".to_string(),
                ));
            }
            a
        }
        (Some(a), None) => a,
        (None, Some(b)) => b,
        (None, None) => {
            return Err(LogError::CorruptLog(
                "neither master block validates".to_string(),
            ))
        }
    };
    if master.log_file_size != device.len() {
        return Err(LogError::CorruptLog(format!(
            "master records file size {} but device is {}",
            master.log_file_size,
            device.len()
        )));
    }
    Ok(MasterReadResult {
        master,
        copy_a_valid,
        copy_b_valid,
    })
}
