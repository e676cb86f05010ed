use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Log sequence number: a byte position in the log's infinite LSN space.
/// Assigned monotonically; the circular file-offset mapping is a layout
/// concern, LSN arithmetic never wraps.
pub type Lsn = u64;

/// Application sequence number, assigned by the caller per stream.
/// `0` is the null ASN and is never a valid record key.
pub type Asn = u64;

/// Per-record version tag. When two writes share an ASN, the higher
/// version wins.
pub type RecordVersion = u64;

/// Sentinel for "no LSN" (empty stream, unallocated entry).
pub const NO_LSN: Lsn = u64::MAX;

/// All on-disk offsets, record sizes and payload lengths are multiples
/// of this.
pub const BLOCK_SIZE: usize = 4096;

/// Round `n` up to the next block boundary.
pub const fn round_up_to_block(n: u64) -> u64 {
    (n + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64 * BLOCK_SIZE as u64
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifies one log file.
    LogId
);
id_type!(
    /// Identifies one stream within a log.
    StreamId
);
id_type!(
    /// Selects the record verifier used for a stream's payloads.
    StreamType
);

/// The distinguished stream holding physical checkpoint records.
pub const CHECKPOINT_STREAM_ID: StreamId = StreamId(Uuid::from_bytes([0xFF; 16]));

/// Stream type of the checkpoint stream.
pub const CHECKPOINT_STREAM_TYPE: StreamType = StreamType(Uuid::from_bytes([0xFF; 16]));

/// Random per-log signature copied into every record header; lets recovery
/// reject blocks left over from an earlier log that occupied the same file.
pub type LogSignature = [u8; 16];

// ---------------------------------------------------------------------------
// Record state
// ---------------------------------------------------------------------------

/// Lifecycle of an ASN index entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Disposition {
    /// ASN admitted, no LSN assigned yet.
    None,
    /// LSN assigned, device write in flight.
    Pending,
    /// Write acknowledged by the device.
    Persisted,
}

/// On-disk record kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RecordType {
    User = 1,
    PhysicalCheckpoint = 2,
    StreamCheckpoint = 3,
}

impl RecordType {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(RecordType::User),
            2 => Some(RecordType::PhysicalCheckpoint),
            3 => Some(RecordType::StreamCheckpoint),
            _ => None,
        }
    }
}

/// Stream lifecycle as reported by `query_stream_state`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closed,
    Deleted,
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// CRC32 over `parts`, zero-extended to the 8-byte on-disk checksum fields.
pub fn checksum64(parts: &[&[u8]]) -> u64 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize() as u64
}

// ---------------------------------------------------------------------------
// Master block (two copies at file offsets 0 and BLOCK_SIZE)
// ---------------------------------------------------------------------------

pub const MASTER_BLOCK_MAGIC: [u8; 4] = *b"RLGM";
pub const MASTER_BLOCK_VERSION: u32 = 1;

/// Encoded length of the master block fields; the rest of the block is
/// zero padding.
pub const MASTER_BLOCK_ENCODED_LEN: usize = 104;

/// Fixed-layout log file header. Written bit-identically at offsets 0 and
/// `BLOCK_SIZE`; either copy validating is sufficient to open the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasterBlock {
    pub log_id: LogId,
    pub log_signature: LogSignature,
    pub log_file_size: u64,
    pub log_file_lsn_space: u64,
    pub max_record_size: u32,
    pub max_checkpoint_record_size: u32,
    pub max_queued_write_depth: u32,
    pub max_streams: u32,
    pub checkpoint_interval: u64,
    pub min_free_space: u64,
    pub create_timestamp: u64,
}

impl MasterBlock {
    /// Encode into one zero-padded block (little-endian, fixed offsets).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&MASTER_BLOCK_MAGIC);
        buf[4..8].copy_from_slice(&MASTER_BLOCK_VERSION.to_le_bytes());
        buf[8..24].copy_from_slice(self.log_id.as_bytes());
        buf[24..40].copy_from_slice(&self.log_signature);
        buf[40..48].copy_from_slice(&self.log_file_size.to_le_bytes());
        buf[48..56].copy_from_slice(&self.log_file_lsn_space.to_le_bytes());
        buf[56..60].copy_from_slice(&self.max_record_size.to_le_bytes());
        buf[60..64].copy_from_slice(&self.max_checkpoint_record_size.to_le_bytes());
        buf[64..68].copy_from_slice(&self.max_queued_write_depth.to_le_bytes());
        buf[68..72].copy_from_slice(&self.max_streams.to_le_bytes());
        buf[72..80].copy_from_slice(&self.checkpoint_interval.to_le_bytes());
        buf[80..88].copy_from_slice(&self.min_free_space.to_le_bytes());
        buf[88..96].copy_from_slice(&self.create_timestamp.to_le_bytes());
        let crc = checksum64(&[&buf[0..96]]);
        buf[96..104].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode and validate one block. Returns `None` for any structural
    /// fault (wrong magic, version, checksum); callers treat that copy as
    /// absent.
    pub fn decode(block: &[u8]) -> Option<Self> {
        if block.len() < MASTER_BLOCK_ENCODED_LEN {
            return None;
        }
        if block[0..4] != MASTER_BLOCK_MAGIC {
            return None;
        }
        if u32::from_le_bytes(block[4..8].try_into().ok()?) != MASTER_BLOCK_VERSION {
            return None;
        }
        let stored_crc = u64::from_le_bytes(block[96..104].try_into().ok()?);
        if checksum64(&[&block[0..96]]) != stored_crc {
            return None;
        }
        let mut log_signature = [0u8; 16];
        log_signature.copy_from_slice(&block[24..40]);
        Some(MasterBlock {
            log_id: LogId::from_bytes(block[8..24].try_into().ok()?),
            log_signature,
            log_file_size: u64::from_le_bytes(block[40..48].try_into().ok()?),
            log_file_lsn_space: u64::from_le_bytes(block[48..56].try_into().ok()?),
            max_record_size: u32::from_le_bytes(block[56..60].try_into().ok()?),
            max_checkpoint_record_size: u32::from_le_bytes(block[60..64].try_into().ok()?),
            max_queued_write_depth: u32::from_le_bytes(block[64..68].try_into().ok()?),
            max_streams: u32::from_le_bytes(block[68..72].try_into().ok()?),
            checkpoint_interval: u64::from_le_bytes(block[72..80].try_into().ok()?),
            min_free_space: u64::from_le_bytes(block[80..88].try_into().ok()?),
            create_timestamp: u64::from_le_bytes(block[88..96].try_into().ok()?),
        })
    }
}

// ---------------------------------------------------------------------------
// Record header (first block of every record)
// ---------------------------------------------------------------------------

pub const RECORD_HEADER_MAGIC: [u8; 4] = *b"RLGR";

/// Encoded record header length. The header plus metadata is padded to a
/// block boundary; the payload follows block-aligned.
pub const RECORD_HEADER_SIZE: usize = 124;

/// On-disk record header. The checksum covers the encoded header (with the
/// checksum field zeroed) plus the metadata bytes; payloads are re-validated
/// by the stream-type verifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub lsn: Lsn,
    pub prev_lsn_in_stream: Lsn,
    pub highest_completed_lsn: Lsn,
    pub log_id: LogId,
    pub log_signature: LogSignature,
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub record_type: RecordType,
    pub flags: u16,
    pub metadata_size: u32,
    pub io_buffer_size: u32,
    /// Stream truncation point as of write time; meaningful only for
    /// stream-checkpoint records, zero otherwise.
    pub truncation_point: Asn,
    pub checksum: u64,
}

impl RecordHeader {
    /// Encode with the checksum field zeroed; `seal` fills it in.
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut buf = [0u8; RECORD_HEADER_SIZE];
        buf[0..4].copy_from_slice(&RECORD_HEADER_MAGIC);
        buf[4..8].copy_from_slice(&(RECORD_HEADER_SIZE as u32).to_le_bytes());
        buf[8..24].copy_from_slice(&self.log_signature);
        buf[24..32].copy_from_slice(&self.lsn.to_le_bytes());
        buf[32..40].copy_from_slice(&self.prev_lsn_in_stream.to_le_bytes());
        buf[40..48].copy_from_slice(&self.highest_completed_lsn.to_le_bytes());
        buf[48..64].copy_from_slice(self.log_id.as_bytes());
        buf[64..80].copy_from_slice(self.stream_id.as_bytes());
        buf[80..96].copy_from_slice(self.stream_type.as_bytes());
        buf[96..98].copy_from_slice(&(self.record_type as u16).to_le_bytes());
        buf[98..100].copy_from_slice(&self.flags.to_le_bytes());
        buf[100..104].copy_from_slice(&self.metadata_size.to_le_bytes());
        buf[104..108].copy_from_slice(&self.io_buffer_size.to_le_bytes());
        buf[108..116].copy_from_slice(&self.truncation_point.to_le_bytes());
        buf[116..124].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Compute the record checksum over this header and its metadata.
    pub fn seal(&mut self, metadata: &[u8]) {
        self.checksum = 0;
        let encoded = self.encode();
        self.checksum = checksum64(&[&encoded, metadata]);
    }

    /// Verify the sealed checksum against `metadata`.
    pub fn verify_checksum(&self, metadata: &[u8]) -> bool {
        let mut unsealed = self.clone();
        unsealed.checksum = 0;
        let encoded = unsealed.encode();
        checksum64(&[&encoded, metadata]) == self.checksum
    }

    /// Decode a header from the first bytes of a block. Any structural
    /// fault yields `None`; callers treat the block as absent.
    pub fn decode(block: &[u8]) -> Option<Self> {
        if block.len() < RECORD_HEADER_SIZE {
            return None;
        }
        if block[0..4] != RECORD_HEADER_MAGIC {
            return None;
        }
        if u32::from_le_bytes(block[4..8].try_into().ok()?) != RECORD_HEADER_SIZE as u32 {
            return None;
        }
        let mut log_signature = [0u8; 16];
        log_signature.copy_from_slice(&block[8..24]);
        let record_type =
            RecordType::from_u16(u16::from_le_bytes(block[96..98].try_into().ok()?))?;
        Some(RecordHeader {
            log_signature,
            lsn: u64::from_le_bytes(block[24..32].try_into().ok()?),
            prev_lsn_in_stream: u64::from_le_bytes(block[32..40].try_into().ok()?),
            highest_completed_lsn: u64::from_le_bytes(block[40..48].try_into().ok()?),
            log_id: LogId::from_bytes(block[48..64].try_into().ok()?),
            stream_id: StreamId::from_bytes(block[64..80].try_into().ok()?),
            stream_type: StreamType::from_bytes(block[80..96].try_into().ok()?),
            record_type,
            flags: u16::from_le_bytes(block[98..100].try_into().ok()?),
            metadata_size: u32::from_le_bytes(block[100..104].try_into().ok()?),
            io_buffer_size: u32::from_le_bytes(block[104..108].try_into().ok()?),
            truncation_point: u64::from_le_bytes(block[108..116].try_into().ok()?),
            checksum: u64::from_le_bytes(block[116..124].try_into().ok()?),
        })
    }

    /// Bytes occupied by the header + metadata region (block aligned).
    pub fn header_and_metadata_size(&self) -> u64 {
        header_and_metadata_size(self.metadata_size)
    }

    /// Total on-disk bytes of this record.
    pub fn framed_size(&self) -> u64 {
        self.header_and_metadata_size() + self.io_buffer_size as u64
    }
}

/// Bytes occupied by a record's header + metadata region for a given
/// metadata length (block aligned).
pub const fn header_and_metadata_size(metadata_size: u32) -> u64 {
    round_up_to_block(RECORD_HEADER_SIZE as u64 + metadata_size as u64)
}

/// Total on-disk bytes of a record with the given metadata and payload
/// lengths. The payload must itself be a block multiple.
pub const fn framed_record_size(metadata_size: u32, io_buffer_size: u32) -> u64 {
    header_and_metadata_size(metadata_size) + io_buffer_size as u64
}

// ---------------------------------------------------------------------------
// Record verifier: caller-supplied payload validation, keyed by StreamType
// ---------------------------------------------------------------------------

/// Validates a recovered record's payload. Recovery invokes the verifier
/// for every user record it reads; a fault is handled as chaos (the log is
/// truncated at the faulted record).
pub trait RecordVerifier: Send + Sync {
    fn verify(
        &self,
        stream_type: StreamType,
        metadata: &[u8],
        io_buffer: &[u8],
    ) -> Result<(), LogError>;
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log full")]
    LogFull,

    #[error("stale version for ASN {asn}: existing {existing}, attempted {attempted}")]
    StaleVersion {
        asn: Asn,
        existing: RecordVersion,
        attempted: RecordVersion,
    },

    #[error("reservation too small")]
    ReserveTooSmall,

    #[error("not found")]
    NotFound,

    #[error("corrupt log: {0}")]
    CorruptLog(String),

    #[error("record structure fault: {0}")]
    StructureFault(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("resource limit exceeded: {0}")]
    ResourceExhausted(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_master() -> MasterBlock {
        MasterBlock {
            log_id: LogId::new_random(),
            log_signature: *LogId::new_random().as_bytes(),
            log_file_size: 1 << 20,
            log_file_lsn_space: (1 << 20) - 2 * BLOCK_SIZE as u64,
            max_record_size: 1 << 24,
            max_checkpoint_record_size: 1 << 20,
            max_queued_write_depth: 1 << 24,
            max_streams: 64,
            checkpoint_interval: 1 << 26,
            min_free_space: 1 << 25,
            create_timestamp: 1234,
        }
    }

    #[test]
    fn test_master_block_roundtrip() {
        let master = sample_master();
        let encoded = master.encode();
        assert_eq!(encoded.len(), BLOCK_SIZE);
        let decoded = MasterBlock::decode(&encoded).unwrap();
        assert_eq!(decoded, master);
    }

    #[test]
    fn test_master_block_rejects_bit_flip() {
        let master = sample_master();
        let mut encoded = master.encode();
        encoded[41] ^= 0x01;
        assert!(MasterBlock::decode(&encoded).is_none());
    }

    #[test]
    fn test_master_block_rejects_wrong_magic() {
        let master = sample_master();
        let mut encoded = master.encode();
        encoded[0] = b'X';
        assert!(MasterBlock::decode(&encoded).is_none());
    }

    fn sample_header() -> RecordHeader {
        RecordHeader {
            lsn: 8192,
            prev_lsn_in_stream: NO_LSN,
            highest_completed_lsn: 8192,
            log_id: LogId::new_random(),
            log_signature: [7u8; 16],
            stream_id: StreamId::new_random(),
            stream_type: StreamType::new_random(),
            record_type: RecordType::User,
            flags: 0,
            metadata_size: 100,
            io_buffer_size: 4096,
            truncation_point: 0,
            checksum: 0,
        }
    }

    #[test]
    fn test_record_header_roundtrip() {
        let mut header = sample_header();
        let metadata = vec![0xABu8; 100];
        header.seal(&metadata);

        let mut block = vec![0u8; BLOCK_SIZE];
        block[..RECORD_HEADER_SIZE].copy_from_slice(&header.encode());

        let decoded = RecordHeader::decode(&block).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.verify_checksum(&metadata));
        assert!(!decoded.verify_checksum(&metadata[..99]));
    }

    #[test]
    fn test_record_header_rejects_metadata_tamper() {
        let mut header = sample_header();
        let mut metadata = vec![0x11u8; 64];
        header.seal(&metadata);
        metadata[10] ^= 0xFF;
        assert!(!header.verify_checksum(&metadata));
    }

    #[test]
    fn test_framed_sizes() {
        // Header alone fits one block.
        assert_eq!(framed_record_size(0, 0), BLOCK_SIZE as u64);
        // Metadata spilling past the first block adds a block.
        let spill = (BLOCK_SIZE - RECORD_HEADER_SIZE + 1) as u32;
        assert_eq!(framed_record_size(spill, 0), 2 * BLOCK_SIZE as u64);
        // Payload is counted verbatim (already block aligned).
        assert_eq!(
            framed_record_size(10, 3 * BLOCK_SIZE as u32),
            4 * BLOCK_SIZE as u64
        );
    }

    #[test]
    fn test_round_up_to_block() {
        assert_eq!(round_up_to_block(0), 0);
        assert_eq!(round_up_to_block(1), BLOCK_SIZE as u64);
        assert_eq!(round_up_to_block(BLOCK_SIZE as u64), BLOCK_SIZE as u64);
        assert_eq!(
            round_up_to_block(BLOCK_SIZE as u64 + 1),
            2 * BLOCK_SIZE as u64
        );
    }
}
