use ringlog_common::{Asn, LogError, Lsn, RecordVersion, StreamId, StreamType};

use crate::asn_index::AsnIndex;
use crate::lsn_index::LsnIndex;

// ---------------------------------------------------------------------------
// Physical checkpoint payload: {count, StreamInfo[count]}
// ---------------------------------------------------------------------------

pub const PHYSICAL_CHECKPOINT_HEADER_SIZE: usize = 4;
pub const PHYSICAL_CHECKPOINT_ENTRY_SIZE: usize = 56;

/// Per-stream bounds recorded in a physical checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    /// Lowest retained LSN of the stream (`NO_LSN` when empty).
    pub lowest_lsn: Lsn,
    /// LSN of the stream's last record (`NO_LSN` when empty).
    pub highest_lsn: Lsn,
    /// LSN one past the stream's last record (`NO_LSN` when empty).
    pub next_lsn: Lsn,
}

pub fn encode_physical_checkpoint(streams: &[StreamDescriptor]) -> Vec<u8> {
    let mut buf =
        Vec::with_capacity(PHYSICAL_CHECKPOINT_HEADER_SIZE + streams.len() * PHYSICAL_CHECKPOINT_ENTRY_SIZE);
    buf.extend_from_slice(&(streams.len() as u32).to_le_bytes());
    for s in streams {
        buf.extend_from_slice(s.stream_id.as_bytes());
        buf.extend_from_slice(s.stream_type.as_bytes());
        buf.extend_from_slice(&s.lowest_lsn.to_le_bytes());
        buf.extend_from_slice(&s.highest_lsn.to_le_bytes());
        buf.extend_from_slice(&s.next_lsn.to_le_bytes());
    }
    buf
}

pub fn decode_physical_checkpoint(buf: &[u8]) -> Result<Vec<StreamDescriptor>, LogError> {
    if buf.len() < PHYSICAL_CHECKPOINT_HEADER_SIZE {
        return Err(LogError::CorruptLog(
            "physical checkpoint payload too short".to_string(),
        ));
    }
    let count = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let need = PHYSICAL_CHECKPOINT_HEADER_SIZE + count * PHYSICAL_CHECKPOINT_ENTRY_SIZE;
    if buf.len() < need {
        return Err(LogError::CorruptLog(
            "physical checkpoint payload truncated".to_string(),
        ));
    }
    let mut streams = Vec::with_capacity(count);
    let mut at = PHYSICAL_CHECKPOINT_HEADER_SIZE;
    for _ in 0..count {
        let e = &buf[at..at + PHYSICAL_CHECKPOINT_ENTRY_SIZE];
        streams.push(StreamDescriptor {
            stream_id: StreamId::from_bytes(e[0..16].try_into().unwrap()),
            stream_type: StreamType::from_bytes(e[16..32].try_into().unwrap()),
            lowest_lsn: u64::from_le_bytes(e[32..40].try_into().unwrap()),
            highest_lsn: u64::from_le_bytes(e[40..48].try_into().unwrap()),
            next_lsn: u64::from_le_bytes(e[48..56].try_into().unwrap()),
        });
        at += PHYSICAL_CHECKPOINT_ENTRY_SIZE;
    }
    Ok(streams)
}

// ---------------------------------------------------------------------------
// Stream checkpoint segments
//
// Both per-stream indexes serialize into a chain of records; each record
// carries one segment: a small header followed by fixed-size entries of one
// kind. The chain is linked through `PrevLsnInLogStream` and is only valid
// as a whole; recovery discards partial chains as a unit.
// ---------------------------------------------------------------------------

pub const SEGMENT_HEADER_SIZE: usize = 16;
pub const ASN_SEGMENT_ENTRY_SIZE: usize = 28;
pub const LSN_SEGMENT_ENTRY_SIZE: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    AsnEntries = 1,
    LsnEntries = 2,
}

impl SegmentKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            1 => Some(SegmentKind::AsnEntries),
            2 => Some(SegmentKind::LsnEntries),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub kind: SegmentKind,
    pub segment_index: u32,
    pub segment_count: u32,
    pub entry_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializedAsnEntry {
    pub asn: Asn,
    pub version: RecordVersion,
    pub lsn: Lsn,
    pub io_buffer_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SerializedLsnEntry {
    pub lsn: Lsn,
    pub header_and_metadata_size: u32,
    pub io_buffer_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SegmentPayload {
    Asn(Vec<SerializedAsnEntry>),
    Lsn(Vec<SerializedLsnEntry>),
}

/// Serialize both indexes into segment payloads, each at most
/// `max_segment_payload` bytes. Only `Persisted` ASN entries are emitted.
/// An empty stream still yields one (empty) segment so the chain records
/// the truncation point.
pub fn build_stream_checkpoint_segments(
    asn_index: &AsnIndex,
    lsn_index: &LsnIndex,
    max_segment_payload: usize,
) -> Vec<Vec<u8>> {
    assert!(max_segment_payload > SEGMENT_HEADER_SIZE + ASN_SEGMENT_ENTRY_SIZE);
    let asn_per_segment = (max_segment_payload - SEGMENT_HEADER_SIZE) / ASN_SEGMENT_ENTRY_SIZE;
    let lsn_per_segment = (max_segment_payload - SEGMENT_HEADER_SIZE) / LSN_SEGMENT_ENTRY_SIZE;

    let asn_entries: Vec<&crate::asn_index::AsnEntry> = asn_index.persisted().collect();
    let lsn_entries: Vec<&crate::lsn_index::LsnEntry> = lsn_index.iter().collect();

    let asn_segments = asn_entries.len().div_ceil(asn_per_segment).max(1);
    let lsn_segments = if lsn_entries.is_empty() {
        0
    } else {
        lsn_entries.len().div_ceil(lsn_per_segment)
    };
    let total = (asn_segments + lsn_segments) as u32;

    let mut out = Vec::with_capacity(total as usize);
    let mut segment_index = 0u32;

    for chunk_ix in 0..asn_segments {
        let chunk = asn_entries
            .iter()
            .skip(chunk_ix * asn_per_segment)
            .take(asn_per_segment);
        let chunk: Vec<_> = chunk.collect();
        let mut buf =
            Vec::with_capacity(SEGMENT_HEADER_SIZE + chunk.len() * ASN_SEGMENT_ENTRY_SIZE);
        encode_segment_header(
            &mut buf,
            SegmentKind::AsnEntries,
            segment_index,
            total,
            chunk.len() as u32,
        );
        for e in chunk {
            buf.extend_from_slice(&e.asn.to_le_bytes());
            buf.extend_from_slice(&e.version.to_le_bytes());
            buf.extend_from_slice(&e.lsn.to_le_bytes());
            buf.extend_from_slice(&e.io_buffer_size.to_le_bytes());
        }
        out.push(buf);
        segment_index += 1;
    }

    for chunk_ix in 0..lsn_segments {
        let chunk: Vec<_> = lsn_entries
            .iter()
            .skip(chunk_ix * lsn_per_segment)
            .take(lsn_per_segment)
            .collect();
        let mut buf =
            Vec::with_capacity(SEGMENT_HEADER_SIZE + chunk.len() * LSN_SEGMENT_ENTRY_SIZE);
        encode_segment_header(
            &mut buf,
            SegmentKind::LsnEntries,
            segment_index,
            total,
            chunk.len() as u32,
        );
        for e in chunk {
            buf.extend_from_slice(&e.lsn.to_le_bytes());
            buf.extend_from_slice(&e.header_and_metadata_size.to_le_bytes());
            buf.extend_from_slice(&e.io_buffer_size.to_le_bytes());
        }
        out.push(buf);
        segment_index += 1;
    }

    out
}

fn encode_segment_header(
    buf: &mut Vec<u8>,
    kind: SegmentKind,
    segment_index: u32,
    segment_count: u32,
    entry_count: u32,
) {
    buf.extend_from_slice(&(kind as u32).to_le_bytes());
    buf.extend_from_slice(&segment_index.to_le_bytes());
    buf.extend_from_slice(&segment_count.to_le_bytes());
    buf.extend_from_slice(&entry_count.to_le_bytes());
}

pub fn decode_segment(buf: &[u8]) -> Result<(SegmentHeader, SegmentPayload), LogError> {
    if buf.len() < SEGMENT_HEADER_SIZE {
        return Err(LogError::CorruptLog(
            "stream checkpoint segment too short".to_string(),
        ));
    }
    let kind = SegmentKind::from_u32(u32::from_le_bytes(buf[0..4].try_into().unwrap())).ok_or_else(
        || LogError::CorruptLog("unknown stream checkpoint segment kind".to_string()),
    )?;
    let header = SegmentHeader {
        kind,
        segment_index: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        segment_count: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        entry_count: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
    };
    let entry_size = match kind {
        SegmentKind::AsnEntries => ASN_SEGMENT_ENTRY_SIZE,
        SegmentKind::LsnEntries => LSN_SEGMENT_ENTRY_SIZE,
    };
    let need = SEGMENT_HEADER_SIZE + header.entry_count as usize * entry_size;
    if buf.len() < need {
        return Err(LogError::CorruptLog(
            "stream checkpoint segment truncated".to_string(),
        ));
    }
    let mut at = SEGMENT_HEADER_SIZE;
    let payload = match kind {
        SegmentKind::AsnEntries => {
            let mut entries = Vec::with_capacity(header.entry_count as usize);
            for _ in 0..header.entry_count {
                let e = &buf[at..at + ASN_SEGMENT_ENTRY_SIZE];
                entries.push(SerializedAsnEntry {
                    asn: u64::from_le_bytes(e[0..8].try_into().unwrap()),
                    version: u64::from_le_bytes(e[8..16].try_into().unwrap()),
                    lsn: u64::from_le_bytes(e[16..24].try_into().unwrap()),
                    io_buffer_size: u32::from_le_bytes(e[24..28].try_into().unwrap()),
                });
                at += ASN_SEGMENT_ENTRY_SIZE;
            }
            SegmentPayload::Asn(entries)
        }
        SegmentKind::LsnEntries => {
            let mut entries = Vec::with_capacity(header.entry_count as usize);
            for _ in 0..header.entry_count {
                let e = &buf[at..at + LSN_SEGMENT_ENTRY_SIZE];
                entries.push(SerializedLsnEntry {
                    lsn: u64::from_le_bytes(e[0..8].try_into().unwrap()),
                    header_and_metadata_size: u32::from_le_bytes(e[8..12].try_into().unwrap()),
                    io_buffer_size: u32::from_le_bytes(e[12..16].try_into().unwrap()),
                });
                at += LSN_SEGMENT_ENTRY_SIZE;
            }
            SegmentPayload::Lsn(entries)
        }
    };
    Ok((header, payload))
}
