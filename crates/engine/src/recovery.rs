use std::collections::HashMap;
use std::sync::Arc;

use ringlog_common::{
    Asn, LogError, Lsn, MasterBlock, RecordHeader, RecordType, RecordVerifier, RecordVersion,
    StreamId, StreamType, BLOCK_SIZE, CHECKPOINT_STREAM_ID, NO_LSN,
};
use tracing::{debug, info, warn};

use crate::asn_index::AsnIndex;
use crate::checkpoint::{
    decode_physical_checkpoint, decode_segment, SegmentPayload, SerializedAsnEntry,
    SerializedLsnEntry, StreamDescriptor,
};
use crate::layout::{RecordIo, LOG_REGION_START};
use crate::log::USER_METADATA_PREFIX;
use crate::lsn_index::LsnIndex;

/// Reconstructed state of one stream.
pub(crate) struct RecoveredStream {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub asn_index: AsnIndex,
    pub lsn_index: LsnIndex,
    pub prev_lsn: Lsn,
    pub truncation_point: Asn,
    pub last_chain_lsn: Lsn,
}

/// Full recovery result; everything the open path needs to assemble a log.
pub(crate) struct RecoveredLog {
    pub master: MasterBlock,
    pub next_lsn: Lsn,
    pub highest_checkpoint_lsn: Lsn,
    pub checkpoint_prev_lsn: Lsn,
    pub lowest_lsn: Lsn,
    pub streams: Vec<RecoveredStream>,
}

pub(crate) type VerifierMap = HashMap<StreamType, Arc<dyn RecordVerifier>>;

/// Recover a log from its on-disk state (the caller has already validated
/// the master blocks).
///
/// Phases: locate the highest durable LSN with a two-phase ring search;
/// walk back to the newest durable physical checkpoint; forward-scan the
/// live region rebuilding every stream; reverse-truncate at any fault
/// inside the chaos window. A fault may invalidate the checkpoint itself,
/// in which case the walk-back and scan repeat against the shorter log.
pub(crate) async fn recover_log(
    io: &RecordIo,
    master: &MasterBlock,
    verifiers: &VerifierMap,
) -> Result<RecoveredLog, LogError> {
    let mut next_lsn = locate_highest_lsn(io, master).await?;
    loop {
        let (checkpoint_lsn, descriptors) = locate_checkpoint(io, master, next_lsn).await?;
        let start = descriptors
            .iter()
            .map(|d| d.lowest_lsn)
            .fold(checkpoint_lsn, Lsn::min)
            .min(next_lsn);
        let known: HashMap<StreamId, StreamType> = descriptors
            .iter()
            .map(|d| (d.stream_id, d.stream_type))
            .collect();

        match scan_live_region(io, master, verifiers, start, next_lsn, &known).await? {
            ScanOutcome::TruncatedAt(fault_lsn) => {
                info!(
                    from = next_lsn,
                    to = fault_lsn,
                    "reverse-truncating log head at recovery fault"
                );
                next_lsn = fault_lsn;
            }
            ScanOutcome::Complete(mut scan) => {
                let mut streams = Vec::with_capacity(descriptors.len());
                for d in &descriptors {
                    let stream_scan = scan.per_stream.remove(&d.stream_id).unwrap_or_default();
                    streams.push(build_stream(d, stream_scan));
                }
                // Mirror the writer's one-generation retention: the lower
                // bound stays at or below the checkpoint preceding the
                // authoritative one.
                let generation_cap = locate_previous_checkpoint(io, checkpoint_lsn)
                    .await?
                    .unwrap_or(checkpoint_lsn);
                let lowest_lsn = streams
                    .iter()
                    .map(|s| s.lsn_index.lowest_lsn().min(s.last_chain_lsn))
                    .fold(checkpoint_lsn, Lsn::min)
                    .min(generation_cap);
                debug!(
                    next_lsn,
                    checkpoint_lsn,
                    lowest_lsn,
                    streams = streams.len(),
                    "recovery complete"
                );
                return Ok(RecoveredLog {
                    master: master.clone(),
                    next_lsn,
                    highest_checkpoint_lsn: checkpoint_lsn,
                    checkpoint_prev_lsn: checkpoint_lsn,
                    lowest_lsn,
                    streams,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Phase 2: locate the highest durable LSN
// ---------------------------------------------------------------------------

/// Two-phase ring search: a coarse scan reads the leading block of each
/// checkpoint-interval-sized chunk looking for the highest structurally
/// valid record header; a fine scan then walks records forward from that
/// anchor until the first hole, checksum fault or LSN regression.
async fn locate_highest_lsn(io: &RecordIo, master: &MasterBlock) -> Result<Lsn, LogError> {
    let space = io.geom.lsn_space;
    let chunk = ringlog_common::round_up_to_block(master.max_checkpoint_record_size as u64)
        .max(BLOCK_SIZE as u64);

    let mut best: Option<Lsn> = None;
    let mut off = 0u64;
    while off < space {
        if let Some(header) = read_candidate(io, off).await? {
            best = Some(best.map_or(header.lsn, |b| b.max(header.lsn)));
        }
        off += chunk;
    }

    // Tentative head from the coarse anchor (none if no chunk leads with a
    // record start, possible after an odd wrap phase).
    let mut anchored = best.is_some();
    let mut next = match best {
        Some(anchor) => walk_records_from(io, anchor).await?,
        None => 0,
    };
    // Confirming sweep: the anchor may have been a stale previous-lap
    // record. Re-anchor at any verified record above the tentative head
    // until none remains.
    loop {
        match sweep_verified_above(io, next, anchored).await? {
            Some(higher) => {
                anchored = true;
                next = walk_records_from(io, higher).await?;
            }
            None => break,
        }
    }
    if !anchored {
        return Err(LogError::CorruptLog(
            "log region contains no valid records".to_string(),
        ));
    }
    debug!(next_lsn = next, "located highest durable LSN");
    Ok(next)
}

/// Walk contiguous records from `start` (a verified record) and return the
/// LSN one past the last contiguous record.
async fn walk_records_from(io: &RecordIo, start: Lsn) -> Result<Lsn, LogError> {
    let space = io.geom.lsn_space;
    let mut next = start;
    loop {
        if next - start >= space {
            break;
        }
        match io.read_header_and_metadata(next).await? {
            Some((header, _)) if header.lsn == next => next += header.framed_size(),
            _ => break,
        }
    }
    Ok(next)
}

/// Block sweep for the highest checksum-verified record above `threshold`
/// (any verified record at all when not yet `anchored`).
async fn sweep_verified_above(
    io: &RecordIo,
    threshold: Lsn,
    anchored: bool,
) -> Result<Option<Lsn>, LogError> {
    let space = io.geom.lsn_space;
    let mut best: Option<Lsn> = None;
    let mut off = 0u64;
    while off < space {
        if let Some(header) = read_candidate(io, off).await? {
            let above = !anchored || header.lsn >= threshold;
            if above
                && best.map_or(true, |b| header.lsn > b)
                && io.read_header_and_metadata(header.lsn).await?.is_some()
            {
                best = Some(header.lsn);
            }
        }
        off += BLOCK_SIZE as u64;
    }
    Ok(best)
}

async fn read_candidate(io: &RecordIo, region_off: u64) -> Result<Option<RecordHeader>, LogError> {
    let abs = LOG_REGION_START + region_off;
    let block = io.device.read(abs, BLOCK_SIZE).await?;
    Ok(RecordHeader::decode(&block).filter(|h| io.plausible_header(h, abs)))
}

// ---------------------------------------------------------------------------
// Phase 3: establish the newest durable physical checkpoint
// ---------------------------------------------------------------------------

async fn locate_checkpoint(
    io: &RecordIo,
    master: &MasterBlock,
    next_lsn: Lsn,
) -> Result<(Lsn, Vec<StreamDescriptor>), LogError> {
    let space = io.geom.lsn_space;
    let block = BLOCK_SIZE as u64;
    let mut off = io.geom.file_offset(next_lsn);
    for _ in 0..space / block {
        off = if off == LOG_REGION_START {
            LOG_REGION_START + space - block
        } else {
            off - block
        };
        let raw = io.device.read(off, BLOCK_SIZE).await?;
        let header = match RecordHeader::decode(&raw).filter(|h| io.plausible_header(h, off)) {
            Some(h) => h,
            None => continue,
        };
        if header.lsn >= next_lsn {
            // Chaos leftovers above the recovered head are expected within
            // the queued-write window; anything farther is impossible.
            if header.lsn >= next_lsn + master.max_queued_write_depth as u64
                && io.read_header_and_metadata(header.lsn).await?.is_some()
            {
                return Err(LogError::CorruptLog(format!(
                    "record at LSN {} lies beyond the recovered head {}",
                    header.lsn, next_lsn
                )));
            }
            continue;
        }
        if next_lsn - header.lsn > space {
            // Previous-lap leftover.
            continue;
        }
        if header.stream_id != CHECKPOINT_STREAM_ID
            || header.record_type != RecordType::PhysicalCheckpoint
            || header.lsn + header.framed_size() > next_lsn
        {
            continue;
        }
        if let Some((verified, metadata)) = io.read_header_and_metadata(header.lsn).await? {
            if verified.record_type == RecordType::PhysicalCheckpoint {
                if let Ok(streams) = decode_physical_checkpoint(&metadata) {
                    debug!(checkpoint_lsn = header.lsn, "located physical checkpoint");
                    return Ok((header.lsn, streams));
                }
            }
        }
        // A checkpoint that fails verification was lost mid-write; keep
        // walking back to the previous one.
    }
    Err(LogError::CorruptLog(
        "no durable physical checkpoint found".to_string(),
    ))
}

/// Backward block scan for the newest physical checkpoint strictly below
/// `limit`. Used only to reconstruct the one-generation retention bound, so
/// a miss is not an error.
async fn locate_previous_checkpoint(io: &RecordIo, limit: Lsn) -> Result<Option<Lsn>, LogError> {
    let space = io.geom.lsn_space;
    let block = BLOCK_SIZE as u64;
    let mut off = io.geom.file_offset(limit);
    for _ in 0..space / block {
        off = if off == LOG_REGION_START {
            LOG_REGION_START + space - block
        } else {
            off - block
        };
        let raw = io.device.read(off, BLOCK_SIZE).await?;
        let header = match RecordHeader::decode(&raw).filter(|h| io.plausible_header(h, off)) {
            Some(h) => h,
            None => continue,
        };
        if header.lsn >= limit
            || limit - header.lsn > space
            || header.stream_id != CHECKPOINT_STREAM_ID
            || header.record_type != RecordType::PhysicalCheckpoint
            || header.lsn + header.framed_size() > limit
        {
            continue;
        }
        if io.read_header_and_metadata(header.lsn).await?.is_some() {
            return Ok(Some(header.lsn));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Phase 4: forward scan and per-stream reconstruction
// ---------------------------------------------------------------------------

struct ScannedUser {
    lsn: Lsn,
    asn: Asn,
    version: RecordVersion,
    header_and_metadata_size: u32,
    io_buffer_size: u32,
}

struct ChainAccumulator {
    first_lsn: Lsn,
    expected_count: u32,
    next_index: u32,
    truncation_point: Asn,
    asn_entries: Vec<SerializedAsnEntry>,
    lsn_entries: Vec<SerializedLsnEntry>,
}

struct CompleteChain {
    first_lsn: Lsn,
    truncation_point: Asn,
    asn_entries: Vec<SerializedAsnEntry>,
    lsn_entries: Vec<SerializedLsnEntry>,
}

struct StreamScan {
    user_records: Vec<ScannedUser>,
    chain_current: Option<ChainAccumulator>,
    chain_complete: Option<CompleteChain>,
    max_record_lsn: Lsn,
}

impl Default for StreamScan {
    fn default() -> Self {
        Self {
            user_records: Vec::new(),
            chain_current: None,
            chain_complete: None,
            max_record_lsn: NO_LSN,
        }
    }
}

struct ScanResult {
    per_stream: HashMap<StreamId, StreamScan>,
}

enum ScanOutcome {
    Complete(ScanResult),
    /// A fault inside the chaos window; the log must be reverse-truncated
    /// to this LSN and the scan repeated.
    TruncatedAt(Lsn),
}

async fn scan_live_region(
    io: &RecordIo,
    master: &MasterBlock,
    verifiers: &VerifierMap,
    start: Lsn,
    next_lsn: Lsn,
    known: &HashMap<StreamId, StreamType>,
) -> Result<ScanOutcome, LogError> {
    let depth = master.max_queued_write_depth as u64;
    let chaos_fault = |lsn: Lsn| -> Result<ScanOutcome, LogError> {
        if next_lsn - lsn <= depth {
            Ok(ScanOutcome::TruncatedAt(lsn))
        } else {
            Err(LogError::CorruptLog(format!(
                "damaged record at LSN {lsn} below the chaos window (head {next_lsn})"
            )))
        }
    };

    let mut per_stream: HashMap<StreamId, StreamScan> = known
        .keys()
        .map(|id| (*id, StreamScan::default()))
        .collect();

    let mut lsn = start;
    while lsn < next_lsn {
        let (header, metadata) = match io.read_header_and_metadata(lsn).await? {
            Some((h, m)) if h.lsn == lsn => (h, m),
            _ => return chaos_fault(lsn),
        };
        match header.record_type {
            RecordType::PhysicalCheckpoint => {}
            RecordType::StreamCheckpoint => {
                if let Some(scan) = per_stream.get_mut(&header.stream_id) {
                    match decode_segment(&metadata) {
                        Ok((seg, payload)) => {
                            apply_segment(scan, lsn, header.truncation_point, seg, payload)
                        }
                        // Checksummed but undecodable: structure fault,
                        // handled as chaos.
                        Err(_) => return chaos_fault(lsn),
                    }
                    scan.max_record_lsn = cmp_max_lsn(scan.max_record_lsn, lsn);
                }
            }
            RecordType::User => {
                if let Some(scan) = per_stream.get_mut(&header.stream_id) {
                    if (metadata.len()) < USER_METADATA_PREFIX {
                        return chaos_fault(lsn);
                    }
                    let asn = u64::from_le_bytes(metadata[0..8].try_into().unwrap());
                    let version = u64::from_le_bytes(metadata[8..16].try_into().unwrap());
                    let payload = io.read_payload(&header).await?;
                    if let Some(verifier) = verifiers.get(&header.stream_type) {
                        if let Err(e) = verifier.verify(
                            header.stream_type,
                            &metadata[USER_METADATA_PREFIX..],
                            &payload,
                        ) {
                            warn!(lsn, asn, %e, "record verifier fault during recovery");
                            return Ok(ScanOutcome::TruncatedAt(lsn));
                        }
                    }
                    scan.user_records.push(ScannedUser {
                        lsn,
                        asn,
                        version,
                        header_and_metadata_size: header.header_and_metadata_size() as u32,
                        io_buffer_size: header.io_buffer_size,
                    });
                    scan.max_record_lsn = cmp_max_lsn(scan.max_record_lsn, lsn);
                }
            }
        }
        lsn += header.framed_size();
    }
    Ok(ScanOutcome::Complete(ScanResult { per_stream }))
}

fn cmp_max_lsn(current: Lsn, lsn: Lsn) -> Lsn {
    if current == NO_LSN {
        lsn
    } else {
        current.max(lsn)
    }
}

fn apply_segment(
    scan: &mut StreamScan,
    lsn: Lsn,
    truncation_point: Asn,
    seg: crate::checkpoint::SegmentHeader,
    payload: SegmentPayload,
) {
    let mut acc = if seg.segment_index == 0 {
        ChainAccumulator {
            first_lsn: lsn,
            expected_count: seg.segment_count,
            next_index: 0,
            truncation_point,
            asn_entries: Vec::new(),
            lsn_entries: Vec::new(),
        }
    } else {
        match scan.chain_current.take() {
            Some(acc)
                if acc.next_index == seg.segment_index
                    && acc.expected_count == seg.segment_count =>
            {
                acc
            }
            // Orphan or out-of-order segment: discard the partial chain.
            _ => return,
        }
    };
    match payload {
        SegmentPayload::Asn(entries) => acc.asn_entries.extend(entries),
        SegmentPayload::Lsn(entries) => acc.lsn_entries.extend(entries),
    }
    acc.next_index += 1;
    if acc.next_index == acc.expected_count {
        scan.chain_complete = Some(CompleteChain {
            first_lsn: acc.first_lsn,
            truncation_point: acc.truncation_point,
            asn_entries: acc.asn_entries,
            lsn_entries: acc.lsn_entries,
        });
    } else {
        scan.chain_current = Some(acc);
    }
}

fn build_stream(descriptor: &StreamDescriptor, scan: StreamScan) -> RecoveredStream {
    let mut asn_index = AsnIndex::new();
    let mut records: std::collections::BTreeMap<Lsn, (u32, u32)> = std::collections::BTreeMap::new();
    let mut truncation_point = 0;
    let mut last_chain_lsn = NO_LSN;

    if let Some(chain) = &scan.chain_complete {
        truncation_point = chain.truncation_point;
        last_chain_lsn = chain.first_lsn;
        for e in &chain.asn_entries {
            if e.asn > truncation_point {
                asn_index.recover_record(e.asn, e.version, e.io_buffer_size, e.lsn);
            }
        }
        for e in &chain.lsn_entries {
            records.insert(e.lsn, (e.header_and_metadata_size, e.io_buffer_size));
        }
    }
    // Scanned records re-apply on top of the chain; version resolution makes
    // replaying a record the chain already covers a no-op.
    for u in &scan.user_records {
        if u.asn > truncation_point {
            asn_index.recover_record(u.asn, u.version, u.io_buffer_size, u.lsn);
        }
        records.insert(u.lsn, (u.header_and_metadata_size, u.io_buffer_size));
    }

    let mut lsn_index = LsnIndex::new();
    for (lsn, (hm, io_size)) in records {
        lsn_index.add_higher_lsn_record(lsn, hm, io_size);
    }
    RecoveredStream {
        stream_id: descriptor.stream_id,
        stream_type: descriptor.stream_type,
        asn_index,
        lsn_index,
        prev_lsn: scan.max_record_lsn,
        truncation_point,
        last_chain_lsn,
    }
}
