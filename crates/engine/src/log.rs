use std::collections::{BTreeMap, HashMap};
use std::io;
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use ringlog_common::{
    framed_record_size, header_and_metadata_size, Asn, Disposition, LogError, LogId, Lsn,
    MasterBlock, RecordHeader, RecordType, RecordVersion, StreamId, StreamState, StreamType,
    CHECKPOINT_STREAM_ID, CHECKPOINT_STREAM_TYPE, NO_LSN, RECORD_HEADER_SIZE,
};
use ringlog_device::{BlockDevice, IoPriority};
use tracing::{debug, error, info, warn};

use crate::asn_index::SavedEntryState;
use crate::checkpoint::{
    build_stream_checkpoint_segments, encode_physical_checkpoint, StreamDescriptor,
};
use crate::config::LogOptions;
use crate::layout::{write_masters, RecordIo};
use crate::recovery::RecoveredLog;
use crate::stream::{LogStream, StreamInner, StreamShared};

/// Engine-owned prefix stored ahead of the user metadata in every user
/// record: `{asn: u64, version: u64}` little-endian.
pub(crate) const USER_METADATA_PREFIX: usize = 16;

/// One in-flight allocation tracked for `HighestCompletedLsn` advancement.
struct PendingWrite {
    end: Lsn,
    done: bool,
}

pub(crate) struct LogInner {
    pub next_lsn: Lsn,
    pub highest_completed_lsn: Lsn,
    pub highest_checkpoint_lsn: Lsn,
    /// Accounting lower bound of the live region. Advances only when a
    /// physical checkpoint recording the new bound has persisted, so the
    /// region a recovery will scan is never reused early.
    pub lowest_lsn: Lsn,
    pending: BTreeMap<Lsn, PendingWrite>,
    pub total_reserved: u64,
    pub streams: HashMap<StreamId, Arc<StreamShared>>,
    /// Chain of the distinguished checkpoint stream.
    pub checkpoint_prev_lsn: Lsn,
    checkpoint_in_progress: bool,
    /// Set on the first failed device write; the log stops accepting work
    /// and recovery at next open truncates at the resulting hole.
    pub faulted: bool,
}

/// Space usage snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceInfo {
    pub total: u64,
    pub free: u64,
}

/// Watermark snapshot, mostly for diagnostics and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogPositions {
    pub lowest_lsn: Lsn,
    pub next_lsn: Lsn,
    pub highest_completed_lsn: Lsn,
    pub highest_checkpoint_lsn: Lsn,
}

/// One open log file: the LSN allocator, stream set, reservation ledger and
/// checkpoint machinery over a circular on-disk region.
pub struct Log {
    pub(crate) master: MasterBlock,
    pub(crate) io: RecordIo,
    pub(crate) shared: Mutex<LogInner>,
    /// Notified whenever completed or reclaimed space may unblock waiters.
    pub(crate) space_available: tokio::sync::Notify,
    pub(crate) stream_checkpoint_record_interval: u32,
    /// Back-reference so `&self` methods can mint stream handles.
    self_ref: Weak<Log>,
}

enum AllocOutcome {
    Allocated { lsn: Lsn, prev_lsn: Lsn, completed_snapshot: Lsn },
    Wait,
    Relief,
    Fail(LogError),
}

pub(crate) fn faulted_error() -> LogError {
    LogError::Io(io::Error::new(
        io::ErrorKind::Other,
        "log faulted by an earlier failed write",
    ))
}

impl Log {
    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create a new log: write both masters, then the initial physical
    /// checkpoint (an empty log has exactly one checkpoint record).
    pub(crate) async fn create(
        device: Arc<dyn BlockDevice>,
        log_id: LogId,
        options: &LogOptions,
    ) -> Result<Arc<Self>, LogError> {
        options.validate()?;
        let create_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let master = MasterBlock {
            log_id,
            log_signature: *uuid::Uuid::new_v4().as_bytes(),
            log_file_size: options.log_file_size,
            log_file_lsn_space: options.lsn_space(),
            max_record_size: options.max_record_size,
            max_checkpoint_record_size: options.max_checkpoint_record_size,
            max_queued_write_depth: options.max_queued_write_depth,
            max_streams: options.max_streams,
            checkpoint_interval: options.checkpoint_interval,
            min_free_space: options.min_free_space,
            create_timestamp,
        };
        write_masters(&device, &master).await?;

        let io = RecordIo::new(device, &master);
        let log = Arc::new_cyclic(|self_ref| Self {
            io,
            master,
            shared: Mutex::new(LogInner {
                next_lsn: 0,
                highest_completed_lsn: 0,
                highest_checkpoint_lsn: 0,
                lowest_lsn: 0,
                pending: BTreeMap::new(),
                total_reserved: 0,
                streams: HashMap::new(),
                checkpoint_prev_lsn: NO_LSN,
                checkpoint_in_progress: false,
                faulted: false,
            }),
            space_available: tokio::sync::Notify::new(),
            stream_checkpoint_record_interval: options.stream_checkpoint_record_interval,
            self_ref: self_ref.clone(),
        });
        log.emit_physical_checkpoint().await?;
        info!(log_id = %log_id, size = options.log_file_size, "created log");
        Ok(log)
    }

    /// Assemble an open log from recovered state.
    pub(crate) fn from_recovery(
        device: Arc<dyn BlockDevice>,
        recovered: RecoveredLog,
        stream_checkpoint_record_interval: u32,
    ) -> Arc<Self> {
        let io = RecordIo::new(device, &recovered.master);
        let mut streams = HashMap::new();
        for s in recovered.streams {
            streams.insert(
                s.stream_id,
                Arc::new(StreamShared {
                    stream_id: s.stream_id,
                    stream_type: s.stream_type,
                    inner: Mutex::new(StreamInner {
                        asn_index: s.asn_index,
                        lsn_index: s.lsn_index,
                        reserved_bytes: 0,
                        prev_lsn: s.prev_lsn,
                        truncation_point: s.truncation_point,
                        preferred_truncation: 0,
                        holds: Vec::new(),
                        state: StreamState::Closed,
                        open_handles: 0,
                        last_chain_lsn: s.last_chain_lsn,
                        records_since_checkpoint: 0,
                    }),
                }),
            );
        }
        info!(
            log_id = %recovered.master.log_id,
            next_lsn = recovered.next_lsn,
            lowest_lsn = recovered.lowest_lsn,
            streams = streams.len(),
            "opened log"
        );
        Arc::new_cyclic(|self_ref| Self {
            io,
            master: recovered.master,
            shared: Mutex::new(LogInner {
                next_lsn: recovered.next_lsn,
                highest_completed_lsn: recovered.next_lsn,
                highest_checkpoint_lsn: recovered.highest_checkpoint_lsn,
                lowest_lsn: recovered.lowest_lsn,
                pending: BTreeMap::new(),
                total_reserved: 0,
                streams,
                checkpoint_prev_lsn: recovered.checkpoint_prev_lsn,
                checkpoint_in_progress: false,
                faulted: false,
            }),
            space_available: tokio::sync::Notify::new(),
            stream_checkpoint_record_interval,
            self_ref: self_ref.clone(),
        })
    }

    /// Strong handle to this log; valid for the lifetime of any `&self`.
    fn arc(&self) -> Arc<Log> {
        self.self_ref.upgrade().expect("log is alive")
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> LogId {
        self.master.log_id
    }

    pub fn signature(&self) -> ringlog_common::LogSignature {
        self.master.log_signature
    }

    pub fn max_record_size(&self) -> u32 {
        self.master.max_record_size
    }

    pub fn max_allowed_streams(&self) -> u32 {
        self.master.max_streams
    }

    pub fn total_space(&self) -> u64 {
        self.master.log_file_lsn_space
    }

    pub fn query_space(&self) -> SpaceInfo {
        let inner = self.shared.lock().unwrap();
        SpaceInfo {
            total: self.master.log_file_lsn_space,
            free: Self::free_space_locked(&inner, self.master.log_file_lsn_space),
        }
    }

    pub fn free_space(&self) -> u64 {
        self.query_space().free
    }

    /// Aggregate reserved bytes across all streams.
    pub fn query_current_reservation(&self) -> u64 {
        self.shared.lock().unwrap().total_reserved
    }

    pub fn positions(&self) -> LogPositions {
        let inner = self.shared.lock().unwrap();
        LogPositions {
            lowest_lsn: inner.lowest_lsn,
            next_lsn: inner.next_lsn,
            highest_completed_lsn: inner.highest_completed_lsn,
            highest_checkpoint_lsn: inner.highest_checkpoint_lsn,
        }
    }

    fn free_space_locked(inner: &LogInner, lsn_space: u64) -> u64 {
        lsn_space - (inner.next_lsn - inner.lowest_lsn)
    }

    // -----------------------------------------------------------------------
    // Stream lifecycle
    // -----------------------------------------------------------------------

    pub async fn create_stream(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
    ) -> Result<LogStream, LogError> {
        if stream_id == CHECKPOINT_STREAM_ID {
            return Err(LogError::InvalidParameter("reserved stream id"));
        }
        let shared = {
            let mut inner = self.shared.lock().unwrap();
            if inner.faulted {
                return Err(faulted_error());
            }
            if inner.streams.contains_key(&stream_id) {
                return Err(LogError::InvalidParameter("stream already exists"));
            }
            if inner.streams.len() as u32 >= self.master.max_streams {
                return Err(LogError::ResourceExhausted("stream limit reached"));
            }
            let shared = Arc::new(StreamShared {
                stream_id,
                stream_type,
                inner: Mutex::new(StreamInner::new_open()),
            });
            inner.streams.insert(stream_id, shared.clone());
            shared
        };

        // The stream set changed; make it durable before handing the
        // stream out.
        if let Err(e) = self.emit_physical_checkpoint().await {
            let mut inner = self.shared.lock().unwrap();
            inner.streams.remove(&stream_id);
            return Err(e);
        }
        debug!(stream_id = %stream_id, "created stream");
        Ok(LogStream::new(self.arc(), shared))
    }

    pub fn open_stream(&self, stream_id: StreamId) -> Result<LogStream, LogError> {
        let shared = {
            let inner = self.shared.lock().unwrap();
            inner
                .streams
                .get(&stream_id)
                .cloned()
                .ok_or(LogError::NotFound)?
        };
        {
            let mut s = shared.inner.lock().unwrap();
            if s.state == StreamState::Deleted {
                return Err(LogError::NotFound);
            }
            s.state = StreamState::Open;
            s.open_handles += 1;
        }
        Ok(LogStream::new(self.arc(), shared))
    }

    /// Delete a stream. If it is currently open the deletion is deferred:
    /// the stream is marked and removed at the next physical checkpoint
    /// after the last handle drops.
    pub async fn delete_stream(&self, stream_id: StreamId) -> Result<(), LogError> {
        let (shared, deferred) = {
            let inner = self.shared.lock().unwrap();
            let shared = inner
                .streams
                .get(&stream_id)
                .cloned()
                .ok_or(LogError::NotFound)?;
            let mut s = shared.inner.lock().unwrap();
            if s.state == StreamState::Deleted {
                return Err(LogError::NotFound);
            }
            s.state = StreamState::Deleted;
            let deferred = s.open_handles > 0;
            drop(s);
            (shared, deferred)
        };
        drop(shared);
        if deferred {
            debug!(stream_id = %stream_id, "stream delete deferred until last handle drops");
            return Ok(());
        }
        // Finalized by the checkpoint: the record omits the stream and the
        // stream's LSN range stops pinning the ring.
        self.emit_physical_checkpoint().await?;
        debug!(stream_id = %stream_id, "deleted stream");
        Ok(())
    }

    pub fn query_stream_state(&self, stream_id: StreamId) -> StreamState {
        let inner = self.shared.lock().unwrap();
        match inner.streams.get(&stream_id) {
            None => StreamState::Deleted,
            Some(shared) => shared.inner.lock().unwrap().state,
        }
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    pub(crate) async fn write_user_record(
        &self,
        stream: &Arc<StreamShared>,
        reserve_to_consume: u64,
        asn: Asn,
        version: RecordVersion,
        metadata: &[u8],
        io_buffer: &[u8],
    ) -> Result<Lsn, LogError> {
        if asn == 0 {
            return Err(LogError::InvalidParameter("null ASN"));
        }
        if io_buffer.len() % ringlog_common::BLOCK_SIZE != 0 {
            return Err(LogError::InvalidParameter("payload not block aligned"));
        }
        let meta_size = USER_METADATA_PREFIX + metadata.len();
        if meta_size > u32::MAX as usize {
            return Err(LogError::InvalidParameter("metadata too large"));
        }
        let framed = framed_record_size(meta_size as u32, io_buffer.len() as u32);
        if framed > self.master.max_record_size as u64 {
            return Err(LogError::InvalidParameter("record exceeds max record size"));
        }

        // ASN admission.
        let saved = {
            let mut s = stream.inner.lock().unwrap();
            if s.state != StreamState::Open {
                return Err(LogError::NotFound);
            }
            if asn <= s.truncation_point {
                return Err(LogError::InvalidParameter("ASN at or below truncation point"));
            }
            s.asn_index.add_or_update(
                asn,
                version,
                io_buffer.len() as u32,
                Disposition::None,
                NO_LSN,
            )?
        };

        // LSN allocation (backpressure + space accounting).
        let hm_size = header_and_metadata_size(meta_size as u32) as u32;
        let (lsn, prev_lsn, completed_snapshot) = match self
            .allocate_user_lsn(stream, asn, version, framed, hm_size, io_buffer.len() as u32, reserve_to_consume)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                self.rollback_admission(stream, asn, version, saved, None);
                return Err(e);
            }
        };

        // Frame and write (up to two device writes on wrap).
        let mut disk_metadata = Vec::with_capacity(meta_size);
        disk_metadata.extend_from_slice(&asn.to_le_bytes());
        disk_metadata.extend_from_slice(&version.to_le_bytes());
        disk_metadata.extend_from_slice(metadata);
        let mut header = RecordHeader {
            lsn,
            prev_lsn_in_stream: prev_lsn,
            highest_completed_lsn: completed_snapshot,
            log_id: self.master.log_id,
            log_signature: self.master.log_signature,
            stream_id: stream.stream_id,
            stream_type: stream.stream_type,
            record_type: RecordType::User,
            flags: 0,
            metadata_size: meta_size as u32,
            io_buffer_size: io_buffer.len() as u32,
            truncation_point: 0,
            checksum: 0,
        };
        if let Err(e) = self
            .io
            .write_record(&mut header, &disk_metadata, io_buffer, IoPriority::Normal)
            .await
        {
            // Once framed, a write either completes or faults the log: the
            // allocated range becomes a hole recovery will stop at.
            error!(lsn, stream_id = %stream.stream_id, "record write failed; faulting log");
            {
                let mut inner = self.shared.lock().unwrap();
                inner.faulted = true;
            }
            self.space_available.notify_waiters();
            self.rollback_admission(stream, asn, version, saved, Some(lsn));
            return Err(e);
        }

        self.finish_user_write(stream, asn, version, lsn).await;
        Ok(lsn)
    }

    #[allow(clippy::too_many_arguments)]
    async fn allocate_user_lsn(
        &self,
        stream: &Arc<StreamShared>,
        asn: Asn,
        version: RecordVersion,
        framed: u64,
        hm_size: u32,
        io_size: u32,
        reserve_to_consume: u64,
    ) -> Result<(Lsn, Lsn, Lsn), LogError> {
        let mut tried_relief = false;
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = {
                let mut inner = self.shared.lock().unwrap();
                self.try_allocate_locked(
                    &mut inner,
                    stream,
                    asn,
                    version,
                    framed,
                    hm_size,
                    io_size,
                    reserve_to_consume,
                )
            };
            match outcome {
                AllocOutcome::Allocated {
                    lsn,
                    prev_lsn,
                    completed_snapshot,
                } => return Ok((lsn, prev_lsn, completed_snapshot)),
                AllocOutcome::Fail(e) => return Err(e),
                AllocOutcome::Relief => {
                    if tried_relief {
                        return Err(LogError::LogFull);
                    }
                    tried_relief = true;
                    self.relieve_space_pressure().await;
                }
                AllocOutcome::Wait => notified.await,
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_allocate_locked(
        &self,
        inner: &mut LogInner,
        stream: &StreamShared,
        asn: Asn,
        version: RecordVersion,
        framed: u64,
        hm_size: u32,
        io_size: u32,
        reserve_to_consume: u64,
    ) -> AllocOutcome {
        if inner.faulted {
            return AllocOutcome::Fail(faulted_error());
        }
        // Chaos-window bound: never let the unsettled tail exceed the
        // depth recovery is contracted to tolerate.
        if inner.next_lsn + framed - inner.highest_completed_lsn
            > self.master.max_queued_write_depth as u64
        {
            return AllocOutcome::Wait;
        }
        let free = Self::free_space_locked(inner, self.master.log_file_lsn_space);
        let mut s = stream.inner.lock().unwrap();
        // The admitted entry must still be ours; a higher-version admission
        // may have replaced it while we waited.
        match s.asn_index.get(asn) {
            Some(e) if e.version == version => {}
            Some(e) => {
                return AllocOutcome::Fail(LogError::StaleVersion {
                    asn,
                    existing: e.version,
                    attempted: version,
                })
            }
            None => return AllocOutcome::Fail(LogError::NotFound),
        }
        if reserve_to_consume > 0 {
            // A reserved write consumes pre-committed space; it cannot fail
            // for lack of free space.
            if reserve_to_consume > s.reserved_bytes || framed > reserve_to_consume {
                return AllocOutcome::Fail(LogError::ReserveTooSmall);
            }
            s.reserved_bytes -= framed;
            inner.total_reserved -= framed;
        } else if free < framed + inner.total_reserved + self.master.min_free_space {
            return AllocOutcome::Relief;
        }

        let lsn = inner.next_lsn;
        inner.next_lsn += framed;
        inner.pending.insert(
            lsn,
            PendingWrite {
                end: lsn + framed,
                done: false,
            },
        );
        let prev_lsn = std::mem::replace(&mut s.prev_lsn, lsn);
        // Cannot fail: version checked above under the same lock.
        let _ = s
            .asn_index
            .update_lsn_and_disposition(asn, version, Disposition::Pending, lsn);
        s.lsn_index.add_higher_lsn_record(lsn, hm_size, io_size);
        AllocOutcome::Allocated {
            lsn,
            prev_lsn,
            completed_snapshot: inner.highest_completed_lsn,
        }
    }

    fn rollback_admission(
        &self,
        stream: &StreamShared,
        asn: Asn,
        version: RecordVersion,
        saved: Option<SavedEntryState>,
        allocated_lsn: Option<Lsn>,
    ) {
        let mut s = stream.inner.lock().unwrap();
        // A stale result means a higher-version admission took over the
        // entry; its own rollback is responsible for it then.
        if let Err(e) = s.asn_index.restore(asn, version, saved) {
            debug!(asn, %e, "admission rollback superseded");
        }
        if let Some(lsn) = allocated_lsn {
            s.lsn_index.remove(lsn);
        }
    }

    fn complete_write_locked(inner: &mut LogInner, lsn: Lsn) {
        if let Some(p) = inner.pending.get_mut(&lsn) {
            p.done = true;
        }
        // HighestCompletedLsn advances only through the lowest unclosed
        // pending LSN, keeping the watermark monotonic and gap free.
        while let Some((&first, p)) = inner.pending.iter().next() {
            if !p.done {
                break;
            }
            inner.highest_completed_lsn = p.end;
            inner.pending.remove(&first);
        }
    }

    async fn finish_user_write(
        &self,
        stream: &Arc<StreamShared>,
        asn: Asn,
        version: RecordVersion,
        lsn: Lsn,
    ) {
        let checkpoint_due = {
            let mut inner = self.shared.lock().unwrap();
            Self::complete_write_locked(&mut inner, lsn);
            !inner.checkpoint_in_progress
                && inner.next_lsn - inner.highest_checkpoint_lsn > self.master.checkpoint_interval
        };
        self.space_available.notify_waiters();

        let (held, stream_checkpoint_due) = {
            let mut s = stream.inner.lock().unwrap();
            // Ignore a stale transition: a higher-version admission now
            // owns the entry.
            let _ = s
                .asn_index
                .update_disposition(asn, version, Disposition::Persisted);
            s.records_since_checkpoint += 1;
            let held: Vec<Asn> = s.holds.drain(..).collect();
            (
                held,
                s.records_since_checkpoint >= self.stream_checkpoint_record_interval,
            )
        };

        // Held truncations may have become serviceable with this record
        // persisted.
        for up_to in held {
            if let Err(e) = self.truncate_stream(stream, up_to).await {
                warn!(stream_id = %stream.stream_id, up_to, %e, "held truncation failed");
            }
        }
        if stream_checkpoint_due {
            if let Err(e) = self.emit_stream_checkpoint(stream).await {
                warn!(stream_id = %stream.stream_id, %e, "stream checkpoint failed");
            }
        }
        if checkpoint_due {
            if let Err(e) = self.emit_physical_checkpoint().await {
                warn!(%e, "interval checkpoint failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Truncation
    // -----------------------------------------------------------------------

    /// Truncate `stream` at `up_to`. Deferred by design: when `up_to` sits
    /// above the highest fully-persisted ASN (or any write below it is
    /// still unsettled) the request parks in the stream's hold list and is
    /// serviced as completions catch up.
    pub(crate) async fn truncate_stream(
        &self,
        stream: &Arc<StreamShared>,
        up_to: Asn,
    ) -> Result<(), LogError> {
        let applied = {
            let inner = self.shared.lock().unwrap();
            if inner.faulted {
                return Err(faulted_error());
            }
            let mut s = stream.inner.lock().unwrap();
            if up_to <= s.truncation_point {
                return Ok(());
            }
            let serviceable = s
                .asn_index
                .highest_persisted_asn()
                .map_or(false, |h| h >= up_to)
                && !s.asn_index.has_unsettled_at_or_below(up_to);
            if serviceable {
                let low = s.asn_index.truncate(up_to);
                s.lsn_index.truncate_below(low);
                s.truncation_point = up_to;
                debug!(stream_id = %stream.stream_id, up_to, low, "applied truncation");
                true
            } else {
                debug!(stream_id = %stream.stream_id, up_to, "truncation held");
                s.holds.push(up_to);
                false
            }
        };
        if !applied {
            return Ok(());
        }

        // Make the truncation point durable, then re-checkpoint the log if
        // the retained lower bound moved so the next recovery can use it.
        self.emit_stream_checkpoint(stream).await?;
        let lows_advanced = {
            let inner = self.shared.lock().unwrap();
            self.candidate_lowest_locked(&inner) > inner.lowest_lsn
        };
        if lows_advanced {
            self.emit_physical_checkpoint().await?;
        }
        Ok(())
    }

    /// Lowest LSN the log would need to retain if a checkpoint were cut
    /// right now.
    fn candidate_lowest_locked(&self, inner: &LogInner) -> Lsn {
        let mut lowest = inner.highest_checkpoint_lsn;
        for shared in inner.streams.values() {
            let s = shared.inner.lock().unwrap();
            lowest = lowest.min(s.lowest_retained_lsn());
        }
        lowest
    }

    /// Under space pressure, truncate streams further (up to their callers'
    /// preferred truncation points) before failing a write with `LogFull`.
    async fn relieve_space_pressure(&self) {
        let candidates: Vec<(Arc<StreamShared>, Asn)> = {
            let inner = self.shared.lock().unwrap();
            inner
                .streams
                .values()
                .filter_map(|shared| {
                    let s = shared.inner.lock().unwrap();
                    if s.preferred_truncation <= s.truncation_point {
                        return None;
                    }
                    let cap = s.asn_index.highest_persisted_asn()?;
                    let target = s.preferred_truncation.min(cap);
                    if target > s.truncation_point && !s.asn_index.has_unsettled_at_or_below(target)
                    {
                        Some((shared.clone(), target))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (shared, target) in candidates {
            debug!(stream_id = %shared.stream_id, target, "preferred truncation under space pressure");
            if let Err(e) = self.truncate_stream(&shared, target).await {
                warn!(stream_id = %shared.stream_id, %e, "preferred truncation failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    pub(crate) fn update_reservation(
        &self,
        stream: &StreamShared,
        delta: i64,
    ) -> Result<(), LogError> {
        let mut inner = self.shared.lock().unwrap();
        if inner.faulted {
            return Err(faulted_error());
        }
        let mut s = stream.inner.lock().unwrap();
        if delta >= 0 {
            let delta = delta as u64;
            let free = Self::free_space_locked(&inner, self.master.log_file_lsn_space);
            if free < inner.total_reserved + delta + self.master.min_free_space {
                return Err(LogError::LogFull);
            }
            s.reserved_bytes += delta;
            inner.total_reserved += delta;
        } else {
            let give_back = delta.unsigned_abs();
            if s.reserved_bytes < give_back {
                return Err(LogError::ReserveTooSmall);
            }
            s.reserved_bytes -= give_back;
            inner.total_reserved -= give_back;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoints
    // -----------------------------------------------------------------------

    /// Emit a physical checkpoint record describing all live streams, then
    /// advance `HighestCheckpointLsn` and the accounting lower bound. Safe
    /// to call at any time; concurrent calls coalesce.
    pub async fn checkpoint_now(&self) -> Result<(), LogError> {
        self.emit_physical_checkpoint().await
    }

    pub(crate) async fn emit_physical_checkpoint(&self) -> Result<(), LogError> {
        // One checkpoint at a time; later callers wait so a stream-set
        // change is always covered by a record cut after it.
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.shared.lock().unwrap();
                if inner.faulted {
                    return Err(faulted_error());
                }
                if !inner.checkpoint_in_progress {
                    inner.checkpoint_in_progress = true;
                    break;
                }
            }
            notified.await;
        }

        // Snapshot the stream set; streams whose deferred deletion can now
        // finalize are omitted and removed once the record persists.
        let (descriptors, finalize): (Vec<StreamDescriptor>, Vec<StreamId>) = {
            let inner = self.shared.lock().unwrap();
            let mut descriptors = Vec::new();
            let mut finalize = Vec::new();
            for (id, shared) in inner.streams.iter() {
                let s = shared.inner.lock().unwrap();
                if s.state == StreamState::Deleted && s.open_handles == 0 {
                    finalize.push(*id);
                    continue;
                }
                descriptors.push(StreamDescriptor {
                    stream_id: shared.stream_id,
                    stream_type: shared.stream_type,
                    lowest_lsn: s.lowest_retained_lsn(),
                    highest_lsn: s.prev_lsn,
                    next_lsn: s.lsn_index.next_lsn(),
                });
            }
            descriptors.sort_by_key(|d| d.stream_id);
            (descriptors, finalize)
        };

        let payload = encode_physical_checkpoint(&descriptors);
        let result = self
            .write_internal_record(None, RecordType::PhysicalCheckpoint, 0, &payload)
            .await;

        let (reclaimed_from, reclaimed_to) = {
            let mut inner = self.shared.lock().unwrap();
            inner.checkpoint_in_progress = false;
            let lsn = match result {
                Ok(lsn) => lsn,
                Err(e) => {
                    drop(inner);
                    self.space_available.notify_waiters();
                    return Err(e);
                }
            };
            let previous_checkpoint = inner.highest_checkpoint_lsn;
            inner.highest_checkpoint_lsn = inner.highest_checkpoint_lsn.max(lsn);
            let reclaimed_from = inner.lowest_lsn;
            // Retain one checkpoint generation: if this record is lost in the
            // chaos window, recovery falls back to the previous checkpoint, so
            // the bound must not advance past it until the next one lands.
            let candidate = descriptors
                .iter()
                .map(|d| d.lowest_lsn)
                .fold(lsn, Lsn::min)
                .min(previous_checkpoint);
            inner.lowest_lsn = inner.lowest_lsn.max(candidate);
            let reclaimed_to = inner.lowest_lsn;
            for id in finalize {
                inner.streams.remove(&id);
                debug!(stream_id = %id, "finalized deferred stream delete");
            }
            debug!(
                lsn,
                lowest_lsn = inner.lowest_lsn,
                streams = descriptors.len(),
                "physical checkpoint"
            );
            (reclaimed_from, reclaimed_to)
        };
        self.space_available.notify_waiters();

        // The region below the new bound is dead; hand it back to the
        // device. Trim failures only cost space, not correctness.
        if reclaimed_to > reclaimed_from {
            let (first, second) = self
                .io
                .geom
                .extents(reclaimed_from, reclaimed_to - reclaimed_from);
            for extent in std::iter::once(first).chain(second) {
                if let Err(e) = self.io.device.trim(extent.file_offset, extent.len).await {
                    warn!(%e, "trim of reclaimed log region failed");
                }
            }
        }
        Ok(())
    }

    /// Serialize a stream's indexes into a chain of stream-checkpoint
    /// records. Segment LSNs are allocated in one allocator hold so the
    /// chain is contiguous in the stream.
    pub(crate) async fn emit_stream_checkpoint(
        &self,
        stream: &Arc<StreamShared>,
    ) -> Result<(), LogError> {
        let payload_budget =
            self.master.max_checkpoint_record_size as usize - RECORD_HEADER_SIZE;
        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            enum Plan {
                Ready {
                    segments: Vec<(Lsn, Lsn, Lsn, Vec<u8>)>,
                    truncation_point: Asn,
                    first_lsn: Lsn,
                },
                Wait,
            }

            let plan = {
                let mut inner = self.shared.lock().unwrap();
                if inner.faulted {
                    return Err(faulted_error());
                }
                let mut s = stream.inner.lock().unwrap();
                let payloads =
                    build_stream_checkpoint_segments(&s.asn_index, &s.lsn_index, payload_budget);
                let total_framed: u64 = payloads
                    .iter()
                    .map(|p| framed_record_size(p.len() as u32, 0))
                    .sum();
                if inner.next_lsn + total_framed - inner.highest_completed_lsn
                    > self.master.max_queued_write_depth as u64
                {
                    Plan::Wait
                } else if Self::free_space_locked(&inner, self.master.log_file_lsn_space)
                    < total_framed + inner.total_reserved
                {
                    return Err(LogError::LogFull);
                } else {
                    let mut segments = Vec::with_capacity(payloads.len());
                    for payload in payloads {
                        let framed = framed_record_size(payload.len() as u32, 0);
                        let lsn = inner.next_lsn;
                        inner.next_lsn += framed;
                        inner.pending.insert(
                            lsn,
                            PendingWrite {
                                end: lsn + framed,
                                done: false,
                            },
                        );
                        let prev = std::mem::replace(&mut s.prev_lsn, lsn);
                        segments.push((lsn, prev, inner.highest_completed_lsn, payload));
                    }
                    let first_lsn = segments[0].0;
                    Plan::Ready {
                        segments,
                        truncation_point: s.truncation_point,
                        first_lsn,
                    }
                }
            };

            match plan {
                Plan::Wait => {
                    notified.await;
                    continue;
                }
                Plan::Ready {
                    segments,
                    truncation_point,
                    first_lsn,
                } => {
                    for (lsn, prev, completed, payload) in segments {
                        let mut header = RecordHeader {
                            lsn,
                            prev_lsn_in_stream: prev,
                            highest_completed_lsn: completed,
                            log_id: self.master.log_id,
                            log_signature: self.master.log_signature,
                            stream_id: stream.stream_id,
                            stream_type: stream.stream_type,
                            record_type: RecordType::StreamCheckpoint,
                            flags: 0,
                            metadata_size: payload.len() as u32,
                            io_buffer_size: 0,
                            truncation_point,
                            checksum: 0,
                        };
                        if let Err(e) = self
                            .io
                            .write_record(&mut header, &payload, &[], IoPriority::Low)
                            .await
                        {
                            error!(lsn, stream_id = %stream.stream_id, "stream checkpoint write failed; faulting log");
                            let mut inner = self.shared.lock().unwrap();
                            inner.faulted = true;
                            drop(inner);
                            self.space_available.notify_waiters();
                            return Err(e);
                        }
                        let mut inner = self.shared.lock().unwrap();
                        Self::complete_write_locked(&mut inner, lsn);
                        drop(inner);
                        self.space_available.notify_waiters();
                    }
                    let mut s = stream.inner.lock().unwrap();
                    s.last_chain_lsn = first_lsn;
                    s.records_since_checkpoint = 0;
                    debug!(stream_id = %stream.stream_id, first_lsn, "stream checkpoint");
                    return Ok(());
                }
            }
        }
    }

    /// Allocate and write one record outside the user ASN machinery (the
    /// physical checkpoint stream). Exempt from the `MinFreeSpace` floor;
    /// that headroom exists precisely so checkpoints can always be cut.
    async fn write_internal_record(
        &self,
        stream: Option<&Arc<StreamShared>>,
        record_type: RecordType,
        truncation_point: Asn,
        metadata: &[u8],
    ) -> Result<Lsn, LogError> {
        let framed = framed_record_size(metadata.len() as u32, 0);
        debug_assert!(framed <= self.master.max_checkpoint_record_size as u64);
        let (lsn, prev_lsn, completed_snapshot) = loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let allocated = {
                let mut inner = self.shared.lock().unwrap();
                if inner.faulted {
                    return Err(faulted_error());
                }
                if inner.next_lsn + framed - inner.highest_completed_lsn
                    > self.master.max_queued_write_depth as u64
                {
                    None
                } else if Self::free_space_locked(&inner, self.master.log_file_lsn_space)
                    < framed + inner.total_reserved
                {
                    return Err(LogError::LogFull);
                } else {
                    let lsn = inner.next_lsn;
                    inner.next_lsn += framed;
                    inner.pending.insert(
                        lsn,
                        PendingWrite {
                            end: lsn + framed,
                            done: false,
                        },
                    );
                    let prev = match stream {
                        Some(shared) => {
                            let mut s = shared.inner.lock().unwrap();
                            std::mem::replace(&mut s.prev_lsn, lsn)
                        }
                        None => std::mem::replace(&mut inner.checkpoint_prev_lsn, lsn),
                    };
                    Some((lsn, prev, inner.highest_completed_lsn))
                }
            };
            match allocated {
                Some(v) => break v,
                None => notified.await,
            }
        };

        let (stream_id, stream_type) = match stream {
            Some(shared) => (shared.stream_id, shared.stream_type),
            None => (CHECKPOINT_STREAM_ID, CHECKPOINT_STREAM_TYPE),
        };
        let mut header = RecordHeader {
            lsn,
            prev_lsn_in_stream: prev_lsn,
            highest_completed_lsn: completed_snapshot,
            log_id: self.master.log_id,
            log_signature: self.master.log_signature,
            stream_id,
            stream_type,
            record_type,
            flags: 0,
            metadata_size: metadata.len() as u32,
            io_buffer_size: 0,
            truncation_point,
            checksum: 0,
        };
        if let Err(e) = self
            .io
            .write_record(&mut header, metadata, &[], IoPriority::High)
            .await
        {
            error!(lsn, "internal record write failed; faulting log");
            let mut inner = self.shared.lock().unwrap();
            inner.faulted = true;
            drop(inner);
            self.space_available.notify_waiters();
            return Err(e);
        }
        let mut inner = self.shared.lock().unwrap();
        Self::complete_write_locked(&mut inner, lsn);
        drop(inner);
        self.space_available.notify_waiters();
        Ok(lsn)
    }
}
