use std::sync::{Arc, Mutex};

use ringlog_common::{
    Asn, Disposition, LogError, Lsn, RecordType, RecordVersion, StreamId, StreamState, StreamType,
    NO_LSN,
};
use tracing::debug;

use crate::asn_index::AsnIndex;
use crate::log::{Log, USER_METADATA_PREFIX};
use crate::lsn_index::LsnIndex;

pub(crate) struct StreamShared {
    pub stream_id: StreamId,
    pub stream_type: StreamType,
    pub inner: Mutex<StreamInner>,
}

pub(crate) struct StreamInner {
    pub asn_index: AsnIndex,
    pub lsn_index: LsnIndex,
    pub reserved_bytes: u64,
    /// LSN of the stream's last allocated record (chain head).
    pub prev_lsn: Lsn,
    pub truncation_point: Asn,
    /// Highest preferred truncation point seen; spendable under space
    /// pressure.
    pub preferred_truncation: Asn,
    /// Truncation requests waiting for persistence to catch up.
    pub holds: Vec<Asn>,
    pub state: StreamState,
    pub open_handles: u32,
    /// First LSN of the latest persisted stream-checkpoint chain. Pins the
    /// ring so recovery can always find the chain.
    pub last_chain_lsn: Lsn,
    pub records_since_checkpoint: u32,
}

impl StreamInner {
    pub fn new_open() -> Self {
        Self {
            asn_index: AsnIndex::new(),
            lsn_index: LsnIndex::new(),
            reserved_bytes: 0,
            prev_lsn: NO_LSN,
            truncation_point: 0,
            preferred_truncation: 0,
            holds: Vec::new(),
            state: StreamState::Open,
            open_handles: 1,
            last_chain_lsn: NO_LSN,
            records_since_checkpoint: 0,
        }
    }

    /// Lowest LSN this stream requires the log to retain: its oldest
    /// indexed record or its latest checkpoint chain, whichever is lower.
    pub fn lowest_retained_lsn(&self) -> Lsn {
        self.lsn_index.lowest_lsn().min(self.last_chain_lsn)
    }
}

// ---------------------------------------------------------------------------
// Query result types
// ---------------------------------------------------------------------------

/// A record returned by [`LogStream::read`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadRecord {
    pub version: RecordVersion,
    pub metadata: Vec<u8>,
    pub io_buffer: Vec<u8>,
}

/// Index metadata for one ASN, as reported by [`LogStream::query_record`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordInfo {
    pub asn: Asn,
    pub version: RecordVersion,
    pub disposition: Disposition,
    pub io_buffer_size: u32,
    pub lsn: Lsn,
}

/// ASN bounds of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordRangeInfo {
    pub lowest_asn: Option<Asn>,
    pub highest_asn: Option<Asn>,
    pub truncation_asn: Asn,
}

// ---------------------------------------------------------------------------
// LogStream handle
// ---------------------------------------------------------------------------

/// Caller-facing handle to one stream. Cloneable state lives in the log;
/// dropping the last handle closes the stream (and lets a deferred delete
/// finalize).
pub struct LogStream {
    log: Arc<Log>,
    shared: Arc<StreamShared>,
}

impl LogStream {
    pub(crate) fn new(log: Arc<Log>, shared: Arc<StreamShared>) -> Self {
        Self { log, shared }
    }

    pub fn id(&self) -> StreamId {
        self.shared.stream_id
    }

    pub fn stream_type(&self) -> StreamType {
        self.shared.stream_type
    }

    /// Append a record. Returns the record's LSN once the write is durable.
    pub async fn write(
        &self,
        asn: Asn,
        version: RecordVersion,
        metadata: &[u8],
        io_buffer: &[u8],
    ) -> Result<Lsn, LogError> {
        self.log
            .write_user_record(&self.shared, 0, asn, version, metadata, io_buffer)
            .await
    }

    /// Append a record consuming pre-reserved space. Never fails for lack
    /// of free space when the record fits in `reserve_to_consume` and the
    /// stream holds that much reservation.
    pub async fn reserved_write(
        &self,
        reserve_to_consume: u64,
        asn: Asn,
        version: RecordVersion,
        metadata: &[u8],
        io_buffer: &[u8],
    ) -> Result<Lsn, LogError> {
        if reserve_to_consume == 0 {
            return Err(LogError::InvalidParameter("zero reservation to consume"));
        }
        self.log
            .write_user_record(
                &self.shared,
                reserve_to_consume,
                asn,
                version,
                metadata,
                io_buffer,
            )
            .await
    }

    /// Read the record at `asn`. Reads see the highest-version `Persisted`
    /// record; an entry still in flight reads as `NotFound` (callers that
    /// race a rewrite retry).
    pub async fn read(&self, asn: Asn) -> Result<ReadRecord, LogError> {
        let lsn = {
            let s = self.shared.inner.lock().unwrap();
            let entry = s.asn_index.get(asn).ok_or(LogError::NotFound)?;
            if entry.disposition != Disposition::Persisted {
                return Err(LogError::NotFound);
            }
            entry.lsn
        };
        let (header, disk_metadata) = self
            .log
            .io
            .read_header_and_metadata(lsn)
            .await?
            .ok_or_else(|| {
                LogError::CorruptLog(format!("persisted record at LSN {lsn} unreadable"))
            })?;
        if header.stream_id != self.shared.stream_id || header.record_type != RecordType::User {
            return Err(LogError::CorruptLog(format!(
                "record at LSN {lsn} does not belong to stream"
            )));
        }
        if disk_metadata.len() < USER_METADATA_PREFIX {
            return Err(LogError::CorruptLog(format!(
                "user record at LSN {lsn} lacks its metadata prefix"
            )));
        }
        let disk_asn = u64::from_le_bytes(disk_metadata[0..8].try_into().unwrap());
        let disk_version = u64::from_le_bytes(disk_metadata[8..16].try_into().unwrap());
        if disk_asn != asn {
            return Err(LogError::CorruptLog(format!(
                "record at LSN {lsn} carries ASN {disk_asn}, expected {asn}"
            )));
        }
        let io_buffer = self.log.io.read_payload(&header).await?;
        Ok(ReadRecord {
            version: disk_version,
            metadata: disk_metadata[USER_METADATA_PREFIX..].to_vec(),
            io_buffer,
        })
    }

    /// Truncate the stream at `truncation_asn`. `preferred_truncation_asn`
    /// (≥ the former) grants the engine room to truncate further under
    /// space pressure.
    pub async fn truncate(
        &self,
        truncation_asn: Asn,
        preferred_truncation_asn: Asn,
    ) -> Result<(), LogError> {
        if preferred_truncation_asn < truncation_asn {
            return Err(LogError::InvalidParameter(
                "preferred truncation below truncation point",
            ));
        }
        {
            let mut s = self.shared.inner.lock().unwrap();
            s.preferred_truncation = s.preferred_truncation.max(preferred_truncation_asn);
        }
        self.log.truncate_stream(&self.shared, truncation_asn).await
    }

    /// Adjust this stream's reservation by `delta_bytes`.
    pub fn update_reservation(&self, delta_bytes: i64) -> Result<(), LogError> {
        self.log.update_reservation(&self.shared, delta_bytes)
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.shared.inner.lock().unwrap().reserved_bytes
    }

    pub fn query_record(&self, asn: Asn) -> Result<RecordInfo, LogError> {
        let s = self.shared.inner.lock().unwrap();
        let entry = s.asn_index.get(asn).ok_or(LogError::NotFound)?;
        Ok(RecordInfo {
            asn: entry.asn,
            version: entry.version,
            disposition: entry.disposition,
            io_buffer_size: entry.io_buffer_size,
            lsn: entry.lsn,
        })
    }

    pub fn query_records(&self, lo: Asn, hi: Asn) -> Vec<RecordInfo> {
        let s = self.shared.inner.lock().unwrap();
        s.asn_index
            .range(lo, hi)
            .map(|entry| RecordInfo {
                asn: entry.asn,
                version: entry.version,
                disposition: entry.disposition,
                io_buffer_size: entry.io_buffer_size,
                lsn: entry.lsn,
            })
            .collect()
    }

    pub fn query_record_range(&self) -> RecordRangeInfo {
        let s = self.shared.inner.lock().unwrap();
        RecordRangeInfo {
            lowest_asn: s.asn_index.lowest_asn(),
            highest_asn: s.asn_index.highest_asn(),
            truncation_asn: s.truncation_point,
        }
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        let mut s = self.shared.inner.lock().unwrap();
        s.open_handles = s.open_handles.saturating_sub(1);
        if s.open_handles == 0 && s.state == StreamState::Open {
            s.state = StreamState::Closed;
            debug!(stream_id = %self.shared.stream_id, "stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogOptions;
    use crate::log::Log;
    use ringlog_common::{LogId, BLOCK_SIZE};
    use ringlog_device::{BlockDevice, FileDevice};
    use tempfile::TempDir;

    fn small_options() -> LogOptions {
        LogOptions {
            log_file_size: 2 << 20,
            max_record_size: 64 * 1024,
            max_checkpoint_record_size: 64 * 1024,
            max_queued_write_depth: 128 * 1024,
            max_streams: 8,
            checkpoint_interval: 1 << 20,
            min_free_space: 128 * 1024,
            stream_checkpoint_record_interval: 64,
            sparse: true,
        }
    }

    async fn new_log(dir: &TempDir) -> Arc<Log> {
        let options = small_options();
        let device: Arc<dyn BlockDevice> = Arc::new(
            FileDevice::create(
                &dir.path().join("test.rlog"),
                options.log_file_size,
                true,
            )
            .unwrap(),
        );
        Log::create(device, LogId::new_random(), &options).await.unwrap()
    }

    fn payload(fill: u8, blocks: usize) -> Vec<u8> {
        vec![fill; blocks * BLOCK_SIZE]
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        stream.write(1, 1, b"meta-1", &payload(0xAB, 2)).await.unwrap();

        let got = stream.read(1).await.unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.metadata, b"meta-1");
        assert_eq!(got.io_buffer, payload(0xAB, 2));
    }

    #[tokio::test]
    async fn test_read_missing_asn() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();
        assert!(matches!(stream.read(42).await, Err(LogError::NotFound)));
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        stream.write(1, 5, b"v5", &[]).await.unwrap();
        assert!(matches!(
            stream.write(1, 5, b"again", &[]).await,
            Err(LogError::StaleVersion { .. })
        ));
        assert!(matches!(
            stream.write(1, 4, b"older", &[]).await,
            Err(LogError::StaleVersion { .. })
        ));

        // Higher version replaces.
        stream.write(1, 6, b"v6", &[]).await.unwrap();
        assert_eq!(stream.read(1).await.unwrap().metadata, b"v6");
    }

    #[tokio::test]
    async fn test_unaligned_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();
        assert!(matches!(
            stream.write(1, 1, b"m", &[0u8; 100]).await,
            Err(LogError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_record_rejected_at_admission() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();
        // 64 KiB max framed size; 17 payload blocks exceeds it.
        let err = stream.write(1, 1, b"", &payload(0, 17)).await.unwrap_err();
        assert!(matches!(err, LogError::InvalidParameter(_)));
        // Nothing admitted.
        assert!(matches!(stream.query_record(1), Err(LogError::NotFound)));
    }

    #[tokio::test]
    async fn test_truncate_applies_and_queries() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        for asn in 1..=20u64 {
            stream.write(asn, 1, &asn.to_le_bytes(), &payload(asn as u8, 1)).await.unwrap();
        }
        stream.truncate(10, 10).await.unwrap();

        let range = stream.query_record_range();
        assert_eq!(range.lowest_asn, Some(11));
        assert_eq!(range.highest_asn, Some(20));
        assert_eq!(range.truncation_asn, 10);

        for asn in 1..=10u64 {
            assert!(matches!(stream.read(asn).await, Err(LogError::NotFound)));
        }
        for asn in 11..=20u64 {
            assert_eq!(stream.read(asn).await.unwrap().io_buffer, payload(asn as u8, 1));
        }

        // Writes at or below the truncation point are refused.
        assert!(matches!(
            stream.write(10, 9, b"", &[]).await,
            Err(LogError::InvalidParameter(_))
        ));
    }

    #[tokio::test]
    async fn test_truncation_held_until_persistence() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        for asn in 1..=5u64 {
            stream.write(asn, 1, b"", &[]).await.unwrap();
        }
        // ASN 50 has not been written yet: the request must park.
        stream.truncate(50, 50).await.unwrap();
        assert_eq!(stream.query_record_range().truncation_asn, 0);
        assert_eq!(stream.query_record_range().lowest_asn, Some(1));

        // Writing through ASN 50 releases the hold.
        for asn in 6..=50u64 {
            stream.write(asn, 1, b"", &[]).await.unwrap();
        }
        let range = stream.query_record_range();
        assert_eq!(range.truncation_asn, 50);
        assert_eq!(range.lowest_asn, None);
    }

    #[tokio::test]
    async fn test_reservation_accounting() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        stream.update_reservation(64 * 1024).unwrap();
        assert_eq!(stream.reserved_bytes(), 64 * 1024);
        assert_eq!(log.query_current_reservation(), 64 * 1024);

        // Releasing more than held is refused.
        assert!(matches!(
            stream.update_reservation(-(128 * 1024)),
            Err(LogError::ReserveTooSmall)
        ));

        // A reserved write debits exactly the record's on-disk size.
        let before = stream.reserved_bytes();
        stream
            .reserved_write(16 * 1024, 1, 1, b"r", &payload(1, 1))
            .await
            .unwrap();
        let framed = ringlog_common::framed_record_size(
            (USER_METADATA_PREFIX + 1) as u32,
            BLOCK_SIZE as u32,
        );
        assert_eq!(stream.reserved_bytes(), before - framed);
        assert_eq!(log.query_current_reservation(), before - framed);

        stream.update_reservation(-(stream.reserved_bytes() as i64)).unwrap();
        assert_eq!(log.query_current_reservation(), 0);
    }

    #[tokio::test]
    async fn test_reserved_write_needs_enough_reserve() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        stream.update_reservation(8 * 1024).unwrap();
        // Record needs two blocks; consuming only one block's worth fails.
        let err = stream
            .reserved_write(4 * 1024, 1, 1, b"", &payload(0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::ReserveTooSmall));
        // Rolled back: nothing admitted, reservation untouched.
        assert!(matches!(stream.query_record(1), Err(LogError::NotFound)));
        assert_eq!(stream.reserved_bytes(), 8 * 1024);
    }

    #[tokio::test]
    async fn test_ordinary_writes_cannot_consume_reserved_space() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let s1 = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();
        let s2 = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        // Reserve everything that can be reserved.
        let free = log.free_space();
        let reservable = free - small_options().min_free_space;
        s1.update_reservation(reservable as i64).unwrap();

        // An ordinary write from another stream finds no room.
        assert!(matches!(
            s2.write(1, 1, b"", &payload(0, 1)).await,
            Err(LogError::LogFull)
        ));

        // The reserving stream can still write through its reservation.
        s1.reserved_write(8 * 1024, 1, 1, b"", &payload(7, 1))
            .await
            .unwrap();
        assert_eq!(s1.read(1).await.unwrap().io_buffer, payload(7, 1));
    }

    #[tokio::test]
    async fn test_query_records_snapshot() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        for asn in [3u64, 1, 7] {
            stream.write(asn, asn, b"", &[]).await.unwrap();
        }
        let records = stream.query_records(1, 7);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].asn, 1);
        assert_eq!(records[2].asn, 7);
        assert!(records
            .iter()
            .all(|r| r.disposition == Disposition::Persisted));

        let one = stream.query_record(3).unwrap();
        assert_eq!(one.version, 3);
        assert_ne!(one.lsn, NO_LSN);
    }

    #[tokio::test]
    async fn test_stream_states_and_deferred_delete() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let id = StreamId::new_random();
        let stream = log
            .create_stream(id, StreamType::new_random())
            .await
            .unwrap();
        assert_eq!(log.query_stream_state(id), StreamState::Open);

        // Delete while open is deferred.
        log.delete_stream(id).await.unwrap();
        assert_eq!(log.query_stream_state(id), StreamState::Deleted);
        assert!(matches!(stream.write(1, 1, b"", &[]).await, Err(LogError::NotFound)));

        // Dropping the handle and checkpointing finalizes the removal.
        drop(stream);
        log.checkpoint_now().await.unwrap();
        assert_eq!(log.query_stream_state(id), StreamState::Deleted);
        assert!(log.open_stream(id).is_err());
    }

    #[tokio::test]
    async fn test_close_reopens_as_same_stream() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let id = StreamId::new_random();
        {
            let stream = log
                .create_stream(id, StreamType::new_random())
                .await
                .unwrap();
            stream.write(1, 1, b"first", &[]).await.unwrap();
        }
        assert_eq!(log.query_stream_state(id), StreamState::Closed);

        let stream = log.open_stream(id).unwrap();
        assert_eq!(log.query_stream_state(id), StreamState::Open);
        assert_eq!(stream.read(1).await.unwrap().metadata, b"first");
    }

    #[tokio::test]
    async fn test_stream_limit() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let mut held = Vec::new();
        for _ in 0..small_options().max_streams {
            held.push(
                log.create_stream(StreamId::new_random(), StreamType::new_random())
                    .await
                    .unwrap(),
            );
        }
        assert!(matches!(
            log.create_stream(StreamId::new_random(), StreamType::new_random())
                .await,
            Err(LogError::ResourceExhausted(_))
        ));
    }

    #[tokio::test]
    async fn test_log_full_then_truncate_frees_space() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = log
            .create_stream(StreamId::new_random(), StreamType::new_random())
            .await
            .unwrap();

        // Fill until LogFull.
        let mut asn = 0u64;
        loop {
            asn += 1;
            match stream.write(asn, 1, b"", &payload(1, 4)).await {
                Ok(_) => continue,
                Err(LogError::LogFull) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let highest = asn - 1;

        // Truncate the lower half and retry.
        stream.truncate(highest / 2, highest / 2).await.unwrap();
        stream.write(asn, 1, b"", &payload(1, 4)).await.unwrap();
        assert_eq!(stream.query_record_range().highest_asn, Some(asn));
    }

    #[tokio::test]
    async fn test_concurrent_writers_same_stream() {
        let dir = TempDir::new().unwrap();
        let log = new_log(&dir).await;
        let stream = Arc::new(
            log.create_stream(StreamId::new_random(), StreamType::new_random())
                .await
                .unwrap(),
        );

        let mut tasks = Vec::new();
        for asn in 1..=32u64 {
            let stream = stream.clone();
            tasks.push(tokio::spawn(async move {
                stream
                    .write(asn, 1, &asn.to_le_bytes(), &payload(asn as u8, 1))
                    .await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        for asn in 1..=32u64 {
            let got = stream.read(asn).await.unwrap();
            assert_eq!(got.metadata, asn.to_le_bytes());
        }
        let positions = log.positions();
        assert_eq!(positions.next_lsn, positions.highest_completed_lsn);
    }
}
