use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ringlog_common::{LogError, LogId, Lsn, StreamId, StreamType, BLOCK_SIZE};
use ringlog_device::{BlockDevice, FaultDevice, FileBackend, StorageBackend};
use ringlog_engine::{Log, LogManager, LogOptions};
use tempfile::TempDir;

// =========================================================================
// Fault-injecting backend: every device the manager opens is wrapped in a
// FaultDevice, so tests can drop or fail specific blocks and then crash.
// =========================================================================

struct FaultBackend {
    inner: FileBackend,
    devices: Mutex<HashMap<PathBuf, Arc<FaultDevice>>>,
}

impl FaultBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: FileBackend,
            devices: Mutex::new(HashMap::new()),
        })
    }

    fn device(&self, path: &Path) -> Arc<FaultDevice> {
        self.devices
            .lock()
            .unwrap()
            .get(path)
            .expect("device opened through backend")
            .clone()
    }
}

#[async_trait]
impl StorageBackend for FaultBackend {
    async fn create(
        &self,
        path: &Path,
        len: u64,
        sparse: bool,
    ) -> Result<Arc<dyn BlockDevice>, LogError> {
        let device = self.inner.create(path, len, sparse).await?;
        let wrapped = FaultDevice::new(device);
        self.devices
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), wrapped.clone());
        Ok(wrapped)
    }

    async fn open(&self, path: &Path) -> Result<Arc<dyn BlockDevice>, LogError> {
        let device = self.inner.open(path).await?;
        let wrapped = FaultDevice::new(device);
        self.devices
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), wrapped.clone());
        Ok(wrapped)
    }

    async fn delete(&self, path: &Path) -> Result<(), LogError> {
        self.devices.lock().unwrap().remove(path);
        self.inner.delete(path).await
    }

    async fn enumerate(&self, dir: &Path) -> Result<Vec<PathBuf>, LogError> {
        self.inner.enumerate(dir).await
    }
}

fn test_options() -> LogOptions {
    LogOptions {
        log_file_size: 4 << 20,
        max_record_size: 64 * 1024,
        max_checkpoint_record_size: 64 * 1024,
        max_queued_write_depth: 256 * 1024,
        max_streams: 8,
        checkpoint_interval: 1 << 20,
        min_free_space: 128 * 1024,
        stream_checkpoint_record_interval: 512,
        sparse: true,
    }
}

fn payload(asn: u64, blocks: usize) -> Vec<u8> {
    vec![asn as u8; blocks * BLOCK_SIZE]
}

/// File offset of the next record the log will allocate.
fn next_record_offset(log: &Arc<Log>) -> u64 {
    2 * BLOCK_SIZE as u64 + log.positions().next_lsn % log.total_space()
}

// =========================================================================
// Test: a silently dropped header block at the head; the record looks
// written to the engine, but recovery truncates the log just before it and
// a fresh write at the same ASN then succeeds
// =========================================================================
#[tokio::test]
async fn test_dropped_head_write_reverse_truncates() {
    let dir = TempDir::new().unwrap();
    let backend = FaultBackend::new();
    let manager = LogManager::with_backend(dir.path(), backend.clone());
    let log_id = LogId::new_random();
    let stream_id = StreamId::new_random();
    let path = manager.log_path(log_id);

    let next_before_crash;
    let fault_lsn;
    {
        let log = manager.create_log(log_id, &test_options()).await.unwrap();
        let stream = log
            .create_stream(stream_id, StreamType::new_random())
            .await
            .unwrap();
        for asn in 1..=99u64 {
            stream
                .write(asn, 1, &asn.to_le_bytes(), &payload(asn, 1))
                .await
                .unwrap();
        }

        // The next record's header block never reaches the platter.
        fault_lsn = log.positions().next_lsn;
        backend
            .device(&path)
            .drop_writes_in(next_record_offset(&log), BLOCK_SIZE as u64);
        stream
            .write(100, 1, &100u64.to_le_bytes(), &payload(100, 1))
            .await
            .unwrap();
        next_before_crash = log.positions().next_lsn;
        // Crash here.
    }
    backend.device(&path).clear_faults();

    let log = manager.open_log(log_id).await.unwrap();
    let positions = log.positions();
    assert_eq!(positions.next_lsn, fault_lsn);
    // Chaos-bound property: the recovered head is within the queued-write
    // window of the pre-crash head.
    assert!(next_before_crash - positions.next_lsn <= test_options().max_queued_write_depth as u64);

    let stream = log.open_stream(stream_id).unwrap();
    let range = stream.query_record_range();
    assert_eq!(range.highest_asn, Some(99));
    assert!(matches!(stream.read(100).await, Err(LogError::NotFound)));
    for asn in 1..=99u64 {
        assert_eq!(stream.read(asn).await.unwrap().io_buffer, payload(asn, 1));
    }

    // The lost ASN can simply be written again.
    stream
        .write(100, 1, &100u64.to_le_bytes(), &payload(100, 1))
        .await
        .unwrap();
    assert_eq!(stream.read(100).await.unwrap().io_buffer, payload(100, 1));
}

// =========================================================================
// Test: a dropped block inside a physical checkpoint record; recovery
// falls back to the previous checkpoint and re-derives the stream set and
// records from the forward scan
// =========================================================================
#[tokio::test]
async fn test_dropped_checkpoint_falls_back() {
    let dir = TempDir::new().unwrap();
    let backend = FaultBackend::new();
    let manager = LogManager::with_backend(dir.path(), backend.clone());
    let log_id = LogId::new_random();
    let stream_id = StreamId::new_random();
    let path = manager.log_path(log_id);

    let lost_checkpoint_lsn;
    {
        let log = manager.create_log(log_id, &test_options()).await.unwrap();
        let stream = log
            .create_stream(stream_id, StreamType::new_random())
            .await
            .unwrap();
        for asn in 1..=8u64 {
            stream
                .write(asn, 1, &asn.to_le_bytes(), &payload(asn, 2))
                .await
                .unwrap();
        }

        lost_checkpoint_lsn = log.positions().next_lsn;
        backend
            .device(&path)
            .drop_writes_in(next_record_offset(&log), BLOCK_SIZE as u64);
        log.checkpoint_now().await.unwrap();
        assert_eq!(log.positions().highest_checkpoint_lsn, lost_checkpoint_lsn);
        // Crash here.
    }
    backend.device(&path).clear_faults();

    let log = manager.open_log(log_id).await.unwrap();
    let positions = log.positions();
    // The lost checkpoint is gone; an earlier one is authoritative.
    assert!(positions.highest_checkpoint_lsn < lost_checkpoint_lsn);
    assert_eq!(positions.next_lsn, lost_checkpoint_lsn);

    let stream = log.open_stream(stream_id).unwrap();
    let range = stream.query_record_range();
    assert_eq!(range.lowest_asn, Some(1));
    assert_eq!(range.highest_asn, Some(8));
    for asn in 1..=8u64 {
        assert_eq!(stream.read(asn).await.unwrap().io_buffer, payload(asn, 2));
    }
}

// =========================================================================
// Test: a dropped payload block with the stream's verifier registered;
// the header validates, the verifier flags the payload, the log truncates
// at the faulted record
// =========================================================================

struct FillVerifier;

impl ringlog_common::RecordVerifier for FillVerifier {
    fn verify(
        &self,
        _stream_type: StreamType,
        metadata: &[u8],
        io_buffer: &[u8],
    ) -> Result<(), LogError> {
        let fill = *metadata.first().unwrap_or(&0);
        if io_buffer.iter().all(|&b| b == fill) {
            Ok(())
        } else {
            Err(LogError::StructureFault(
                "payload bytes disagree with metadata fill".to_string(),
            ))
        }
    }
}

#[tokio::test]
async fn test_dropped_payload_block_with_verifier() {
    let dir = TempDir::new().unwrap();
    let backend = FaultBackend::new();
    let manager = LogManager::with_backend(dir.path(), backend.clone());
    let stream_type = StreamType::new_random();
    manager.register_verifier(stream_type, Arc::new(FillVerifier));
    let log_id = LogId::new_random();
    let stream_id = StreamId::new_random();
    let path = manager.log_path(log_id);

    let fault_lsn;
    {
        let log = manager.create_log(log_id, &test_options()).await.unwrap();
        let stream = log.create_stream(stream_id, stream_type).await.unwrap();
        for asn in 1..=20u64 {
            stream.write(asn, 1, &[asn as u8], &payload(asn, 2)).await.unwrap();
        }

        // Drop the second payload block of the next record (header block +
        // payload block 1 land, payload block 2 is lost).
        fault_lsn = log.positions().next_lsn;
        backend
            .device(&path)
            .drop_writes_in(next_record_offset(&log) + 2 * BLOCK_SIZE as u64, BLOCK_SIZE as u64);
        stream.write(21, 1, &[21u8], &payload(21, 2)).await.unwrap();
        // Crash here.
    }
    backend.device(&path).clear_faults();

    let log = manager.open_log(log_id).await.unwrap();
    assert_eq!(log.positions().next_lsn, fault_lsn);
    let stream = log.open_stream(stream_id).unwrap();
    assert_eq!(stream.query_record_range().highest_asn, Some(20));
    assert!(matches!(stream.read(21).await, Err(LogError::NotFound)));
}

// =========================================================================
// Test: a failed (not dropped) device write faults the log immediately;
// the write errors, later writes are refused, and reopen recovers every
// prior record
// =========================================================================
#[tokio::test]
async fn test_failed_write_faults_log_until_reopen() {
    let dir = TempDir::new().unwrap();
    let backend = FaultBackend::new();
    let manager = LogManager::with_backend(dir.path(), backend.clone());
    let log_id = LogId::new_random();
    let stream_id = StreamId::new_random();
    let path = manager.log_path(log_id);

    {
        let log = manager.create_log(log_id, &test_options()).await.unwrap();
        let stream = log
            .create_stream(stream_id, StreamType::new_random())
            .await
            .unwrap();
        for asn in 1..=10u64 {
            stream.write(asn, 1, b"", &payload(asn, 1)).await.unwrap();
        }

        backend
            .device(&path)
            .fail_writes_in(next_record_offset(&log), BLOCK_SIZE as u64);
        assert!(matches!(
            stream.write(11, 1, b"", &payload(11, 1)).await,
            Err(LogError::Io(_))
        ));
        // Rolled back: the ASN is not admitted.
        assert!(matches!(stream.query_record(11), Err(LogError::NotFound)));

        // The log is faulted; even fault-free writes are refused now.
        backend.device(&path).clear_faults();
        assert!(matches!(
            stream.write(12, 1, b"", &payload(12, 1)).await,
            Err(LogError::Io(_))
        ));
    }

    let log = manager.open_log(log_id).await.unwrap();
    let stream = log.open_stream(stream_id).unwrap();
    assert_eq!(stream.query_record_range().highest_asn, Some(10));
    for asn in 1..=10u64 {
        assert_eq!(stream.read(asn).await.unwrap().io_buffer, payload(asn, 1));
    }
    stream.write(11, 1, b"", &payload(11, 1)).await.unwrap();
}

// =========================================================================
// Test: open→close→open with no intervening faults is an identity on
// watermarks and stream indexes
// =========================================================================
#[tokio::test]
async fn test_clean_reopen_is_identity() {
    let dir = TempDir::new().unwrap();
    let backend = FaultBackend::new();
    let manager = LogManager::with_backend(dir.path(), backend.clone());
    let log_id = LogId::new_random();
    let stream_id = StreamId::new_random();

    let (positions, records): (_, Vec<(u64, Lsn)>) = {
        let log = manager.create_log(log_id, &test_options()).await.unwrap();
        let stream = log
            .create_stream(stream_id, StreamType::new_random())
            .await
            .unwrap();
        for asn in 1..=30u64 {
            stream.write(asn, 1, &asn.to_le_bytes(), &payload(asn, 1)).await.unwrap();
        }
        stream.truncate(10, 10).await.unwrap();
        let records = stream
            .query_records(1, 30)
            .into_iter()
            .map(|r| (r.asn, r.lsn))
            .collect();
        (log.positions(), records)
    };

    let first = manager.open_log(log_id).await.unwrap();
    let first_positions = first.positions();
    assert_eq!(first_positions, positions);
    let stream = first.open_stream(stream_id).unwrap();
    let reopened: Vec<(u64, Lsn)> = stream
        .query_records(1, 30)
        .into_iter()
        .map(|r| (r.asn, r.lsn))
        .collect();
    assert_eq!(reopened, records);

    // And once more: recovery is idempotent.
    drop(stream);
    drop(first);
    let second = manager.open_log(log_id).await.unwrap();
    assert_eq!(second.positions(), first_positions);
}
