use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ringlog_common::{LogError, BLOCK_SIZE};
use tracing::debug;

use crate::{AllocatedRange, BlockDevice, IoPriority};

#[derive(Clone, Copy, Debug)]
struct ByteRange {
    offset: u64,
    len: u64,
}

impl ByteRange {
    fn intersects(&self, offset: u64, len: u64) -> bool {
        offset < self.offset + self.len && self.offset < offset + len
    }
}

#[derive(Default)]
struct FaultPlan {
    /// Writes to these ranges are silently dropped block-by-block; the
    /// caller still sees success (a lost sector).
    drop_writes: Vec<ByteRange>,
    /// Writes touching these ranges fail with an I/O error.
    fail_writes: Vec<ByteRange>,
    /// Reads touching these ranges fail with an I/O error.
    fail_reads: Vec<ByteRange>,
}

/// Fault-injecting decorator around a concrete [`BlockDevice`].
///
/// Tests arm block ranges to be dropped or failed and then crash/reopen the
/// log to exercise recovery. The decorator preserves request identity: each
/// engine-issued request maps to exactly one inner request (possibly split
/// at dropped blocks).
pub struct FaultDevice {
    inner: Arc<dyn BlockDevice>,
    plan: Mutex<FaultPlan>,
    reads_seen: AtomicU64,
    writes_seen: AtomicU64,
    writes_dropped: AtomicU64,
}

impl FaultDevice {
    pub fn new(inner: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            plan: Mutex::new(FaultPlan::default()),
            reads_seen: AtomicU64::new(0),
            writes_seen: AtomicU64::new(0),
            writes_dropped: AtomicU64::new(0),
        })
    }

    /// Silently drop future writes to the given byte range.
    pub fn drop_writes_in(&self, offset: u64, len: u64) {
        debug!(offset, len, "arming dropped-write fault");
        self.plan
            .lock()
            .unwrap()
            .drop_writes
            .push(ByteRange { offset, len });
    }

    /// Fail future writes touching the given byte range.
    pub fn fail_writes_in(&self, offset: u64, len: u64) {
        self.plan
            .lock()
            .unwrap()
            .fail_writes
            .push(ByteRange { offset, len });
    }

    /// Fail future reads touching the given byte range.
    pub fn fail_reads_in(&self, offset: u64, len: u64) {
        self.plan
            .lock()
            .unwrap()
            .fail_reads
            .push(ByteRange { offset, len });
    }

    pub fn clear_faults(&self) {
        let mut plan = self.plan.lock().unwrap();
        plan.drop_writes.clear();
        plan.fail_writes.clear();
        plan.fail_reads.clear();
    }

    pub fn writes_seen(&self) -> u64 {
        self.writes_seen.load(Ordering::Relaxed)
    }

    pub fn writes_dropped(&self) -> u64 {
        self.writes_dropped.load(Ordering::Relaxed)
    }

    fn injected_error() -> LogError {
        LogError::Io(io::Error::new(io::ErrorKind::Other, "injected device fault"))
    }
}

#[async_trait]
impl BlockDevice for FaultDevice {
    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, LogError> {
        self.reads_seen.fetch_add(1, Ordering::Relaxed);
        {
            let plan = self.plan.lock().unwrap();
            if plan.fail_reads.iter().any(|r| r.intersects(offset, len as u64)) {
                return Err(Self::injected_error());
            }
        }
        self.inner.read(offset, len).await
    }

    async fn write(&self, offset: u64, buf: &[u8], priority: IoPriority) -> Result<(), LogError> {
        self.writes_seen.fetch_add(1, Ordering::Relaxed);
        let drops: Vec<ByteRange> = {
            let plan = self.plan.lock().unwrap();
            if plan.fail_writes.iter().any(|r| r.intersects(offset, buf.len() as u64)) {
                return Err(Self::injected_error());
            }
            plan.drop_writes
                .iter()
                .filter(|r| r.intersects(offset, buf.len() as u64))
                .copied()
                .collect()
        };

        if drops.is_empty() {
            return self.inner.write(offset, buf, priority).await;
        }

        // Write block-by-block, skipping blocks inside a dropped range.
        let block = BLOCK_SIZE as u64;
        let mut at = 0u64;
        while at < buf.len() as u64 {
            let abs = offset + at;
            let chunk = block.min(buf.len() as u64 - at);
            if drops.iter().any(|r| r.intersects(abs, chunk)) {
                self.writes_dropped.fetch_add(1, Ordering::Relaxed);
            } else {
                self.inner
                    .write(abs, &buf[at as usize..(at + chunk) as usize], priority)
                    .await?;
            }
            at += chunk;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), LogError> {
        self.inner.flush().await
    }

    async fn trim(&self, offset: u64, len: u64) -> Result<(), LogError> {
        self.inner.trim(offset, len).await
    }

    async fn query_allocations(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<Vec<AllocatedRange>, LogError> {
        self.inner.query_allocations(offset, len).await
    }

    fn set_priority_hint(&self, priority: IoPriority) {
        self.inner.set_priority_hint(priority);
    }

    async fn set_sparse(&self, sparse: bool) -> Result<(), LogError> {
        self.inner.set_sparse(sparse).await
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}
