use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use async_trait::async_trait;
use ringlog_common::{LogError, BLOCK_SIZE};
use tracing::debug;

use crate::{check_alignment, AllocatedRange, BlockDevice, IoPriority};

/// [`BlockDevice`] over one regular file, using positioned I/O so that
/// concurrent requests need no shared cursor.
pub struct FileDevice {
    file: File,
    len: u64,
    sparse: AtomicBool,
    priority_hint: AtomicU8,
}

impl FileDevice {
    /// Create a new file of exactly `len` bytes. The file is created
    /// sparse; blocks read as zeros until written.
    pub fn create(path: &Path, len: u64, sparse: bool) -> Result<Self, LogError> {
        check_alignment(0, len)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len)?;
        file.sync_all()?;
        debug!(path = %path.display(), len, sparse, "created log file");
        Ok(Self {
            file,
            len,
            sparse: AtomicBool::new(sparse),
            priority_hint: AtomicU8::new(priority_to_u8(IoPriority::Normal)),
        })
    }

    /// Open an existing file read/write.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        check_alignment(0, len)?;
        Ok(Self {
            file,
            len,
            sparse: AtomicBool::new(true),
            priority_hint: AtomicU8::new(priority_to_u8(IoPriority::Normal)),
        })
    }
}

fn priority_to_u8(p: IoPriority) -> u8 {
    match p {
        IoPriority::Low => 0,
        IoPriority::Normal => 1,
        IoPriority::High => 2,
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, LogError> {
        check_alignment(offset, len as u64)?;
        if offset + len as u64 > self.len {
            return Err(LogError::InvalidParameter("read beyond device end"));
        }
        let mut buf = vec![0u8; len];
        let mut done = 0usize;
        while done < len {
            // Short reads past the last allocated extent leave the tail
            // zeroed, which is exactly the hole semantic the engine wants.
            let n = self.file.read_at(&mut buf[done..], offset + done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(buf)
    }

    async fn write(&self, offset: u64, buf: &[u8], _priority: IoPriority) -> Result<(), LogError> {
        check_alignment(offset, buf.len() as u64)?;
        if offset + buf.len() as u64 > self.len {
            return Err(LogError::InvalidParameter("write beyond device end"));
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), LogError> {
        self.file.sync_all()?;
        Ok(())
    }

    async fn trim(&self, offset: u64, len: u64) -> Result<(), LogError> {
        check_alignment(offset, len)?;
        // Zero-fill in block-sized chunks; platform hole punching is left
        // to the filesystem. Reads of the range come back as zeros either
        // way, which is the contract.
        let zeros = vec![0u8; BLOCK_SIZE * 16];
        let mut at = offset;
        let end = offset + len;
        while at < end {
            let chunk = ((end - at) as usize).min(zeros.len());
            self.file.write_all_at(&zeros[..chunk], at)?;
            at += chunk as u64;
        }
        Ok(())
    }

    async fn query_allocations(
        &self,
        offset: u64,
        len: u64,
    ) -> Result<Vec<AllocatedRange>, LogError> {
        check_alignment(offset, len)?;
        let end = (offset + len).min(self.len);
        if end <= offset {
            return Ok(Vec::new());
        }
        Ok(vec![AllocatedRange {
            offset,
            len: end - offset,
        }])
    }

    fn set_priority_hint(&self, priority: IoPriority) {
        self.priority_hint
            .store(priority_to_u8(priority), Ordering::Relaxed);
    }

    async fn set_sparse(&self, sparse: bool) -> Result<(), LogError> {
        self.sparse.store(sparse, Ordering::Relaxed);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LEN: u64 = 64 * BLOCK_SIZE as u64;

    #[tokio::test]
    async fn test_create_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.rlog");
        let dev = FileDevice::create(&path, LEN, true).unwrap();

        let block = vec![0x5Au8; BLOCK_SIZE];
        dev.write(BLOCK_SIZE as u64, &block, IoPriority::Normal)
            .await
            .unwrap();
        dev.flush().await.unwrap();

        let got = dev.read(BLOCK_SIZE as u64, BLOCK_SIZE).await.unwrap();
        assert_eq!(got, block);
    }

    #[tokio::test]
    async fn test_holes_read_as_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.rlog");
        let dev = FileDevice::create(&path, LEN, true).unwrap();

        let got = dev.read(8 * BLOCK_SIZE as u64, 2 * BLOCK_SIZE).await.unwrap();
        assert_eq!(got.len(), 2 * BLOCK_SIZE);
        assert!(got.iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_unaligned_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.rlog");
        let dev = FileDevice::create(&path, LEN, true).unwrap();

        let err = dev.read(1, BLOCK_SIZE).await.unwrap_err();
        assert!(matches!(err, LogError::InvalidParameter(_)));
        let err = dev
            .write(0, &[0u8; 100], IoPriority::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::InvalidParameter(_)));
    }

    #[tokio::test]
    async fn test_trim_zeroes_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.rlog");
        let dev = FileDevice::create(&path, LEN, true).unwrap();

        let block = vec![0xEEu8; 4 * BLOCK_SIZE];
        dev.write(0, &block, IoPriority::Normal).await.unwrap();
        dev.trim(BLOCK_SIZE as u64, 2 * BLOCK_SIZE as u64).await.unwrap();

        let got = dev.read(0, 4 * BLOCK_SIZE).await.unwrap();
        assert!(got[..BLOCK_SIZE].iter().all(|&b| b == 0xEE));
        assert!(got[BLOCK_SIZE..3 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(got[3 * BLOCK_SIZE..].iter().all(|&b| b == 0xEE));
    }

    #[tokio::test]
    async fn test_reopen_preserves_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.rlog");
        {
            let dev = FileDevice::create(&path, LEN, true).unwrap();
            dev.write(0, &vec![0x11u8; BLOCK_SIZE], IoPriority::Normal)
                .await
                .unwrap();
            dev.flush().await.unwrap();
        }
        let dev = FileDevice::open(&path).unwrap();
        assert_eq!(dev.len(), LEN);
        let got = dev.read(0, BLOCK_SIZE).await.unwrap();
        assert!(got.iter().all(|&b| b == 0x11));
    }
}
