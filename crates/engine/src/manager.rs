use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use ringlog_common::{LogError, LogId, RecordVerifier, StreamType, BLOCK_SIZE};
use ringlog_device::{BlockDevice, FileBackend, IoPriority, StorageBackend};
use tracing::{info, warn};

use crate::config::LogOptions;
use crate::layout::{read_masters, RecordIo};
use crate::log::Log;
use crate::recovery::{recover_log, VerifierMap};

/// Entry point of the engine: creates, opens, deletes and enumerates log
/// files, holds the record-verifier registry, and shares open-log handles
/// (opening an already-open log returns the same `Log`).
///
/// One `LogManager` per process is the expected shape; tests construct one
/// per case.
pub struct LogManager {
    root: PathBuf,
    backend: Arc<dyn StorageBackend>,
    verifiers: Mutex<VerifierMap>,
    open_logs: Mutex<HashMap<LogId, Weak<Log>>>,
    stream_checkpoint_record_interval: u32,
}

impl LogManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_backend(root, Arc::new(FileBackend))
    }

    /// Construct with a custom storage backend (tests wrap devices in a
    /// fault injector this way).
    pub fn with_backend(root: impl Into<PathBuf>, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            root: root.into(),
            backend,
            verifiers: Mutex::new(VerifierMap::new()),
            open_logs: Mutex::new(HashMap::new()),
            stream_checkpoint_record_interval: LogOptions::default()
                .stream_checkpoint_record_interval,
        }
    }

    /// Register the payload verifier for a stream type. Recovery consults
    /// the registry for every user record it reads.
    pub fn register_verifier(&self, stream_type: StreamType, verifier: Arc<dyn RecordVerifier>) {
        self.verifiers.lock().unwrap().insert(stream_type, verifier);
    }

    /// Default file path for a log id under this manager's root.
    pub fn log_path(&self, log_id: LogId) -> PathBuf {
        self.root.join(format!("log_{}.rlog", log_id.0.simple()))
    }

    pub async fn create_log(
        &self,
        log_id: LogId,
        options: &LogOptions,
    ) -> Result<Arc<Log>, LogError> {
        self.create_log_at(&self.log_path(log_id), log_id, options)
            .await
    }

    /// Create a log at an explicit path (path-addressed form).
    pub async fn create_log_at(
        &self,
        path: &Path,
        log_id: LogId,
        options: &LogOptions,
    ) -> Result<Arc<Log>, LogError> {
        options.validate()?;
        if self.lookup_open(log_id).is_some() {
            return Err(LogError::InvalidParameter("log already open"));
        }
        let device = self
            .backend
            .create(path, options.log_file_size, options.sparse)
            .await?;
        let log = Log::create(device, log_id, options).await?;
        self.open_logs
            .lock()
            .unwrap()
            .insert(log_id, Arc::downgrade(&log));
        Ok(log)
    }

    pub async fn open_log(&self, log_id: LogId) -> Result<Arc<Log>, LogError> {
        if let Some(existing) = self.lookup_open(log_id) {
            return Ok(existing);
        }
        let log = self.open_log_at(&self.log_path(log_id)).await?;
        if log.id() != log_id {
            return Err(LogError::CorruptLog(format!(
                "log file carries id {}, expected {}",
                log.id(),
                log_id
            )));
        }
        Ok(log)
    }

    /// Open a log by explicit path. Runs full recovery; if only one master
    /// block validated, the damaged copy is rewritten from the survivor.
    pub async fn open_log_at(&self, path: &Path) -> Result<Arc<Log>, LogError> {
        let device = self.backend.open(path).await?;
        let masters = read_masters(&device).await?;
        if let Some(existing) = self.lookup_open(masters.master.log_id) {
            return Ok(existing);
        }

        let verifiers = self.verifiers.lock().unwrap().clone();
        let io = RecordIo::new(device.clone(), &masters.master);
        let recovered = recover_log(&io, &masters.master, &verifiers).await?;

        if !masters.copy_a_valid || !masters.copy_b_valid {
            warn!(
                log_id = %masters.master.log_id,
                copy_a = masters.copy_a_valid,
                copy_b = masters.copy_b_valid,
                "repairing damaged master block copy"
            );
            repair_master_copy(&device, &masters.master, masters.copy_a_valid).await?;
        }

        let log = Log::from_recovery(device, recovered, self.stream_checkpoint_record_interval);
        self.open_logs
            .lock()
            .unwrap()
            .insert(log.id(), Arc::downgrade(&log));
        Ok(log)
    }

    /// Delete a log file. Refused while any open handle exists.
    pub async fn delete_log(&self, log_id: LogId) -> Result<(), LogError> {
        if self.lookup_open(log_id).is_some() {
            return Err(LogError::InvalidParameter("log is open"));
        }
        self.backend.delete(&self.log_path(log_id)).await?;
        self.open_logs.lock().unwrap().remove(&log_id);
        info!(log_id = %log_id, "deleted log");
        Ok(())
    }

    /// Delete a log by explicit path.
    pub async fn delete_log_at(&self, path: &Path) -> Result<(), LogError> {
        // Identify the log first so an open handle can refuse the delete.
        if let Ok(device) = self.backend.open(path).await {
            if let Ok(masters) = read_masters(&device).await {
                if self.lookup_open(masters.master.log_id).is_some() {
                    return Err(LogError::InvalidParameter("log is open"));
                }
                self.open_logs
                    .lock()
                    .unwrap()
                    .remove(&masters.master.log_id);
            }
        }
        self.backend.delete(path).await
    }

    /// List the ids of all logs under the manager's root. Files whose
    /// master blocks fail validation are skipped with a warning.
    pub async fn enumerate_logs(&self) -> Result<Vec<LogId>, LogError> {
        let mut ids = Vec::new();
        for path in self.backend.enumerate(&self.root).await? {
            let device = match self.backend.open(&path).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %path.display(), %e, "skipping unreadable log file");
                    continue;
                }
            };
            match read_masters(&device).await {
                Ok(masters) => ids.push(masters.master.log_id),
                Err(e) => warn!(path = %path.display(), %e, "skipping corrupt log file"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn lookup_open(&self, log_id: LogId) -> Option<Arc<Log>> {
        let mut open = self.open_logs.lock().unwrap();
        match open.get(&log_id).and_then(Weak::upgrade) {
            Some(log) => Some(log),
            None => {
                open.remove(&log_id);
                None
            }
        }
    }
}

/// Rewrite the damaged master copy from the surviving one. One copy at a
/// time, so a crash mid-repair still leaves a valid master.
async fn repair_master_copy(
    device: &Arc<dyn BlockDevice>,
    master: &ringlog_common::MasterBlock,
    copy_a_valid: bool,
) -> Result<(), LogError> {
    let encoded = master.encode();
    let offset = if copy_a_valid { BLOCK_SIZE as u64 } else { 0 };
    device.write(offset, &encoded, IoPriority::High).await?;
    device.flush().await?;
    Ok(())
}
