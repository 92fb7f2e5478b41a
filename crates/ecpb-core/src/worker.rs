use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::crypto::aes::AesKey;
use crate::error::{EcpbError, Result};
use crate::ipc::{MessageKind, ProgressMessage, ProgressSink};
use crate::job::{BackupJob, JobStatus};
use crate::snapshot::{SnapshotInfo, SnapshotManager};
use crate::store::ChunkStore;

/// Outcome of one backup job run.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub job_id: i64,
    pub success: bool,
    pub total_bytes: u64,
    pub stored_bytes: u64,
    pub dedup_savings: u64,
    pub file_count: i64,
    pub error: String,
}

impl WorkerOutcome {
    fn failed(job_id: i64, error: impl Into<String>) -> Self {
        Self {
            job_id,
            success: false,
            total_bytes: 0,
            stored_bytes: 0,
            dedup_savings: 0,
            file_count: 0,
            error: error.into(),
        }
    }
}

/// Runs one backup job end-to-end against a snapshot of its source tree.
pub struct BackupWorker<'a> {
    catalog: &'a Arc<Catalog>,
    store: &'a mut ChunkStore,
    snapshots: &'a SnapshotManager,
}

/// Removes the snapshot on every exit path, including error returns.
struct SnapshotGuard<'a> {
    manager: &'a SnapshotManager,
    info: SnapshotInfo,
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.manager.remove_snapshot(&self.info);
    }
}

impl<'a> BackupWorker<'a> {
    pub fn new(
        catalog: &'a Arc<Catalog>,
        store: &'a mut ChunkStore,
        snapshots: &'a SnapshotManager,
    ) -> Self {
        Self {
            catalog,
            store,
            snapshots,
        }
    }

    pub fn execute(
        &mut self,
        job: &BackupJob,
        key: &AesKey,
        progress: Option<&dyn ProgressSink>,
    ) -> WorkerOutcome {
        let job_id = job.job_id;
        info!(job_id, source = %job.source_path, "starting backup job");

        match self.run_job(job, key, progress) {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                error!(job_id, error = %message, "backup job failed");
                if let Err(db_err) =
                    self.catalog
                        .update_job_status(job_id, JobStatus::Failed, Some(&message))
                {
                    error!(job_id, error = %db_err, "could not record job failure");
                }
                emit(progress, ProgressMessage::new(MessageKind::JobFailed, job_id, 0, 0)
                    .with_payload(&message));
                WorkerOutcome::failed(job_id, message)
            }
        }
    }

    fn run_job(
        &mut self,
        job: &BackupJob,
        key: &AesKey,
        progress: Option<&dyn ProgressSink>,
    ) -> Result<WorkerOutcome> {
        let job_id = job.job_id;

        self.catalog
            .update_job_status(job_id, JobStatus::Running, None)?;
        emit(progress, ProgressMessage::new(MessageKind::JobStart, job_id, 0, 0));

        let snapshot = self
            .snapshots
            .create_snapshot(job_id, Path::new(&job.source_path));
        if !snapshot.is_consistent {
            // Remove whatever partial tree was produced; the caller
            // records the failure and emits JOB_FAILED.
            self.snapshots.remove_snapshot(&snapshot);
            return Err(EcpbError::SnapshotFailed);
        }
        let guard = SnapshotGuard {
            manager: self.snapshots,
            info: snapshot,
        };

        let files = self.snapshots.list_files(&guard.info);
        if files.is_empty() {
            warn!(job_id, source = %job.source_path, "no files found in snapshot");
        }

        let mut outcome = WorkerOutcome {
            job_id,
            success: false,
            total_bytes: 0,
            stored_bytes: 0,
            dedup_savings: 0,
            file_count: files.len() as i64,
            error: String::new(),
        };

        for file in &files {
            if let Ok(metadata) = std::fs::metadata(file) {
                outcome.total_bytes += metadata.len();
            }
        }

        let mut processed_bytes: u64 = 0;
        for file in &files {
            let relative = relative_key(file, &guard.info.snapshot_path);

            let manifest = match self.store.store_file(
                file,
                job.compression,
                job.encrypt,
                key,
                job_id,
                &relative,
            ) {
                Ok(manifest) => manifest,
                Err(e) if e.is_fatal_for_job() => return Err(e),
                Err(e) => {
                    warn!(job_id, file = %relative, error = %e, "skipping file");
                    continue;
                }
            };

            outcome.dedup_savings += manifest.dedup_bytes();
            for chunk in manifest.chunks.iter().filter(|c| !c.deduplicated) {
                if let Some(meta) = self.catalog.get_chunk_meta(&chunk.digest.to_hex())? {
                    outcome.stored_bytes += meta.stored_size as u64;
                }
            }
            processed_bytes += manifest.file_size;

            emit(
                progress,
                ProgressMessage::new(
                    MessageKind::JobProgress,
                    job_id,
                    processed_bytes,
                    outcome.total_bytes,
                ),
            );
        }

        if job.encrypt {
            self.catalog.store_encryption_key(job_id, &key.to_hex())?;
        }

        self.catalog.update_job_stats(
            job_id,
            outcome.total_bytes,
            processed_bytes,
            outcome.stored_bytes,
            outcome.dedup_savings,
            outcome.file_count,
        )?;
        self.catalog
            .update_job_status(job_id, JobStatus::Completed, None)?;

        outcome.success = true;
        emit(
            progress,
            ProgressMessage::new(
                MessageKind::JobComplete,
                job_id,
                processed_bytes,
                outcome.total_bytes,
            ),
        );

        info!(
            job_id,
            files = outcome.file_count,
            stored_bytes = outcome.stored_bytes,
            dedup_savings = outcome.dedup_savings,
            "backup job completed"
        );
        Ok(outcome)
    }
}

fn emit(progress: Option<&dyn ProgressSink>, message: ProgressMessage) {
    if let Some(sink) = progress {
        sink.send(message);
    }
}

/// Relative path below the snapshot root, forward-slash separated.
fn relative_key(file: &Path, root: &Path) -> String {
    let rel = file.strip_prefix(root).unwrap_or(file);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    use crate::compress::Compression;
    use crate::ipc::ChannelSink;
    use crate::testutil::TestEngine;
    use crate::CHUNK_SIZE;

    fn run_job(engine: &mut TestEngine, job: &BackupJob, key: &AesKey) -> WorkerOutcome {
        let catalog = Arc::clone(&engine.catalog);
        let mut worker = BackupWorker::new(&catalog, &mut engine.store, &engine.snapshots);
        worker.execute(job, key, None)
    }

    fn submitted_job(engine: &TestEngine, source: &Path, compression: Compression) -> BackupJob {
        let mut job = BackupJob::new(source.to_string_lossy(), "test-backup");
        job.compression = compression;
        job.encrypt = false;
        job.job_id = engine.catalog.create_job(&job).unwrap();
        job
    }

    #[test]
    fn successful_job_updates_catalog() {
        let mut engine = TestEngine::new();
        let source = engine.source_dir(&[
            ("a.txt", b"alpha contents".as_slice()),
            ("sub/b.txt", b"beta contents".as_slice()),
        ]);
        let job = submitted_job(&engine, &source, Compression::Lz4);
        let key = AesKey::generate();

        let outcome = run_job(&mut engine, &job, &key);
        assert!(outcome.success, "worker failed: {}", outcome.error);
        assert_eq!(outcome.file_count, 2);
        assert_eq!(outcome.total_bytes, 14 + 13);

        let stored = engine.catalog.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.started_at > 0);
        assert!(stored.completed_at > 0);
        assert_eq!(stored.file_count, 2);
        assert_eq!(stored.processed_bytes, 27);

        // Manifests carry snapshot-root-relative forward-slash paths.
        let manifests = engine.catalog.get_file_manifests(job.job_id).unwrap();
        let mut paths: Vec<&str> = manifests.iter().map(|m| m.file_path.as_str()).collect();
        paths.sort_unstable();
        assert_eq!(paths, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn missing_source_fails_with_snapshot_message() {
        let mut engine = TestEngine::new();
        let mut job = BackupJob::new("/definitely/not/there", "ghost");
        job.encrypt = false;
        job.job_id = engine.catalog.create_job(&job).unwrap();
        let key = AesKey::generate();

        let outcome = run_job(&mut engine, &job, &key);
        assert!(!outcome.success);
        assert_eq!(outcome.error, "Failed to create snapshot");

        let stored = engine.catalog.get_job(job.job_id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message, "Failed to create snapshot");
    }

    #[test]
    fn encrypted_job_persists_key() {
        let mut engine = TestEngine::new();
        let source = engine.source_dir(&[("secret.txt", b"classified".as_slice())]);
        let mut job = BackupJob::new(source.to_string_lossy(), "enc");
        job.compression = Compression::None;
        job.encrypt = true;
        job.job_id = engine.catalog.create_job(&job).unwrap();
        let key = AesKey::generate();

        let outcome = run_job(&mut engine, &job, &key);
        assert!(outcome.success);
        assert_eq!(
            engine.catalog.get_encryption_key(job.job_id).unwrap(),
            Some(key.to_hex())
        );
    }

    #[test]
    fn second_run_of_same_source_is_all_dedup() {
        let mut engine = TestEngine::new();
        let chunk_of_a = vec![b'A'; CHUNK_SIZE];
        let source = engine.source_dir(&[("x", chunk_of_a.as_slice())]);
        let key = AesKey::generate();

        let first = submitted_job(&engine, &source, Compression::None);
        let outcome1 = run_job(&mut engine, &first, &key);
        assert!(outcome1.success);
        assert_eq!(outcome1.stored_bytes, CHUNK_SIZE as u64);
        assert_eq!(outcome1.dedup_savings, 0);

        let second = submitted_job(&engine, &source, Compression::None);
        let outcome2 = run_job(&mut engine, &second, &key);
        assert!(outcome2.success);
        assert_eq!(outcome2.stored_bytes, 0);
        assert_eq!(outcome2.dedup_savings, CHUNK_SIZE as u64);
    }

    #[test]
    fn snapshot_is_removed_after_run() {
        let mut engine = TestEngine::new();
        let source = engine.source_dir(&[("f", b"payload".as_slice())]);
        let job = submitted_job(&engine, &source, Compression::None);
        let key = AesKey::generate();

        let outcome = run_job(&mut engine, &job, &key);
        assert!(outcome.success);

        let leftovers: Vec<_> = std::fs::read_dir(engine.dir.path().join("snapshots"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn progress_messages_bracket_the_run() {
        let mut engine = TestEngine::new();
        let source = engine.source_dir(&[("p.txt", b"progress".as_slice())]);
        let job = submitted_job(&engine, &source, Compression::None);
        let key = AesKey::generate();

        let (tx, rx) = mpsc::channel();
        let sink = ChannelSink::new(tx);
        let catalog = Arc::clone(&engine.catalog);
        let mut worker = BackupWorker::new(&catalog, &mut engine.store, &engine.snapshots);
        let outcome = worker.execute(&job, &key, Some(&sink));
        assert!(outcome.success);

        let kinds: Vec<MessageKind> = rx.try_iter().map(|m| m.kind).collect();
        assert_eq!(kinds.first(), Some(&MessageKind::JobStart));
        assert_eq!(kinds.last(), Some(&MessageKind::JobComplete));
        assert!(kinds.contains(&MessageKind::JobProgress));
    }
}
