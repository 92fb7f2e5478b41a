use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::crypto::aes::AesKey;
use crate::error::{EcpbError, Result};
use crate::job::{BackupJob, JobStatus};
use crate::store::ChunkStore;

/// Aggregate result of restoring one job.
#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    pub success: bool,
    pub files_restored: i64,
    pub bytes_restored: u64,
    pub error: String,
    pub restored_files: Vec<PathBuf>,
}

/// Reconstructs files from manifests with integrity verification.
pub struct RestoreEngine<'a> {
    catalog: &'a Arc<Catalog>,
    store: &'a ChunkStore,
}

impl<'a> RestoreEngine<'a> {
    pub fn new(catalog: &'a Arc<Catalog>, store: &'a ChunkStore) -> Self {
        Self { catalog, store }
    }

    /// Restore every file of a COMPLETED job under `dest`. Per-file
    /// failures are recorded and the rest of the files still restore;
    /// overall success means at least one file came back.
    pub fn restore_job(&self, job_id: i64, dest: &Path) -> Result<RestoreResult> {
        let mut result = RestoreResult::default();

        let job = match self.catalog.get_job(job_id)? {
            Some(job) => job,
            None => {
                result.error = EcpbError::JobNotFound(job_id).to_string();
                error!(job_id, "restore rejected: job not found");
                return Ok(result);
            }
        };
        if job.status != JobStatus::Completed {
            result.error = format!(
                "Job {job_id} is not completed (status: {})",
                job.status.as_str()
            );
            error!(job_id, status = job.status.as_str(), "restore rejected");
            return Ok(result);
        }

        let key = if job.encrypt {
            match self.catalog.get_encryption_key(job_id)? {
                Some(hex) => AesKey::from_hex(&hex)?,
                None => {
                    result.error = EcpbError::KeyNotFound(job_id).to_string();
                    error!(job_id, "restore rejected: missing encryption key");
                    return Ok(result);
                }
            }
        } else {
            AesKey([0u8; 32])
        };

        let manifests = self.catalog.get_file_manifests(job_id)?;
        if manifests.is_empty() {
            warn!(job_id, "no files recorded for job");
            result.error = format!("No files found in backup job {job_id}");
            result.success = true;
            return Ok(result);
        }

        info!(job_id, files = manifests.len(), dest = %dest.display(), "restoring job");
        std::fs::create_dir_all(dest)?;

        for manifest in &manifests {
            let target = dest.join(&manifest.file_path);
            match self.store.restore_file(manifest, &target, job.encrypt, &key) {
                Ok(()) => {
                    result.files_restored += 1;
                    result.bytes_restored += manifest.file_size;
                    result.restored_files.push(target);
                }
                Err(e) => {
                    error!(job_id, file = %manifest.file_path, error = %e, "file restore failed");
                    result.error = format!("Failed to restore: {}", manifest.file_name);
                }
            }
        }

        result.success = result.files_restored > 0;
        info!(
            job_id,
            files = result.files_restored,
            bytes = result.bytes_restored,
            "restore complete"
        );
        Ok(result)
    }

    /// Check that every chunk referenced by the job's manifests has both a
    /// catalog row and a byte object at its locator. Does not read chunk
    /// contents.
    pub fn verify_backup(&self, job_id: i64) -> Result<bool> {
        let job = match self.catalog.get_job(job_id)? {
            Some(job) => job,
            None => return Ok(false),
        };
        if job.status != JobStatus::Completed {
            return Ok(false);
        }

        for manifest in self.catalog.get_file_manifests(job_id)? {
            for chunk in &manifest.chunks {
                let digest_hex = chunk.digest.to_hex();
                let meta = match self.catalog.get_chunk_meta(&digest_hex)? {
                    Some(meta) => meta,
                    None => {
                        error!(job_id, chunk = %digest_hex, "chunk missing from catalog");
                        return Ok(false);
                    }
                };
                if !Path::new(&meta.storage_path).is_file() {
                    error!(job_id, chunk = %digest_hex, path = %meta.storage_path,
                           "chunk byte object missing");
                    return Ok(false);
                }
            }
        }
        info!(job_id, "backup verified");
        Ok(true)
    }

    /// All jobs that can be restored, i.e. those that reached COMPLETED.
    pub fn list_restorable(&self) -> Result<Vec<BackupJob>> {
        Ok(self
            .catalog
            .get_all_jobs()?
            .into_iter()
            .filter(|job| job.status == JobStatus::Completed)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::Compression;
    use crate::job::BackupJob;
    use crate::testutil::TestEngine;
    use crate::worker::BackupWorker;

    /// Run a complete backup of `files` and return the job id and key.
    fn backed_up_job(
        engine: &mut TestEngine,
        files: &[(&str, &[u8])],
        compression: Compression,
        encrypt: bool,
    ) -> (i64, AesKey) {
        let source = engine.source_dir(files);
        let mut job = BackupJob::new(source.to_string_lossy(), "restore-fixture");
        job.compression = compression;
        job.encrypt = encrypt;
        job.job_id = engine.catalog.create_job(&job).unwrap();
        let key = AesKey::generate();

        let catalog = Arc::clone(&engine.catalog);
        let mut worker = BackupWorker::new(&catalog, &mut engine.store, &engine.snapshots);
        let outcome = worker.execute(&job, &key, None);
        assert!(outcome.success, "fixture backup failed: {}", outcome.error);
        (job.job_id, key)
    }

    #[test]
    fn restore_roundtrips_bytes() {
        let mut engine = TestEngine::new();
        let (job_id, _key) = backed_up_job(
            &mut engine,
            &[
                ("top.txt", b"top level".as_slice()),
                ("deep/nested.txt", b"nested bytes".as_slice()),
            ],
            Compression::Lz4,
            true,
        );

        let dest = engine.dir.path().join("restored");
        let catalog = Arc::clone(&engine.catalog);
        let restore = RestoreEngine::new(&catalog, &engine.store);
        let result = restore.restore_job(job_id, &dest).unwrap();

        assert!(result.success, "restore failed: {}", result.error);
        assert_eq!(result.files_restored, 2);
        assert_eq!(std::fs::read(dest.join("top.txt")).unwrap(), b"top level");
        assert_eq!(
            std::fs::read(dest.join("deep/nested.txt")).unwrap(),
            b"nested bytes"
        );
    }

    #[test]
    fn restore_rejects_unknown_job() {
        let mut engine = TestEngine::new();
        let dest = engine.dir.path().join("nowhere");
        let catalog = Arc::clone(&engine.catalog);
        let restore = RestoreEngine::new(&catalog, &engine.store);
        let result = restore.restore_job(404, &dest).unwrap();
        assert!(!result.success);
        assert!(result.error.contains("not found"));
    }

    #[test]
    fn restore_rejects_incomplete_job() {
        let mut engine = TestEngine::new();
        let job = BackupJob::new("/src", "pending");
        let job_id = engine.catalog.create_job(&job).unwrap();

        let dest = engine.dir.path().join("nowhere");
        let catalog = Arc::clone(&engine.catalog);
        let restore = RestoreEngine::new(&catalog, &engine.store);
        let result = restore.restore_job(job_id, &dest).unwrap();
        assert!(!result.success);
        assert!(result.error.contains("not completed"));
    }

    #[test]
    fn restore_fails_without_stored_key() {
        let mut engine = TestEngine::new();
        let (job_id, _key) = backed_up_job(
            &mut engine,
            &[("f", b"data".as_slice())],
            Compression::None,
            true,
        );
        // Simulate a lost key row.
        engine.catalog.store_encryption_key(job_id, "").unwrap();

        let dest = engine.dir.path().join("out");
        let catalog = Arc::clone(&engine.catalog);
        let restore = RestoreEngine::new(&catalog, &engine.store);
        // An empty key hex fails to parse; treated as a restore error.
        assert!(restore.restore_job(job_id, &dest).is_err());
    }

    #[test]
    fn verify_passes_then_fails_after_chunk_deletion() {
        let mut engine = TestEngine::new();
        let (job_id, _key) = backed_up_job(
            &mut engine,
            &[("v.bin", b"verify me".as_slice())],
            Compression::None,
            false,
        );

        let catalog = Arc::clone(&engine.catalog);
        {
            let restore = RestoreEngine::new(&catalog, &engine.store);
            assert!(restore.verify_backup(job_id).unwrap());
        }

        // Corruption-as-deletion: drop the byte object.
        let manifests = engine.catalog.get_file_manifests(job_id).unwrap();
        let path = engine
            .catalog
            .get_chunk_path(&manifests[0].chunks[0].digest.to_hex())
            .unwrap()
            .unwrap();
        std::fs::remove_file(path).unwrap();

        let restore = RestoreEngine::new(&catalog, &engine.store);
        assert!(!restore.verify_backup(job_id).unwrap());
    }

    #[test]
    fn verify_rejects_non_completed_jobs() {
        let mut engine = TestEngine::new();
        let job = BackupJob::new("/src", "pending");
        let job_id = engine.catalog.create_job(&job).unwrap();

        let catalog = Arc::clone(&engine.catalog);
        let restore = RestoreEngine::new(&catalog, &engine.store);
        assert!(!restore.verify_backup(job_id).unwrap());
        assert!(!restore.verify_backup(999).unwrap());
    }

    #[test]
    fn list_restorable_filters_by_status() {
        let mut engine = TestEngine::new();
        let (done, _) = backed_up_job(
            &mut engine,
            &[("r", b"restorable".as_slice())],
            Compression::None,
            false,
        );
        let pending = engine
            .catalog
            .create_job(&BackupJob::new("/src", "still-pending"))
            .unwrap();

        let catalog = Arc::clone(&engine.catalog);
        let restore = RestoreEngine::new(&catalog, &engine.store);
        let restorable = restore.list_restorable().unwrap();
        assert_eq!(restorable.len(), 1);
        assert_eq!(restorable[0].job_id, done);
        assert_ne!(restorable[0].job_id, pending);
    }
}
