use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::compress::Compression;
use crate::crypto::Digest;
use crate::error::Result;
use crate::job::{BackupJob, JobPriority, JobStatus};
use crate::manifest::{ChunkInfo, FileManifest};
use crate::now_epoch_ms;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_BASE: Duration = Duration::from_millis(50);
const RETRY_CAP: Duration = Duration::from_secs(1);
const MAX_RETRIES: u32 = 10;

/// Catalog row describing a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    pub digest_hex: String,
    pub storage_path: String,
    pub original_size: u32,
    pub stored_size: u32,
    pub compression: Compression,
    pub encrypted: bool,
    pub ref_count: i64,
}

/// Aggregate counters across the whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogStats {
    pub total_jobs: i64,
    pub completed_jobs: i64,
    pub failed_jobs: i64,
    pub total_chunks: i64,
    pub total_stored_bytes: u64,
    pub total_dedup_savings: u64,
    pub total_manifests: i64,
}

/// Durable metadata store for jobs, chunks, manifests, keys, and
/// dependency edges.
///
/// One connection per catalog handle, serialized by a mutex; the underlying
/// SQLite file tolerates concurrent handles from other processes via WAL
/// mode plus bounded busy retries. Every public operation is a single
/// logical transaction: it commits fully or leaves the catalog unchanged.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
        conn.pragma_update(None, "cache_size", -8000)?;

        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.init_schema()?;
        debug!(path = %path.display(), "catalog opened");
        Ok(catalog)
    }

    fn init_schema(&self) -> Result<()> {
        self.retrying(|conn| {
            conn.execute_batch(
                r#"
                BEGIN IMMEDIATE;
                CREATE TABLE IF NOT EXISTS jobs (
                    job_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_path TEXT NOT NULL,
                    backup_name TEXT NOT NULL,
                    status INTEGER NOT NULL DEFAULT 0,
                    priority INTEGER NOT NULL DEFAULT 1,
                    compression INTEGER NOT NULL DEFAULT 1,
                    encrypt INTEGER NOT NULL DEFAULT 1,
                    incremental INTEGER NOT NULL DEFAULT 0,
                    parent_job_id INTEGER NOT NULL DEFAULT -1,
                    created_at INTEGER NOT NULL DEFAULT 0,
                    started_at INTEGER NOT NULL DEFAULT 0,
                    completed_at INTEGER NOT NULL DEFAULT 0,
                    total_bytes INTEGER NOT NULL DEFAULT 0,
                    processed_bytes INTEGER NOT NULL DEFAULT 0,
                    stored_bytes INTEGER NOT NULL DEFAULT 0,
                    dedup_savings INTEGER NOT NULL DEFAULT 0,
                    file_count INTEGER NOT NULL DEFAULT 0,
                    error_message TEXT NOT NULL DEFAULT ''
                );
                CREATE TABLE IF NOT EXISTS chunks (
                    hash TEXT PRIMARY KEY,
                    storage_path TEXT NOT NULL,
                    original_size INTEGER NOT NULL,
                    stored_size INTEGER NOT NULL,
                    compression INTEGER NOT NULL DEFAULT 0,
                    encrypted INTEGER NOT NULL DEFAULT 0,
                    ref_count INTEGER NOT NULL DEFAULT 1
                );
                CREATE TABLE IF NOT EXISTS file_manifests (
                    manifest_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id INTEGER NOT NULL,
                    file_path TEXT NOT NULL,
                    file_name TEXT NOT NULL,
                    file_size INTEGER NOT NULL,
                    modified_time INTEGER NOT NULL,
                    file_hash TEXT NOT NULL,
                    FOREIGN KEY (job_id) REFERENCES jobs(job_id)
                );
                CREATE TABLE IF NOT EXISTS file_chunks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    manifest_id INTEGER NOT NULL,
                    chunk_hash TEXT NOT NULL,
                    chunk_index INTEGER NOT NULL,
                    offset INTEGER NOT NULL,
                    size INTEGER NOT NULL,
                    deduplicated INTEGER NOT NULL DEFAULT 0,
                    FOREIGN KEY (manifest_id) REFERENCES file_manifests(manifest_id)
                );
                CREATE TABLE IF NOT EXISTS encryption_keys (
                    job_id INTEGER PRIMARY KEY,
                    key_hex TEXT NOT NULL,
                    FOREIGN KEY (job_id) REFERENCES jobs(job_id)
                );
                CREATE TABLE IF NOT EXISTS job_dependencies (
                    job_id INTEGER NOT NULL,
                    depends_on INTEGER NOT NULL,
                    PRIMARY KEY (job_id, depends_on),
                    FOREIGN KEY (job_id) REFERENCES jobs(job_id),
                    FOREIGN KEY (depends_on) REFERENCES jobs(job_id)
                );
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_file_manifests_job ON file_manifests(job_id);
                CREATE INDEX IF NOT EXISTS idx_file_chunks_manifest ON file_chunks(manifest_id);
                COMMIT;
                "#,
            )
        })?;
        info!("catalog schema initialized");
        Ok(())
    }

    /// Run an operation under the catalog lock, retrying on transient
    /// SQLITE_BUSY/SQLITE_LOCKED with exponential backoff.
    fn retrying<T>(&self, mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self.conn.lock().expect("catalog mutex poisoned");
        let mut delay = RETRY_BASE;
        let mut attempt = 1;
        loop {
            match op(&mut conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_busy(&e) && attempt < MAX_RETRIES => {
                    warn!(attempt, "catalog busy, backing off");
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(RETRY_CAP);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ── Jobs ────────────────────────────────────────────────────────────

    /// Persist a new job, assigning its id and `created_at`.
    pub fn create_job(&self, job: &BackupJob) -> Result<i64> {
        self.retrying(|conn| {
            conn.execute(
                "INSERT INTO jobs (source_path, backup_name, status, priority, compression, \
                 encrypt, incremental, parent_job_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.source_path,
                    job.backup_name,
                    JobStatus::Pending.as_tag(),
                    job.priority.as_tag(),
                    job.compression.as_tag(),
                    job.encrypt,
                    job.incremental,
                    job.parent_job_id,
                    now_epoch_ms() as i64,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Update a job's status, setting `started_at` on RUNNING and
    /// `completed_at` on COMPLETED/FAILED.
    pub fn update_job_status(
        &self,
        job_id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let error = error.unwrap_or("");
        self.retrying(|conn| {
            match status {
                JobStatus::Running => conn.execute(
                    "UPDATE jobs SET status=?1, started_at=?2 WHERE job_id=?3",
                    params![status.as_tag(), now_epoch_ms() as i64, job_id],
                ),
                JobStatus::Completed | JobStatus::Failed => conn.execute(
                    "UPDATE jobs SET status=?1, completed_at=?2, error_message=?3 WHERE job_id=?4",
                    params![status.as_tag(), now_epoch_ms() as i64, error, job_id],
                ),
                JobStatus::Cancelled => conn.execute(
                    "UPDATE jobs SET status=?1, error_message=?2 WHERE job_id=?3",
                    params![status.as_tag(), error, job_id],
                ),
                JobStatus::Pending => conn.execute(
                    "UPDATE jobs SET status=?1 WHERE job_id=?2",
                    params![status.as_tag(), job_id],
                ),
            }?;
            Ok(())
        })
    }

    pub fn update_job_stats(
        &self,
        job_id: i64,
        total_bytes: u64,
        processed_bytes: u64,
        stored_bytes: u64,
        dedup_savings: u64,
        file_count: i64,
    ) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "UPDATE jobs SET total_bytes=?1, processed_bytes=?2, stored_bytes=?3, \
                 dedup_savings=?4, file_count=?5 WHERE job_id=?6",
                params![
                    total_bytes as i64,
                    processed_bytes as i64,
                    stored_bytes as i64,
                    dedup_savings as i64,
                    file_count,
                    job_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_job(&self, job_id: i64) -> Result<Option<BackupJob>> {
        self.retrying(|conn| {
            conn.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id=?1"),
                params![job_id],
                row_to_job,
            )
            .optional()
        })
    }

    /// All jobs, newest first.
    pub fn get_all_jobs(&self) -> Result<Vec<BackupJob>> {
        self.retrying(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at DESC"))?;
            let jobs: rusqlite::Result<Vec<BackupJob>> =
                stmt.query_map([], row_to_job)?.collect();
            jobs
        })
    }

    /// Jobs in a given status, priority-descending then oldest-first.
    pub fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<BackupJob>> {
        self.retrying(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE status=?1 \
                 ORDER BY priority DESC, created_at ASC"
            ))?;
            let jobs: rusqlite::Result<Vec<BackupJob>> =
                stmt.query_map(params![status.as_tag()], row_to_job)?.collect();
            jobs
        })
    }

    // ── Chunks ──────────────────────────────────────────────────────────

    /// Register a chunk: insert with `ref_count = 1` if unseen, otherwise
    /// increment the existing row's ref count. One immediate transaction,
    /// so the insert-or-increment is atomic against concurrent writers.
    pub fn store_chunk(
        &self,
        digest_hex: &str,
        storage_path: &str,
        original_size: u32,
        stored_size: u32,
        compression: Compression,
        encrypted: bool,
    ) -> Result<()> {
        self.retrying(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO chunks \
                 (hash, storage_path, original_size, stored_size, compression, encrypted, ref_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
                params![
                    digest_hex,
                    storage_path,
                    original_size,
                    stored_size,
                    compression.as_tag(),
                    encrypted,
                ],
            )?;
            if inserted == 0 {
                tx.execute(
                    "UPDATE chunks SET ref_count = ref_count + 1 WHERE hash=?1",
                    params![digest_hex],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn chunk_exists(&self, digest_hex: &str) -> Result<bool> {
        self.retrying(|conn| {
            conn.query_row(
                "SELECT 1 FROM chunks WHERE hash=?1",
                params![digest_hex],
                |_| Ok(()),
            )
            .optional()
            .map(|row| row.is_some())
        })
    }

    pub fn get_chunk_path(&self, digest_hex: &str) -> Result<Option<String>> {
        self.retrying(|conn| {
            conn.query_row(
                "SELECT storage_path FROM chunks WHERE hash=?1",
                params![digest_hex],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn get_chunk_meta(&self, digest_hex: &str) -> Result<Option<ChunkMeta>> {
        let meta = self.retrying(|conn| {
            conn.query_row(
                "SELECT hash, storage_path, original_size, stored_size, compression, \
                 encrypted, ref_count FROM chunks WHERE hash=?1",
                params![digest_hex],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, bool>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
        })?;
        meta.map(
            |(digest_hex, storage_path, original_size, stored_size, comp, encrypted, ref_count)| {
                Ok(ChunkMeta {
                    digest_hex,
                    storage_path,
                    original_size,
                    stored_size,
                    compression: Compression::from_tag(comp)?,
                    encrypted,
                    ref_count,
                })
            },
        )
        .transpose()
    }

    // ── Manifests ───────────────────────────────────────────────────────

    /// Write a manifest row and all of its chunk entries as one transaction.
    pub fn store_file_manifest(&self, job_id: i64, manifest: &FileManifest) -> Result<()> {
        self.retrying(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT INTO file_manifests \
                 (job_id, file_path, file_name, file_size, modified_time, file_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    job_id,
                    manifest.file_path,
                    manifest.file_name,
                    manifest.file_size as i64,
                    manifest.modified_time as i64,
                    manifest.file_hash.to_hex(),
                ],
            )?;
            let manifest_id = tx.last_insert_rowid();

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO file_chunks \
                     (manifest_id, chunk_hash, chunk_index, offset, size, deduplicated) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for chunk in &manifest.chunks {
                    stmt.execute(params![
                        manifest_id,
                        chunk.digest.to_hex(),
                        chunk.chunk_index,
                        chunk.offset as i64,
                        chunk.size,
                        chunk.deduplicated,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Manifests for a job, each with chunk entries ordered by index.
    pub fn get_file_manifests(&self, job_id: i64) -> Result<Vec<FileManifest>> {
        type ManifestRow = (i64, String, String, u64, u64, String);
        type ChunkRow = (String, u32, u64, u32, bool);

        let rows: Vec<(ManifestRow, Vec<ChunkRow>)> = self.retrying(|conn| {
            let mut stmt = conn.prepare(
                "SELECT manifest_id, file_path, file_name, file_size, modified_time, file_hash \
                 FROM file_manifests WHERE job_id=?1 ORDER BY manifest_id",
            )?;
            let manifest_rows = stmt
                .query_map(params![job_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)? as u64,
                        row.get::<_, i64>(4)? as u64,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<ManifestRow>>>()?;

            let mut chunk_stmt = conn.prepare(
                "SELECT chunk_hash, chunk_index, offset, size, deduplicated \
                 FROM file_chunks WHERE manifest_id=?1 ORDER BY chunk_index",
            )?;
            let mut rows = Vec::with_capacity(manifest_rows.len());
            for manifest_row in manifest_rows {
                let chunk_rows = chunk_stmt
                    .query_map(params![manifest_row.0], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, u32>(1)?,
                            row.get::<_, i64>(2)? as u64,
                            row.get::<_, u32>(3)?,
                            row.get::<_, bool>(4)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<ChunkRow>>>()?;
                rows.push((manifest_row, chunk_rows));
            }
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|((_, file_path, file_name, file_size, modified_time, file_hash), chunk_rows)| {
                let chunks = chunk_rows
                    .into_iter()
                    .map(|(hash, chunk_index, offset, size, deduplicated)| {
                        Ok(ChunkInfo {
                            digest: Digest::from_hex(&hash)?,
                            offset,
                            size,
                            chunk_index,
                            deduplicated,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(FileManifest {
                    file_path,
                    file_name,
                    file_size,
                    modified_time,
                    file_hash: Digest::from_hex(&file_hash)?,
                    chunks,
                })
            })
            .collect()
    }

    // ── Encryption keys ─────────────────────────────────────────────────

    pub fn store_encryption_key(&self, job_id: i64, key_hex: &str) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO encryption_keys (job_id, key_hex) VALUES (?1, ?2)",
                params![job_id, key_hex],
            )?;
            Ok(())
        })
    }

    pub fn get_encryption_key(&self, job_id: i64) -> Result<Option<String>> {
        self.retrying(|conn| {
            conn.query_row(
                "SELECT key_hex FROM encryption_keys WHERE job_id=?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
        })
    }

    // ── Dependencies ────────────────────────────────────────────────────

    /// Record a dependency edge. Duplicate edges are a no-op.
    pub fn add_dependency(&self, job_id: i64, depends_on: i64) -> Result<()> {
        self.retrying(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO job_dependencies (job_id, depends_on) VALUES (?1, ?2)",
                params![job_id, depends_on],
            )?;
            Ok(())
        })
    }

    pub fn get_dependencies(&self, job_id: i64) -> Result<Vec<i64>> {
        self.retrying(|conn| {
            let mut stmt = conn.prepare(
                "SELECT depends_on FROM job_dependencies WHERE job_id=?1 ORDER BY depends_on",
            )?;
            let deps: rusqlite::Result<Vec<i64>> =
                stmt.query_map(params![job_id], |row| row.get(0))?.collect();
            deps
        })
    }

    // ── Statistics ──────────────────────────────────────────────────────

    pub fn get_stats(&self) -> Result<CatalogStats> {
        self.retrying(|conn| {
            let total_jobs =
                conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
            let completed_jobs = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status=?1",
                params![JobStatus::Completed.as_tag()],
                |row| row.get(0),
            )?;
            let failed_jobs = conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status=?1",
                params![JobStatus::Failed.as_tag()],
                |row| row.get(0),
            )?;
            let (total_chunks, total_stored_bytes) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(stored_size), 0) FROM chunks",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64)),
            )?;
            let total_dedup_savings = conn.query_row(
                "SELECT COALESCE(SUM(dedup_savings), 0) FROM jobs",
                [],
                |row| row.get::<_, i64>(0).map(|v| v as u64),
            )?;
            let total_manifests =
                conn.query_row("SELECT COUNT(*) FROM file_manifests", [], |row| row.get(0))?;

            Ok(CatalogStats {
                total_jobs,
                completed_jobs,
                failed_jobs,
                total_chunks,
                total_stored_bytes,
                total_dedup_savings,
                total_manifests,
            })
        })
    }
}

const JOB_COLUMNS: &str = "job_id, source_path, backup_name, status, priority, compression, \
                           encrypt, incremental, parent_job_id, created_at, started_at, \
                           completed_at, total_bytes, processed_bytes, stored_bytes, \
                           dedup_savings, file_count, error_message";

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<BackupJob> {
    Ok(BackupJob {
        job_id: row.get(0)?,
        source_path: row.get(1)?,
        backup_name: row.get(2)?,
        status: JobStatus::from_tag(row.get(3)?).map_err(|_| {
            rusqlite::Error::IntegralValueOutOfRange(3, row.get::<_, i64>(3).unwrap_or(-1))
        })?,
        priority: JobPriority::from_tag(row.get(4)?).map_err(|_| {
            rusqlite::Error::IntegralValueOutOfRange(4, row.get::<_, i64>(4).unwrap_or(-1))
        })?,
        compression: Compression::from_tag(row.get(5)?).map_err(|_| {
            rusqlite::Error::IntegralValueOutOfRange(5, row.get::<_, i64>(5).unwrap_or(-1))
        })?,
        encrypt: row.get(6)?,
        incremental: row.get(7)?,
        parent_job_id: row.get(8)?,
        created_at: row.get::<_, i64>(9)? as u64,
        started_at: row.get::<_, i64>(10)? as u64,
        completed_at: row.get::<_, i64>(11)? as u64,
        total_bytes: row.get::<_, i64>(12)? as u64,
        processed_bytes: row.get::<_, i64>(13)? as u64,
        stored_bytes: row.get::<_, i64>(14)? as u64,
        dedup_savings: row.get::<_, i64>(15)? as u64,
        file_count: row.get(16)?,
        error_message: row.get(17)?,
        dependencies: Vec::new(),
    })
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_catalog;

    fn submit(catalog: &Catalog, name: &str, priority: JobPriority) -> i64 {
        let mut job = BackupJob::new("/src", name);
        job.priority = priority;
        catalog.create_job(&job).unwrap()
    }

    #[test]
    fn create_job_assigns_id_and_pending_status() {
        let (_dir, catalog) = temp_catalog();
        let id = submit(&catalog, "first", JobPriority::Normal);
        assert!(id > 0);

        let job = catalog.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.created_at > 0);
        assert_eq!(job.started_at, 0);
        assert_eq!(job.backup_name, "first");
    }

    #[test]
    fn get_job_missing_returns_none() {
        let (_dir, catalog) = temp_catalog();
        assert!(catalog.get_job(9999).unwrap().is_none());
    }

    #[test]
    fn status_transitions_set_timestamps() {
        let (_dir, catalog) = temp_catalog();
        let id = submit(&catalog, "job", JobPriority::Normal);

        catalog
            .update_job_status(id, JobStatus::Running, None)
            .unwrap();
        let job = catalog.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at > 0);
        assert_eq!(job.completed_at, 0);

        catalog
            .update_job_status(id, JobStatus::Failed, Some("disk on fire"))
            .unwrap();
        let job = catalog.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at > 0);
        assert_eq!(job.error_message, "disk on fire");
    }

    #[test]
    fn jobs_by_status_ordered_by_priority_then_age() {
        let (_dir, catalog) = temp_catalog();
        let low = submit(&catalog, "low", JobPriority::Low);
        let high = submit(&catalog, "high", JobPriority::High);
        let normal = submit(&catalog, "normal", JobPriority::Normal);

        let pending = catalog.get_jobs_by_status(JobStatus::Pending).unwrap();
        let ids: Vec<i64> = pending.iter().map(|j| j.job_id).collect();
        assert_eq!(ids, vec![high, normal, low]);
    }

    #[test]
    fn all_jobs_newest_first() {
        let (_dir, catalog) = temp_catalog();
        let a = submit(&catalog, "a", JobPriority::Normal);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = submit(&catalog, "b", JobPriority::Normal);

        let all = catalog.get_all_jobs().unwrap();
        assert_eq!(all[0].job_id, b);
        assert_eq!(all[1].job_id, a);
    }

    #[test]
    fn store_chunk_inserts_then_increments() {
        let (_dir, catalog) = temp_catalog();
        let hash = "ab".repeat(32);

        assert!(!catalog.chunk_exists(&hash).unwrap());
        catalog
            .store_chunk(&hash, "/store/ab", 100, 60, Compression::Lz4, true)
            .unwrap();
        assert!(catalog.chunk_exists(&hash).unwrap());

        catalog
            .store_chunk(&hash, "/store/ab", 100, 60, Compression::Lz4, true)
            .unwrap();
        let meta = catalog.get_chunk_meta(&hash).unwrap().unwrap();
        assert_eq!(meta.ref_count, 2);
        assert_eq!(meta.original_size, 100);
        assert_eq!(meta.stored_size, 60);
        assert_eq!(meta.compression, Compression::Lz4);
        assert!(meta.encrypted);
        assert_eq!(
            catalog.get_chunk_path(&hash).unwrap().as_deref(),
            Some("/store/ab")
        );
    }

    #[test]
    fn manifest_roundtrip_preserves_chunk_order() {
        let (_dir, catalog) = temp_catalog();
        let job_id = submit(&catalog, "m", JobPriority::Normal);

        let chunks: Vec<ChunkInfo> = (0..3u32)
            .map(|i| ChunkInfo {
                digest: Digest::hash(&[i as u8]),
                offset: i as u64 * 64,
                size: 64,
                chunk_index: i,
                deduplicated: i == 1,
            })
            .collect();
        let manifest = FileManifest {
            file_path: "dir/data.bin".into(),
            file_name: "data.bin".into(),
            file_size: 192,
            modified_time: 1_700_000_000_000,
            file_hash: Digest::hash(b"whole"),
            chunks,
        };
        catalog.store_file_manifest(job_id, &manifest).unwrap();

        let loaded = catalog.get_file_manifests(job_id).unwrap();
        assert_eq!(loaded.len(), 1);
        let m = &loaded[0];
        assert_eq!(m.file_path, "dir/data.bin");
        assert_eq!(m.file_size, 192);
        assert_eq!(m.file_hash, manifest.file_hash);
        assert_eq!(m.chunks.len(), 3);
        for (i, chunk) in m.chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i as u32);
            assert_eq!(chunk.offset, i as u64 * 64);
        }
        assert!(m.chunks[1].deduplicated);
    }

    #[test]
    fn encryption_key_roundtrip() {
        let (_dir, catalog) = temp_catalog();
        let job_id = submit(&catalog, "enc", JobPriority::Normal);

        assert!(catalog.get_encryption_key(job_id).unwrap().is_none());
        catalog.store_encryption_key(job_id, "aa55").unwrap();
        assert_eq!(
            catalog.get_encryption_key(job_id).unwrap().as_deref(),
            Some("aa55")
        );
    }

    #[test]
    fn add_dependency_is_idempotent() {
        let (_dir, catalog) = temp_catalog();
        let a = submit(&catalog, "a", JobPriority::Normal);
        let b = submit(&catalog, "b", JobPriority::Normal);

        catalog.add_dependency(b, a).unwrap();
        catalog.add_dependency(b, a).unwrap();
        assert_eq!(catalog.get_dependencies(b).unwrap(), vec![a]);
        assert!(catalog.get_dependencies(a).unwrap().is_empty());
    }

    #[test]
    fn stats_aggregate_counts() {
        let (_dir, catalog) = temp_catalog();
        let a = submit(&catalog, "a", JobPriority::Normal);
        let _b = submit(&catalog, "b", JobPriority::Normal);
        catalog
            .update_job_status(a, JobStatus::Completed, None)
            .unwrap();
        catalog
            .store_chunk(&"cd".repeat(32), "/p", 100, 40, Compression::Zstd, false)
            .unwrap();
        catalog.update_job_stats(a, 100, 100, 40, 60, 1).unwrap();

        let stats = catalog.get_stats().unwrap();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.failed_jobs, 0);
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_stored_bytes, 40);
        assert_eq!(stats.total_dedup_savings, 60);
    }
}
