use std::collections::HashMap;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::compress::Compression;
use crate::config::EngineConfig;
use crate::crypto::aes::AesKey;
use crate::error::Result;
use crate::ipc::{MessageKind, ProgressMessage};
use crate::job::{BackupJob, JobPriority, JobStatus};
use crate::scheduler::JobScheduler;
use crate::snapshot::SnapshotManager;
use crate::store::ChunkStore;
use crate::worker::BackupWorker;

/// Poll interval for the scheduling loops.
const IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// Environment variable carrying the AES key into worker children.
pub const WORKER_KEY_ENV: &str = "ECPB_WORKER_KEY";

struct ActiveWorker {
    job_id: i64,
    child: Child,
}

/// Drives the scheduler: pulls ready jobs, executes them inline or in
/// worker child processes, and feeds completion results back.
pub struct Orchestrator {
    catalog: Arc<Catalog>,
    scheduler: JobScheduler,
    store: ChunkStore,
    snapshots: SnapshotManager,
    data_dir: PathBuf,
    max_workers: usize,
    /// Executable spawned for worker children; defaults to the current
    /// binary, which re-enters via the hidden worker flag.
    worker_exe: Option<PathBuf>,
    key: AesKey,
}

impl Orchestrator {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        config.ensure_layout()?;
        let catalog = Arc::new(Catalog::open(&config.catalog_path())?);
        let scheduler = JobScheduler::new(Arc::clone(&catalog));
        let store = ChunkStore::new(Arc::clone(&catalog), config.storage_dir())?;
        let snapshots = SnapshotManager::new(config.snapshot_dir())?;

        info!(data_dir = %config.data_dir.display(), "orchestrator initialized");
        Ok(Self {
            catalog,
            scheduler,
            store,
            snapshots,
            data_dir: config.data_dir.clone(),
            max_workers: config.max_workers.max(1),
            worker_exe: None,
            key: AesKey::generate(),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn key(&self) -> &AesKey {
        &self.key
    }

    pub fn set_key(&mut self, key: AesKey) {
        self.key = key;
    }

    /// Override the executable used for worker children (test hook).
    pub fn set_worker_exe(&mut self, exe: PathBuf) {
        self.worker_exe = Some(exe);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn submit_job(
        &self,
        source_path: &str,
        name: &str,
        priority: JobPriority,
        compression: Compression,
        encrypt: bool,
        incremental: bool,
    ) -> Result<i64> {
        let mut job = BackupJob::new(source_path, name);
        job.priority = priority;
        job.compression = compression;
        job.encrypt = encrypt;
        job.incremental = incremental;
        self.scheduler.submit_job(&mut job)
    }

    /// Declare `job_id` depends on `depends_on`; a cycle is rejected
    /// with a scheduling error.
    pub fn add_dependency(&self, job_id: i64, depends_on: i64) -> Result<()> {
        self.scheduler.add_dependency(job_id, depends_on)
    }

    /// Run jobs inline on this thread until nothing is pending.
    pub fn run_single_threaded(&mut self) -> Result<()> {
        info!("orchestrator started (single-threaded mode)");
        loop {
            let ready = self.scheduler.get_ready_jobs()?;
            if ready.is_empty() {
                if self.catalog.get_jobs_by_status(JobStatus::Pending)?.is_empty() {
                    break;
                }
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            }

            for job in ready {
                let key = self.key;
                let mut worker =
                    BackupWorker::new(&self.catalog, &mut self.store, &self.snapshots);
                let outcome = worker.execute(&job, &key, None);
                if outcome.success {
                    self.scheduler.mark_completed(job.job_id);
                } else {
                    error!(job_id = job.job_id, error = %outcome.error, "job failed");
                    self.scheduler.mark_failed(job.job_id)?;
                }
            }
        }
        info!("orchestrator stopped");
        Ok(())
    }

    /// Run jobs in a bounded pool of worker child processes, reaping them
    /// and forwarding their progress messages.
    pub fn run_multi_process(&mut self) -> Result<()> {
        info!(max_workers = self.max_workers, "orchestrator started (multi-process mode)");
        let (tx, rx) = std::sync::mpsc::channel();
        let mut active: HashMap<u32, ActiveWorker> = HashMap::new();

        loop {
            self.reap_children(&mut active)?;
            drain_progress(&rx);

            let ready = self.scheduler.get_ready_jobs()?;
            if ready.is_empty() {
                if active.is_empty()
                    && self.catalog.get_jobs_by_status(JobStatus::Pending)?.is_empty()
                {
                    break;
                }
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            }

            let mut released = false;
            for job in ready {
                if active.len() >= self.max_workers {
                    // Hand the job back so a later iteration can run it.
                    self.scheduler.release(job.job_id);
                    released = true;
                    continue;
                }
                if let Err(e) = self.spawn_worker(&job, &tx, &mut active) {
                    error!(job_id = job.job_id, error = %e, "failed to spawn worker");
                    self.scheduler.mark_failed(job.job_id)?;
                }
            }
            if released {
                // Released jobs come straight back from get_ready_jobs;
                // wait for a worker slot instead of spinning on them.
                std::thread::sleep(IDLE_BACKOFF);
            }
        }

        // Drain the pool.
        while !active.is_empty() {
            self.reap_children(&mut active)?;
            drain_progress(&rx);
            std::thread::sleep(IDLE_BACKOFF);
        }

        info!("orchestrator stopped");
        Ok(())
    }

    /// Spawn one worker child for a job. The child re-opens its own
    /// catalog handle from the data directory; the AES key crosses via
    /// the environment and is persisted by the child on completion.
    fn spawn_worker(
        &self,
        job: &BackupJob,
        tx: &Sender<ProgressMessage>,
        active: &mut HashMap<u32, ActiveWorker>,
    ) -> Result<()> {
        let exe = match &self.worker_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe()?,
        };

        let mut child = Command::new(exe)
            .arg("--data-dir")
            .arg(&self.data_dir)
            .arg("--worker-job")
            .arg(job.job_id.to_string())
            .env(WORKER_KEY_ENV, self.key.to_hex())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || {
                for line in std::io::BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    match serde_json::from_str::<ProgressMessage>(&line) {
                        Ok(msg) => {
                            let _ = tx.send(msg);
                        }
                        Err(_) => debug!(line, "unparseable worker output"),
                    }
                }
            });
        }

        let pid = child.id();
        info!(pid, job_id = job.job_id, "spawned worker");
        active.insert(
            pid,
            ActiveWorker {
                job_id: job.job_id,
                child,
            },
        );
        Ok(())
    }

    /// Non-blocking wait on every active child; finished ones are marked
    /// completed or failed from their exit status.
    fn reap_children(&self, active: &mut HashMap<u32, ActiveWorker>) -> Result<()> {
        let mut finished = Vec::new();
        for (&pid, worker) in active.iter_mut() {
            match worker.child.try_wait() {
                Ok(Some(status)) => finished.push((pid, status.success())),
                Ok(None) => {}
                Err(e) => {
                    warn!(pid, error = %e, "wait on worker failed");
                    finished.push((pid, false));
                }
            }
        }

        for (pid, success) in finished {
            let worker = active.remove(&pid).expect("worker present");
            if success {
                info!(pid, job_id = worker.job_id, "worker exited successfully");
                self.scheduler.mark_completed(worker.job_id);
            } else {
                error!(pid, job_id = worker.job_id, "worker failed");
                self.scheduler.mark_failed(worker.job_id)?;
            }
        }
        Ok(())
    }
}

fn drain_progress(rx: &Receiver<ProgressMessage>) {
    while let Ok(msg) = rx.try_recv() {
        match msg.kind {
            MessageKind::JobProgress => {
                debug!(
                    job_id = msg.job_id,
                    processed = msg.value1,
                    total = msg.value2,
                    "job progress"
                );
            }
            MessageKind::JobStart => debug!(job_id = msg.job_id, "job started"),
            MessageKind::JobComplete => info!(job_id = msg.job_id, "job reports completion"),
            MessageKind::JobFailed => {
                error!(job_id = msg.job_id, detail = %msg.payload, "job reports failure")
            }
            _ => {}
        }
    }
}
