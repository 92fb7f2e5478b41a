pub mod graph;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{EcpbError, Result};
use crate::job::{BackupJob, JobPriority, JobStatus};
use crate::now_epoch_ms;

use graph::JobGraph;

/// Queue entry: higher priority first, then older first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JobEntry {
    job_id: i64,
    priority: JobPriority,
    created_at: u64,
}

impl Ord for JobEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for JobEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    queue: BinaryHeap<JobEntry>,
    graph: JobGraph,
    in_progress: HashSet<i64>,
}

/// Coordinates job execution order: a priority queue over submitted jobs
/// plus a dependency DAG. All methods serialize under one lock.
pub struct JobScheduler {
    catalog: Arc<Catalog>,
    state: Mutex<SchedulerState>,
}

impl JobScheduler {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Persist a job and register it for scheduling. Returns the assigned
    /// job id. Declared dependencies are added as edges; an edge that
    /// would create a cycle is skipped with a warning.
    pub fn submit_job(&self, job: &mut BackupJob) -> Result<i64> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");

        let job_id = self.catalog.create_job(job)?;
        job.job_id = job_id;

        state.queue.push(JobEntry {
            job_id,
            priority: job.priority,
            created_at: now_epoch_ms(),
        });
        state.graph.add_node(job_id);

        for &dep in &job.dependencies {
            self.add_dependency_locked(&mut state, job_id, dep)?;
        }

        info!(job_id, name = %job.backup_name, priority = job.priority.as_str(), "job submitted");
        Ok(job_id)
    }

    /// Declare that `job_id` depends on `depends_on`. An edge that would
    /// create a cycle is rejected with a scheduling error and no state
    /// change.
    pub fn add_dependency(&self, job_id: i64, depends_on: i64) -> Result<()> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        self.add_dependency_locked(&mut state, job_id, depends_on)
    }

    fn add_dependency_locked(
        &self,
        state: &mut SchedulerState,
        job_id: i64,
        depends_on: i64,
    ) -> Result<()> {
        if !state.graph.add_edge(depends_on, job_id) {
            warn!(job_id, depends_on, "dependency rejected (would create cycle)");
            return Err(EcpbError::Scheduling(format!(
                "dependency of job {job_id} on {depends_on} would create a cycle"
            )));
        }
        self.catalog.add_dependency(job_id, depends_on)?;
        debug!(job_id, depends_on, "dependency added");
        Ok(())
    }

    /// Jobs whose dependencies are all resolved, still PENDING in the
    /// catalog, and not already handed out. Marks them in-progress and
    /// returns them priority-descending, then oldest-first.
    pub fn get_ready_jobs(&self) -> Result<Vec<BackupJob>> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        let mut ready = Vec::new();

        for node in state.graph.ready_nodes() {
            if state.in_progress.contains(&node) {
                continue;
            }
            let Some(job) = self.catalog.get_job(node)? else {
                continue;
            };
            if job.status != JobStatus::Pending {
                continue;
            }
            state.in_progress.insert(node);
            ready.push(job);
        }

        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(ready)
    }

    /// Remove a finished job, unblocking its dependents.
    pub fn mark_completed(&self, job_id: i64) {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        state.graph.remove_node(job_id);
        state.in_progress.remove(&job_id);
        state.queue.retain(|entry| entry.job_id != job_id);
        info!(job_id, "job marked completed");
    }

    /// Return a handed-out job to the ready pool, e.g. when the worker
    /// pool was full and the job never started.
    pub fn release(&self, job_id: i64) {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");
        state.in_progress.remove(&job_id);
    }

    /// Record a job failure and cancel its direct dependents. A status
    /// already set to FAILED by the worker keeps its error message.
    pub fn mark_failed(&self, job_id: i64) -> Result<()> {
        let mut state = self.state.lock().expect("scheduler mutex poisoned");

        let already_failed = self
            .catalog
            .get_job(job_id)?
            .is_some_and(|job| job.status == JobStatus::Failed);
        if !already_failed {
            self.catalog
                .update_job_status(job_id, JobStatus::Failed, Some("Worker process failed"))?;
        }

        for dependent in state.graph.dependents(job_id) {
            self.catalog.update_job_status(
                dependent,
                JobStatus::Cancelled,
                Some(&format!("Dependency job {job_id} failed")),
            )?;
            info!(job_id = dependent, cause = job_id, "job cancelled");
        }

        state.graph.remove_node(job_id);
        state.in_progress.remove(&job_id);
        state.queue.retain(|entry| entry.job_id != job_id);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .expect("scheduler mutex poisoned")
            .queue
            .len()
    }
}
