use serde::{Deserialize, Serialize};

use crate::compress::Compression;
use crate::error::{EcpbError, Result};

/// Lifecycle state of a backup job.
///
/// Transitions: PENDING → RUNNING → COMPLETED | FAILED, and
/// PENDING → CANCELLED when a dependency fails. COMPLETED and CANCELLED
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_tag(self) -> i64 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Completed => 2,
            JobStatus::Failed => 3,
            JobStatus::Cancelled => 4,
        }
    }

    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            0 => Ok(JobStatus::Pending),
            1 => Ok(JobStatus::Running),
            2 => Ok(JobStatus::Completed),
            3 => Ok(JobStatus::Failed),
            4 => Ok(JobStatus::Cancelled),
            other => Err(EcpbError::Other(format!("unknown job status: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    pub fn as_tag(self) -> i64 {
        match self {
            JobPriority::Low => 0,
            JobPriority::Normal => 1,
            JobPriority::High => 2,
            JobPriority::Urgent => 3,
        }
    }

    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            0 => Ok(JobPriority::Low),
            1 => Ok(JobPriority::Normal),
            2 => Ok(JobPriority::High),
            3 => Ok(JobPriority::Urgent),
            other => Err(EcpbError::Other(format!("unknown job priority: {other}"))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Low => "LOW",
            JobPriority::Normal => "NORMAL",
            JobPriority::High => "HIGH",
            JobPriority::Urgent => "URGENT",
        }
    }
}

/// One backup of one source tree under one configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    /// Catalog-assigned monotonic id; -1 until persisted.
    pub job_id: i64,
    pub source_path: String,
    pub backup_name: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub compression: Compression,
    pub encrypt: bool,
    pub incremental: bool,
    pub parent_job_id: i64,
    pub created_at: u64,
    pub started_at: u64,
    pub completed_at: u64,
    pub total_bytes: u64,
    pub processed_bytes: u64,
    pub stored_bytes: u64,
    pub dedup_savings: u64,
    pub file_count: i64,
    pub error_message: String,
    /// Job ids this job depends on, as declared at submission time.
    pub dependencies: Vec<i64>,
}

impl BackupJob {
    pub fn new(source_path: impl Into<String>, backup_name: impl Into<String>) -> Self {
        Self {
            job_id: -1,
            source_path: source_path.into(),
            backup_name: backup_name.into(),
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            compression: Compression::Lz4,
            encrypt: true,
            incremental: false,
            parent_job_id: -1,
            created_at: 0,
            started_at: 0,
            completed_at: 0,
            total_bytes: 0,
            processed_bytes: 0,
            stored_bytes: 0,
            dedup_savings: 0,
            file_count: 0,
            error_message: String::new(),
            dependencies: Vec::new(),
        }
    }
}
