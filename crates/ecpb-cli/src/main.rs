use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use ecpb_core::catalog::Catalog;
use ecpb_core::config::EngineConfig;
use ecpb_core::crypto::aes::AesKey;
use ecpb_core::error::Result;
use ecpb_core::ipc::StdoutSink;
use ecpb_core::job::{JobPriority, JobStatus};
use ecpb_core::orchestrator::{Orchestrator, WORKER_KEY_ENV};
use ecpb_core::restore::RestoreEngine;
use ecpb_core::snapshot::SnapshotManager;
use ecpb_core::store::ChunkStore;
use ecpb_core::worker::BackupWorker;

#[derive(Parser)]
#[command(
    name = "ecpb",
    version,
    about = "Content-addressed deduplicating backup engine",
    after_help = "\
Operations (pick one):
  --backup <SOURCE> --name <NAME>   Run a backup
  --restore <JOB_ID> --dest <PATH>  Restore a backup
  --verify <JOB_ID>                 Verify backup integrity
  --list                            List all jobs
  --stats                           Show system stats"
)]
struct Cli {
    /// Data directory (default: ./ecpb_data, or the config file value)
    #[arg(long, value_name = "PATH")]
    data_dir: Option<PathBuf>,

    /// Log level: 0=debug, 1=info, 2=warn, 3=error
    #[arg(long, value_name = "N", default_value_t = 1)]
    log_level: u8,

    /// Back up this source directory
    #[arg(long, value_name = "SOURCE")]
    backup: Option<PathBuf>,

    /// Name for the backup job
    #[arg(long, value_name = "NAME")]
    name: Option<String>,

    /// Run the backup through a pool of worker processes
    #[arg(long)]
    parallel: bool,

    /// Restore this job to --dest
    #[arg(long, value_name = "JOB_ID")]
    restore: Option<i64>,

    /// Destination directory for --restore
    #[arg(long, value_name = "PATH")]
    dest: Option<PathBuf>,

    /// Verify the integrity of a backup job
    #[arg(long, value_name = "JOB_ID")]
    verify: Option<i64>,

    /// List all jobs
    #[arg(long)]
    list: bool,

    /// Show catalog statistics
    #[arg(long)]
    stats: bool,

    /// Execute one job as a worker child (internal)
    #[arg(long, hide = true, value_name = "JOB_ID")]
    worker_job: Option<i64>,
}

fn main() {
    let cli = Cli::parse();

    let filter = match cli.log_level {
        0 => "debug",
        1 => "info",
        2 => "warn",
        _ => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match EngineConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }

    let code = match run(&cli, &config) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli, config: &EngineConfig) -> Result<i32> {
    if let Some(job_id) = cli.worker_job {
        return run_worker_child(config, job_id);
    }
    if let Some(source) = &cli.backup {
        return run_backup(config, source, cli.name.clone(), cli.parallel);
    }
    if let Some(job_id) = cli.restore {
        let Some(dest) = &cli.dest else {
            eprintln!("Missing --dest for restore.");
            return Ok(1);
        };
        return run_restore(config, job_id, dest);
    }
    if let Some(job_id) = cli.verify {
        return run_verify(config, job_id);
    }
    if cli.list {
        return run_list(config);
    }
    if cli.stats {
        return run_stats(config);
    }

    eprintln!("No operation requested; see --help.");
    Ok(1)
}

fn run_backup(
    config: &EngineConfig,
    source: &Path,
    name: Option<String>,
    parallel: bool,
) -> Result<i32> {
    let name = name.unwrap_or_else(|| format!("backup_{}", ecpb_core::now_epoch_ms()));
    let compression = config.default_compression()?;

    let mut orchestrator = Orchestrator::new(config)?;
    let job_id = orchestrator.submit_job(
        &source.to_string_lossy(),
        &name,
        JobPriority::Normal,
        compression,
        config.encrypt,
        false,
    )?;
    println!("Backup job #{job_id} created. Running...");

    if parallel {
        orchestrator.run_multi_process()?;
    } else {
        orchestrator.run_single_threaded()?;
    }

    match orchestrator.catalog().get_job(job_id)? {
        Some(job) if job.status == JobStatus::Completed => {
            println!(
                "Backup completed. Files: {}, Size: {}, Stored: {}",
                job.file_count,
                format_bytes(job.total_bytes),
                format_bytes(job.stored_bytes),
            );
            Ok(0)
        }
        _ => {
            eprintln!("Backup failed.");
            Ok(1)
        }
    }
}

fn run_restore(config: &EngineConfig, job_id: i64, dest: &Path) -> Result<i32> {
    config.ensure_layout()?;
    let catalog = Arc::new(Catalog::open(&config.catalog_path())?);
    let store = ChunkStore::new(Arc::clone(&catalog), config.storage_dir())?;
    let engine = RestoreEngine::new(&catalog, &store);

    let result = engine.restore_job(job_id, dest)?;
    if result.success {
        println!(
            "Restored {} files ({}) to {}",
            result.files_restored,
            format_bytes(result.bytes_restored),
            dest.display(),
        );
        Ok(0)
    } else {
        eprintln!("Restore failed: {}", result.error);
        Ok(1)
    }
}

fn run_verify(config: &EngineConfig, job_id: i64) -> Result<i32> {
    config.ensure_layout()?;
    let catalog = Arc::new(Catalog::open(&config.catalog_path())?);
    let store = ChunkStore::new(Arc::clone(&catalog), config.storage_dir())?;
    let engine = RestoreEngine::new(&catalog, &store);

    let ok = engine.verify_backup(job_id)?;
    println!("Backup #{job_id}: {}", if ok { "VERIFIED" } else { "FAILED" });
    Ok(if ok { 0 } else { 1 })
}

fn run_list(config: &EngineConfig) -> Result<i32> {
    config.ensure_layout()?;
    let catalog = Catalog::open(&config.catalog_path())?;
    for job in catalog.get_all_jobs()? {
        println!(
            "#{} {} [{}] {} files, {}",
            job.job_id,
            job.backup_name,
            job.status.as_str(),
            job.file_count,
            format_bytes(job.total_bytes),
        );
    }
    Ok(0)
}

fn run_stats(config: &EngineConfig) -> Result<i32> {
    config.ensure_layout()?;
    let catalog = Catalog::open(&config.catalog_path())?;
    let stats = catalog.get_stats()?;
    println!(
        "Jobs: {} (completed: {}, failed: {})",
        stats.total_jobs, stats.completed_jobs, stats.failed_jobs
    );
    println!("Chunks: {}", stats.total_chunks);
    println!("Stored: {}", format_bytes(stats.total_stored_bytes));
    println!("Dedup savings: {}", format_bytes(stats.total_dedup_savings));
    Ok(0)
}

/// Child entry for multi-process mode: open an independent catalog
/// handle, run the one job, and stream progress records on stdout.
fn run_worker_child(config: &EngineConfig, job_id: i64) -> Result<i32> {
    let key = match std::env::var(WORKER_KEY_ENV) {
        Ok(hex) => AesKey::from_hex(&hex)?,
        Err(_) => {
            eprintln!("Worker child started without {WORKER_KEY_ENV}.");
            return Ok(1);
        }
    };

    config.ensure_layout()?;
    let catalog = Arc::new(Catalog::open(&config.catalog_path())?);
    let Some(job) = catalog.get_job(job_id)? else {
        eprintln!("Worker child: job {job_id} not found.");
        return Ok(1);
    };

    let mut store = ChunkStore::new(Arc::clone(&catalog), config.storage_dir())?;
    let snapshots = SnapshotManager::new(config.snapshot_dir())?;
    let mut worker = BackupWorker::new(&catalog, &mut store, &snapshots);

    let outcome = worker.execute(&job, &key, Some(&StdoutSink));
    Ok(if outcome.success { 0 } else { 1 })
}

fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.2} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.2} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
