use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::Result;
use crate::now_epoch_ms;

/// A transient hardlink mirror of a source tree, giving the worker a
/// stable view and a well-defined prefix for relative paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub job_id: i64,
    pub snapshot_path: PathBuf,
    pub created_at: u64,
    /// True iff every traversal step succeeded.
    pub is_consistent: bool,
}

pub struct SnapshotManager {
    base_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Mirror `source_path` under `<base>/snap_<job_id>_<created_at>`.
    /// Regular files are hardlinked where possible (copy fallback for
    /// cross-device or permission failures); symlinks and other
    /// non-regular entries are ignored.
    pub fn create_snapshot(&self, job_id: i64, source_path: &Path) -> SnapshotInfo {
        let created_at = now_epoch_ms();
        let snap_dir = self.base_dir.join(format!("snap_{job_id}_{created_at}"));

        let mut info = SnapshotInfo {
            job_id,
            snapshot_path: snap_dir.clone(),
            created_at,
            is_consistent: false,
        };

        if let Err(e) = std::fs::create_dir_all(&snap_dir) {
            warn!(job_id, error = %e, "cannot create snapshot directory");
            return info;
        }

        let metadata = match std::fs::symlink_metadata(source_path) {
            Ok(m) => m,
            Err(e) => {
                warn!(job_id, source = %source_path.display(), error = %e,
                      "snapshot source does not exist");
                return info;
            }
        };

        info.is_consistent = if metadata.is_dir() {
            mirror_directory(source_path, &snap_dir)
        } else if metadata.is_file() {
            // Single-file source: mirror just that file.
            let name = source_path
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_else(|| "file".into());
            link_or_copy(source_path, &snap_dir.join(name))
        } else {
            warn!(job_id, "snapshot source is neither file nor directory");
            false
        };

        if info.is_consistent {
            info!(job_id, snapshot = %snap_dir.display(), "snapshot created");
        } else {
            warn!(job_id, "snapshot creation failed");
        }
        info
    }

    /// Regular files in the snapshot, in a stable name-sorted order.
    pub fn list_files(&self, info: &SnapshotInfo) -> Vec<PathBuf> {
        WalkDir::new(&info.snapshot_path)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect()
    }

    /// Recursively remove a snapshot tree, tolerating missing files.
    pub fn remove_snapshot(&self, info: &SnapshotInfo) {
        match std::fs::remove_dir_all(&info.snapshot_path) {
            Ok(()) => info!(job_id = info.job_id, "snapshot removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = info.job_id, error = %e, "snapshot removal failed"),
        }
    }
}

fn mirror_directory(src: &Path, dst: &Path) -> bool {
    let entries = match std::fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %src.display(), error = %e, "cannot read directory");
            return false;
        }
    };

    let mut ok = true;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => {
                ok = false;
                continue;
            }
        };
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let metadata = match std::fs::symlink_metadata(&src_path) {
            Ok(m) => m,
            Err(_) => continue,
        };

        if metadata.is_dir() {
            if std::fs::create_dir_all(&dst_path).is_err() {
                ok = false;
                continue;
            }
            if !mirror_directory(&src_path, &dst_path) {
                ok = false;
            }
        } else if metadata.is_file() {
            if !link_or_copy(&src_path, &dst_path) {
                ok = false;
            }
        }
        // Symlinks and special files are intentionally skipped.
    }
    ok
}

/// Hardlink `src` to `dst`, falling back to a byte copy when linking is
/// not possible (cross-device, permissions).
fn link_or_copy(src: &Path, dst: &Path) -> bool {
    if std::fs::hard_link(src, dst).is_ok() {
        return true;
    }
    match std::fs::copy(src, dst) {
        Ok(_) => true,
        Err(e) => {
            warn!(src = %src.display(), error = %e, "snapshot copy failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, SnapshotManager, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshots")).unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("nested")).unwrap();
        std::fs::write(source.join("top.txt"), b"top contents").unwrap();
        std::fs::write(source.join("nested/deep.txt"), b"deep contents").unwrap();
        (dir, manager, source)
    }

    #[test]
    fn snapshot_mirrors_tree() {
        let (_dir, manager, source) = setup();
        let info = manager.create_snapshot(7, &source);
        assert!(info.is_consistent);
        assert!(info
            .snapshot_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("snap_7_"));

        assert_eq!(
            std::fs::read(info.snapshot_path.join("top.txt")).unwrap(),
            b"top contents"
        );
        assert_eq!(
            std::fs::read(info.snapshot_path.join("nested/deep.txt")).unwrap(),
            b"deep contents"
        );
    }

    #[test]
    fn list_files_finds_regular_files_only() {
        let (_dir, manager, source) = setup();
        let info = manager.create_snapshot(1, &source);
        let files = manager.list_files(&info);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| f.is_file()));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_ignored() {
        let (_dir, manager, source) = setup();
        std::os::unix::fs::symlink(source.join("top.txt"), source.join("alias")).unwrap();

        let info = manager.create_snapshot(2, &source);
        assert!(info.is_consistent);
        assert!(!info.snapshot_path.join("alias").exists());
        assert_eq!(manager.list_files(&info).len(), 2);
    }

    #[test]
    fn missing_source_is_inconsistent() {
        let (_dir, manager, _source) = setup();
        let info = manager.create_snapshot(3, Path::new("/no/such/path"));
        assert!(!info.is_consistent);
    }

    #[test]
    fn single_file_source_is_copied() {
        let (_dir, manager, source) = setup();
        let info = manager.create_snapshot(4, &source.join("top.txt"));
        assert!(info.is_consistent);
        assert_eq!(
            std::fs::read(info.snapshot_path.join("top.txt")).unwrap(),
            b"top contents"
        );
    }

    #[test]
    fn remove_snapshot_deletes_tree_and_tolerates_absence() {
        let (_dir, manager, source) = setup();
        let info = manager.create_snapshot(5, &source);
        assert!(info.snapshot_path.exists());
        manager.remove_snapshot(&info);
        assert!(!info.snapshot_path.exists());
        // Second removal is a no-op.
        manager.remove_snapshot(&info);
    }
}
