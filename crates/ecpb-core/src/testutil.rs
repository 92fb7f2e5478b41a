use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use crate::catalog::Catalog;
use crate::snapshot::SnapshotManager;
use crate::store::ChunkStore;

/// A fresh catalog in its own temp directory. The `TempDir` must be kept
/// alive for the duration of the test.
pub fn temp_catalog() -> (TempDir, Catalog) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let catalog = Catalog::open(&dir.path().join("ecpb.db")).expect("open catalog");
    (dir, catalog)
}

/// Engine fixture: catalog, chunk store, and snapshot manager rooted in one
/// temp directory laid out like a real data dir.
pub struct TestEngine {
    pub dir: TempDir,
    pub catalog: Arc<Catalog>,
    pub store: ChunkStore,
    pub snapshots: SnapshotManager,
}

impl TestEngine {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let catalog = Arc::new(Catalog::open(&dir.path().join("ecpb.db")).expect("open catalog"));
        let store =
            ChunkStore::new(Arc::clone(&catalog), dir.path().join("storage")).expect("chunk store");
        let snapshots = SnapshotManager::new(dir.path().join("snapshots")).expect("snapshots");
        Self {
            dir,
            catalog,
            store,
            snapshots,
        }
    }

    /// A directory of source files under the fixture root.
    pub fn source_dir(&self, files: &[(&str, &[u8])]) -> PathBuf {
        let source = self.dir.path().join("source");
        for (rel, contents) in files {
            let path = source.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).expect("create source subdir");
            }
            std::fs::write(&path, contents).expect("write source file");
        }
        std::fs::create_dir_all(&source).expect("create source dir");
        source
    }
}
