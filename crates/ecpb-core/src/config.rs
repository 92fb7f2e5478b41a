use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compress::Compression;
use crate::error::{EcpbError, Result};

/// Engine configuration, deserialized from an optional YAML file.
///
/// Lookup order: `$ECPB_CONFIG`, then `./ecpb.yaml`. A missing file yields
/// the defaults; a present-but-malformed file is an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Root of the on-disk layout (catalog, chunk storage, snapshots).
    pub data_dir: PathBuf,

    /// Maximum concurrent worker processes in multi-process mode.
    pub max_workers: usize,

    /// Default compression for newly submitted jobs: "none", "lz4", "zstd".
    pub compression: String,

    /// Whether newly submitted jobs encrypt their chunks.
    pub encrypt: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./ecpb_data"),
            max_workers: 4,
            compression: "lz4".to_string(),
            encrypt: true,
        }
    }
}

impl EngineConfig {
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("ECPB_CONFIG") {
            return Self::load_from(Path::new(&path));
        }
        let local = Path::new("ecpb.yaml");
        if local.exists() {
            return Self::load_from(local);
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| EcpbError::Config(format!("{}: {e}", path.display())))
    }

    pub fn default_compression(&self) -> Result<Compression> {
        Compression::from_name(&self.compression)
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("ecpb.db")
    }

    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("storage")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    /// Create the on-disk layout expected at startup.
    pub fn ensure_layout(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.data_dir.join("store"))?;
        std::fs::create_dir_all(self.snapshot_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.data_dir, PathBuf::from("./ecpb_data"));
        assert_eq!(cfg.max_workers, 4);
        assert!(cfg.encrypt);
        assert!(cfg.default_compression().is_ok());
    }

    #[test]
    fn load_from_yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecpb.yaml");
        std::fs::write(&path, "data_dir: /tmp/backups\nmax_workers: 2\ncompression: zstd\n")
            .unwrap();
        let cfg = EngineConfig::load_from(&path).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/backups"));
        assert_eq!(cfg.max_workers, 2);
        assert_eq!(cfg.compression, "zstd");
        // Unspecified fields keep their defaults.
        assert!(cfg.encrypt);
    }

    #[test]
    fn load_from_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecpb.yaml");
        std::fs::write(&path, "no_such_field: 1\n").unwrap();
        assert!(EngineConfig::load_from(&path).is_err());
    }

    #[test]
    fn layout_paths_derive_from_data_dir() {
        let cfg = EngineConfig {
            data_dir: PathBuf::from("/data"),
            ..EngineConfig::default()
        };
        assert_eq!(cfg.catalog_path(), PathBuf::from("/data/ecpb.db"));
        assert_eq!(cfg.storage_dir(), PathBuf::from("/data/storage"));
        assert_eq!(cfg.snapshot_dir(), PathBuf::from("/data/snapshots"));
    }
}
