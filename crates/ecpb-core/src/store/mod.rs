use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::compress::{self, Compression};
use crate::crypto::aes::{self, AesKey};
use crate::crypto::Digest;
use crate::error::{EcpbError, Result};
use crate::manifest::{ChunkInfo, FileManifest};
use crate::CHUNK_SIZE;

/// Content-addressed chunk storage on the local filesystem, layered over
/// the catalog. Byte objects live at
/// `<root>/chunks/<hex[0:2]>/<hex[2:4]>/<hex>`; the catalog holds the
/// authoritative locator and metadata for each chunk.
pub struct ChunkStore {
    catalog: Arc<Catalog>,
    root: PathBuf,
    /// Dedup fast-path: digests this instance has confirmed present.
    dedup_index: HashMap<String, bool>,
    /// Locator fast-path: digest → byte object path. Advisory only; the
    /// catalog remains the source of truth.
    locator_index: BTreeMap<String, PathBuf>,
}

impl ChunkStore {
    pub fn new(catalog: Arc<Catalog>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("chunks"))?;
        Ok(Self {
            catalog,
            root,
            dedup_index: HashMap::new(),
            locator_index: BTreeMap::new(),
        })
    }

    /// Content-addressed path for a digest: two levels of hex sharding,
    /// then the full hex name.
    fn chunk_path(&self, digest_hex: &str) -> PathBuf {
        self.root
            .join("chunks")
            .join(&digest_hex[0..2])
            .join(&digest_hex[2..4])
            .join(digest_hex)
    }

    /// Split a file into fixed-size chunks, store the previously-unseen
    /// ones (compressed, then encrypted), and return the manifest. The
    /// manifest is persisted together with its chunk entries.
    ///
    /// A chunk whose byte file cannot be written is skipped: the manifest
    /// comes back with fewer entries than the file has chunks, and the
    /// caller can detect the gap from the chunk count.
    pub fn store_file(
        &mut self,
        file_path: &Path,
        compression: Compression,
        encrypt: bool,
        key: &AesKey,
        job_id: i64,
        relative_path: &str,
    ) -> Result<FileManifest> {
        let metadata = std::fs::metadata(file_path)?;
        let modified_time = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let file_hash = Digest::hash_file(file_path)?;

        let mut manifest = FileManifest {
            file_path: relative_path.to_string(),
            file_name: basename_of(relative_path),
            file_size: metadata.len(),
            modified_time,
            file_hash,
            chunks: Vec::new(),
        };

        let mut file = std::fs::File::open(file_path)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut chunk_index: u32 = 0;
        let mut offset: u64 = 0;

        loop {
            let read = read_full(&mut file, &mut buf)?;
            if read == 0 {
                break;
            }
            let chunk_data = &buf[..read];
            let digest = Digest::hash(chunk_data);
            let digest_hex = digest.to_hex();

            let mut info = ChunkInfo {
                digest,
                offset,
                size: read as u32,
                chunk_index,
                deduplicated: false,
            };

            if self.dedup_index.contains_key(&digest_hex)
                || self.catalog.chunk_exists(&digest_hex)?
            {
                info.deduplicated = true;
                self.catalog.store_chunk(
                    &digest_hex,
                    self.chunk_path(&digest_hex).to_string_lossy().as_ref(),
                    read as u32,
                    0,
                    compression,
                    encrypt,
                )?;
                debug!(chunk = %digest, "chunk deduplicated");
            } else if !self.write_new_chunk(chunk_data, &digest_hex, compression, encrypt, key)? {
                // I/O failure on the byte file; chunk skipped, manifest
                // left incomplete.
                offset += read as u64;
                chunk_index += 1;
                continue;
            }

            manifest.chunks.push(info);
            offset += read as u64;
            chunk_index += 1;
        }

        self.catalog.store_file_manifest(job_id, &manifest)?;

        info!(
            file = %manifest.file_name,
            size = manifest.file_size,
            chunks = chunk_index,
            "stored file"
        );
        Ok(manifest)
    }

    /// Process and write one previously-unseen chunk. Returns false when
    /// the byte file could not be written (the chunk is skipped).
    fn write_new_chunk(
        &mut self,
        chunk_data: &[u8],
        digest_hex: &str,
        compression: Compression,
        encrypt: bool,
        key: &AesKey,
    ) -> Result<bool> {
        // Compress, falling back to raw bytes on codec failure. The
        // catalog row records the encoding actually used so restore can
        // decode the chunk regardless of the job-level setting.
        let (processed, actual_compression) = if compression != Compression::None {
            match compress::compress(chunk_data, compression) {
                Ok(packed) => (packed, compression),
                Err(e) => {
                    warn!(chunk = digest_hex, error = %e, "compression failed, storing raw");
                    (chunk_data.to_vec(), Compression::None)
                }
            }
        } else {
            (chunk_data.to_vec(), Compression::None)
        };

        let processed = if encrypt {
            aes::encrypt(&processed, key)?
        } else {
            processed
        };

        let path = self.chunk_path(digest_hex);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(chunk = digest_hex, error = %e, "cannot create chunk directory");
                return Ok(false);
            }
        }
        if let Err(e) = std::fs::write(&path, &processed) {
            warn!(chunk = digest_hex, error = %e, "cannot write chunk file");
            return Ok(false);
        }

        self.catalog.store_chunk(
            digest_hex,
            path.to_string_lossy().as_ref(),
            chunk_data.len() as u32,
            processed.len() as u32,
            actual_compression,
            encrypt,
        )?;

        self.dedup_index.insert(digest_hex.to_string(), true);
        self.locator_index.insert(digest_hex.to_string(), path);
        Ok(true)
    }

    /// Reassemble a file from its manifest, verifying each chunk digest
    /// and the whole-file digest. Any mismatch or I/O error aborts.
    pub fn restore_file(
        &self,
        manifest: &FileManifest,
        dest_path: &Path,
        encrypted: bool,
        key: &AesKey,
    ) -> Result<()> {
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(dest_path)?;

        for chunk in &manifest.chunks {
            let digest_hex = chunk.digest.to_hex();

            let chunk_path = match self.locator_index.get(&digest_hex) {
                Some(path) => path.clone(),
                None => self
                    .catalog
                    .get_chunk_path(&digest_hex)?
                    .map(PathBuf::from)
                    .ok_or_else(|| {
                        EcpbError::Integrity(format!("chunk {digest_hex} not catalogued"))
                    })?,
            };

            let mut data = std::fs::read(&chunk_path)?;

            if encrypted {
                data = aes::decrypt(&data, key)?;
            }

            // The per-chunk catalog row carries the encoding actually
            // used, which differs from the job tag when compression fell
            // back to raw storage.
            let chunk_compression = self
                .catalog
                .get_chunk_meta(&digest_hex)?
                .map(|meta| meta.compression)
                .ok_or_else(|| {
                    EcpbError::Integrity(format!("chunk {digest_hex} not catalogued"))
                })?;
            if chunk_compression != Compression::None {
                data = compress::decompress(&data, chunk.size as usize, chunk_compression)?;
            }

            let computed = Digest::hash(&data);
            if computed != chunk.digest {
                return Err(EcpbError::Integrity(format!(
                    "chunk {digest_hex} digest mismatch (got {computed})"
                )));
            }

            out.write_all(&data)?;
        }
        out.flush()?;
        drop(out);

        let restored_hash = Digest::hash_file(dest_path)?;
        if restored_hash != manifest.file_hash {
            return Err(EcpbError::Integrity(format!(
                "file {} hash mismatch after restore",
                manifest.file_path
            )));
        }

        info!(file = %manifest.file_path, size = manifest.file_size, "restored file");
        Ok(())
    }

    pub fn dedup_index_len(&self) -> usize {
        self.dedup_index.len()
    }

    pub fn locator_index_len(&self) -> usize {
        self.locator_index.len()
    }
}

/// Read until the buffer is full or EOF; a short final block is the last
/// chunk of the file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

fn basename_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}
