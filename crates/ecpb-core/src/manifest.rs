use serde::{Deserialize, Serialize};

use crate::crypto::Digest;

/// Reference to one chunk within a file, in file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub digest: Digest,
    /// Byte offset of this chunk within the original file.
    pub offset: u64,
    /// Chunk length; equals the fixed chunk size for all but the last chunk.
    pub size: u32,
    /// 0-based, strictly increasing position.
    pub chunk_index: u32,
    /// True iff the chunk was already catalogued before this job saw it.
    pub deduplicated: bool,
}

/// Per-file record sufficient to reconstruct the file byte-exactly:
/// concatenating the chunk payloads in `chunk_index` order yields the
/// original bytes, and `file_hash` is the digest of that concatenation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    /// Relative path below the backup root, forward-slash separated.
    pub file_path: String,
    pub file_name: String,
    pub file_size: u64,
    /// Modification time, epoch milliseconds.
    pub modified_time: u64,
    pub file_hash: Digest,
    pub chunks: Vec<ChunkInfo>,
}

impl FileManifest {
    /// Sum of the deduplicated chunk sizes — bytes this file did not add
    /// to storage.
    pub fn dedup_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|c| c.deduplicated)
            .map(|c| c.size as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32, offset: u64, size: u32, deduplicated: bool) -> ChunkInfo {
        ChunkInfo {
            digest: Digest::hash(&index.to_le_bytes()),
            offset,
            size,
            chunk_index: index,
            deduplicated,
        }
    }

    #[test]
    fn dedup_bytes_counts_only_duplicates() {
        let manifest = FileManifest {
            file_path: "dir/file.bin".into(),
            file_name: "file.bin".into(),
            file_size: 300,
            modified_time: 0,
            file_hash: Digest::hash(b""),
            chunks: vec![
                chunk(0, 0, 100, true),
                chunk(1, 100, 100, false),
                chunk(2, 200, 100, true),
            ],
        };
        assert_eq!(manifest.dedup_bytes(), 200);
    }
}
