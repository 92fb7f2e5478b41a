use serde::{Deserialize, Serialize};

use crate::error::{EcpbError, Result};

/// Zstd level used for all chunk compression.
const ZSTD_LEVEL: i32 = 3;

/// Chunk compression codec. The integer tags match the catalog encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd,
}

impl Compression {
    pub fn as_tag(self) -> i64 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
            Compression::Zstd => 2,
        }
    }

    pub fn from_tag(tag: i64) -> Result<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            2 => Ok(Compression::Zstd),
            other => Err(EcpbError::Compression(format!(
                "unknown compression tag: {other}"
            ))),
        }
    }

    /// Parse a config/CLI name like "lz4", "zstd", "none".
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(EcpbError::Config(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Lz4 => "LZ4",
            Compression::Zstd => "ZSTD",
        }
    }
}

/// Compress a chunk. `None` returns a copy so every codec yields an owned
/// buffer the caller can encrypt in place.
pub fn compress(data: &[u8], codec: Compression) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::block::compress(data)),
        Compression::Zstd => zstd::bulk::compress(data, ZSTD_LEVEL)
            .map_err(|e| EcpbError::Compression(format!("zstd: {e}"))),
    }
}

/// Decompress a chunk. There is no header on the stored bytes, so the caller
/// must supply the original (uncompressed) size recorded in the manifest.
pub fn decompress(data: &[u8], original_size: usize, codec: Compression) -> Result<Vec<u8>> {
    match codec {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => lz4_flex::block::decompress(data, original_size)
            .map_err(|e| EcpbError::Decompression(format!("lz4: {e}"))),
        Compression::Zstd => {
            let out = zstd::bulk::decompress(data, original_size)
                .map_err(|e| EcpbError::Decompression(format!("zstd: {e}")))?;
            if out.len() != original_size {
                return Err(EcpbError::Decompression(format!(
                    "zstd: expected {original_size} bytes, got {}",
                    out.len()
                )));
            }
            Ok(out)
        }
    }
}
