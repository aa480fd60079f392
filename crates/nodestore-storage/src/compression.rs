//! zstd compression of stored objects.
//!
//! Compressed data is recognised by the zstd frame magic, so stores can mix
//! compressed and uncompressed entries and the policy can change over time.

use nodestore_common::config::CompressionConfig;
use nodestore_common::{Error, ObjectHeader, Result};
use std::borrow::Cow;

/// Leading bytes of every zstd frame
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Compression policy shared by the sub-storages of a blob store
#[derive(Clone, Debug)]
pub struct Compressor {
    enabled: bool,
    level: i32,
    uncompressable: Vec<String>,
}

impl Compressor {
    #[must_use]
    pub fn new(config: &CompressionConfig) -> Self {
        Self {
            enabled: config.enabled,
            level: config.level,
            uncompressable: config.uncompressable_content_types.clone(),
        }
    }

    /// Policy that stores everything as-is
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            level: 0,
            uncompressable: Vec::new(),
        }
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    /// Compress data if compression is enabled
    pub fn compress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if !self.enabled {
            return Ok(Cow::Borrowed(data));
        }
        let compressed = zstd::encode_all(data, self.level)
            .map_err(|e| Error::internal(format!("zstd compress failed: {e}")))?;
        Ok(Cow::Owned(compressed))
    }

    /// Decompress data carrying the zstd magic; anything else passes through.
    pub fn decompress<'a>(&self, data: &'a [u8]) -> Result<Cow<'a, [u8]>> {
        if !data.starts_with(&ZSTD_MAGIC) {
            return Ok(Cow::Borrowed(data));
        }
        let decompressed = zstd::decode_all(data)
            .map_err(|e| Error::Corrupted(format!("zstd decompress failed: {e}")))?;
        Ok(Cow::Owned(decompressed))
    }

    /// Whether an object with this header should be compressed.
    ///
    /// Content types listed as uncompressable are matched exactly, or by
    /// prefix when the entry ends with `*`.
    #[must_use]
    pub fn needs_compression(&self, header: &ObjectHeader) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(content_type) = header.content_type() else {
            return true;
        };
        !self.uncompressable.iter().any(|pattern| {
            pattern.strip_suffix('*').map_or_else(
                || pattern == content_type,
                |prefix| content_type.starts_with(prefix),
            )
        })
    }
}
