//! Decompression of the configured module image.

use std::io::Read;

use crate::error::Error;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Stream compression formats accepted for the module image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// gzip (RFC 1952).
    Gzip,
    /// Zstandard.
    Zstd,
}

impl Compression {
    /// Detect the format from the leading magic bytes.
    #[must_use]
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(&GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if data.starts_with(&ZSTD_MAGIC) {
            Some(Self::Zstd)
        } else {
            None
        }
    }
}

/// Decompress a module image, refusing output larger than `limit` bytes.
///
/// # Errors
///
/// Returns [`Error::Decompression`] if the format is not recognized, the
/// stream is malformed or truncated, the output is empty, or the output
/// exceeds `limit`.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, Error> {
    let format = Compression::detect(data).ok_or_else(|| {
        Error::Decompression("not a gzip or zstd stream".to_string())
    })?;

    let mut out = Vec::new();
    match format {
        Compression::Gzip => read_limited(flate2::read::GzDecoder::new(data), limit, &mut out)?,
        Compression::Zstd => {
            let decoder = zstd::Decoder::new(data)
                .map_err(|e| Error::Decompression(format!("failed to create zstd decoder: {e}")))?;
            read_limited(decoder, limit, &mut out)?;
        }
    }

    if out.is_empty() {
        return Err(Error::Decompression("module image is empty".to_string()));
    }

    tracing::debug!(
        ?format,
        compressed = data.len(),
        decompressed = out.len(),
        "Decompressed module image"
    );
    Ok(out)
}

fn read_limited(reader: impl Read, limit: usize, out: &mut Vec<u8>) -> Result<(), Error> {
    reader
        .take(limit as u64 + 1)
        .read_to_end(out)
        .map_err(|e| Error::Decompression(e.to_string()))?;
    if out.len() > limit {
        return Err(Error::Decompression(format!(
            "module image exceeds {limit} bytes"
        )));
    }
    Ok(())
}
