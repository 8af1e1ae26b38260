use std::io::Read;

use anyhow::{anyhow, ensure, Result};
use flate2::read::GzDecoder;

/// Inflates a gzip member into exactly `original_size` bytes.
///
/// Trailing block padding can make the checksum fail after the payload has been fully
/// inflated; a complete payload is accepted regardless.
pub fn decompress_gzip(compressed_data: &[u8], original_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.try_reserve_exact(original_size)
        .map_err(|e| anyhow!("Cannot allocate {original_size:#X} bytes: {e}"))?;
    let result = GzDecoder::new(compressed_data).take(original_size as u64).read_to_end(&mut out);
    if let Err(e) = result {
        ensure!(out.len() == original_size, "Decompression failed: {e}");
        log::debug!("Ignoring gzip error after a complete payload: {e}");
    }
    ensure!(
        out.len() == original_size,
        "Decompressed size mismatch: {} != {original_size}",
        out.len()
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    use super::*;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn inflates_with_trailing_padding() {
        let payload = b"miku miku miku miku".repeat(8);
        let mut compressed = gzip(&payload);
        compressed.resize(compressed.len() + 13, 0);
        assert_eq!(decompress_gzip(&compressed, payload.len()).unwrap(), payload);
    }

    #[test]
    fn rejects_size_mismatch() {
        let compressed = gzip(b"short");
        assert!(decompress_gzip(&compressed, 64).is_err());
        assert!(decompress_gzip(b"not gzip", 4).is_err());
        assert!(decompress_gzip(&compressed, usize::MAX).is_err());
    }
}
