//! Cluster compressors: LZ4 block format for the hot path, Zstd for a
//! better ratio, plus the null passthrough.
//!
//! Every compressor works into a bounded destination sized from its own
//! `max_overhead` estimate and never writes past it. Decompression always
//! verifies the produced length against the expected plaintext length of
//! the cluster.

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Clusters shorter than this are not worth a compression attempt.
pub const MIN_COMPRESS_LEN: usize = 64;

/// Compression algorithm of a cluster object, chosen at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compressor {
    /// No compression (passthrough)
    None,
    /// LZ4 block format
    #[default]
    Lz4,
    /// Zstandard
    Zstd {
        /// Compression level (1=fastest, 19=best ratio)
        level: i32,
    },
}

impl Compressor {
    /// Whether this is the null compressor.
    pub fn is_null(&self) -> bool {
        matches!(self, Compressor::None)
    }

    /// Worst-case extra bytes compression of `input_len` bytes can produce
    /// over the input itself. Used to size transform buffers and to bound
    /// quota reservations.
    pub fn max_overhead(&self, input_len: usize) -> usize {
        match self {
            Compressor::None => 0,
            Compressor::Lz4 => {
                lz4_flex::block::get_maximum_output_size(input_len) - input_len
            }
            Compressor::Zstd { .. } => zstd::zstd_safe::compress_bound(input_len) - input_len,
        }
    }

    /// Compresses `src` into `dst` (cleared first). `dst` ends up holding
    /// exactly the compressed bytes.
    pub fn compress(&self, src: &[u8], dst: &mut Vec<u8>) -> Result<(), ClusterError> {
        let bound = src.len() + self.max_overhead(src.len());
        dst.clear();
        dst.try_reserve(bound)
            .map_err(|e| ClusterError::OutOfMemory(e.to_string()))?;
        dst.resize(bound, 0);
        let written = match self {
            Compressor::None => {
                dst[..src.len()].copy_from_slice(src);
                src.len()
            }
            Compressor::Lz4 => lz4_flex::block::compress_into(src, dst)
                .map_err(|e| ClusterError::OutOfMemory(format!("lz4 compress: {e}")))?,
            Compressor::Zstd { level } => zstd::bulk::compress_to_buffer(src, &mut dst[..], *level)
                .map_err(|e| ClusterError::OutOfMemory(format!("zstd compress: {e}")))?,
        };
        debug_assert!(written <= bound);
        dst.truncate(written);
        Ok(())
    }

    /// Decompresses `src` into `dst` (cleared first), verifying that exactly
    /// `expected_len` bytes come out.
    pub fn decompress(
        &self,
        src: &[u8],
        dst: &mut Vec<u8>,
        expected_len: usize,
    ) -> Result<(), ClusterError> {
        dst.clear();
        dst.try_reserve(expected_len)
            .map_err(|e| ClusterError::OutOfMemory(e.to_string()))?;
        dst.resize(expected_len, 0);
        let written = match self {
            Compressor::None => {
                if src.len() != expected_len {
                    return Err(ClusterError::DataCorruption(format!(
                        "raw cluster is {} bytes, expected {}",
                        src.len(),
                        expected_len
                    )));
                }
                dst.copy_from_slice(src);
                expected_len
            }
            Compressor::Lz4 => lz4_flex::block::decompress_into(src, dst)
                .map_err(|e| ClusterError::DataCorruption(format!("lz4 decompress: {e}")))?,
            Compressor::Zstd { .. } => zstd::bulk::decompress_to_buffer(src, &mut dst[..])
                .map_err(|e| ClusterError::DataCorruption(format!("zstd decompress: {e}")))?,
        };
        if written != expected_len {
            return Err(ClusterError::DataCorruption(format!(
                "decompressed to {written} bytes, expected {expected_len}"
            )));
        }
        Ok(())
    }
}
