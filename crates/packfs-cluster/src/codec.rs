//! The deflate/inflate engines: page cluster ↔ disk blob.
//!
//! Deflate turns the plaintext page cluster into the on-disk byte blob:
//! compress (with accept/reject), append the magic marker, pad-align and
//! encrypt. Inflate mirrors it in reverse transform order: decrypt and
//! strip the pad, verify the magic, decompress and verify the length.
//!
//! On-disk blob layout, before encryption:
//!
//! ```text
//! [ compressed-or-raw payload ][ magic, if compressed ][ pad.., pad_len in last byte, if ciphered ]
//! ```

use tracing::debug;

use packfs_store::PAGE_SIZE;

use crate::cipher::align;
use crate::cluster::{ClusterHandle, ClusterParams};
use crate::compress::MIN_COMPRESS_LEN;
use crate::error::ClusterError;

/// Marker appended after an accepted compressed payload; the integrity
/// signal inflate consults to decide whether compression was applied.
pub const CLUSTER_MAGIC: [u8; 4] = [0xE5, 0x3A, 0x9C, 0x71];

/// Length of the magic marker.
pub const MAGIC_LEN: usize = CLUSTER_MAGIC.len();

/// Collects the page cluster's plaintext into one contiguous vector.
fn gather(handle: &ClusterHandle) -> Result<Vec<u8>, ClusterError> {
    let mut plain = Vec::new();
    plain
        .try_reserve(handle.content_len)
        .map_err(|e| ClusterError::OutOfMemory(e.to_string()))?;
    let mut remaining = handle.content_len;
    for page in &handle.pages {
        let take = remaining.min(PAGE_SIZE);
        plain.extend_from_slice(&page.read()[..take]);
        remaining -= take;
        if remaining == 0 {
            break;
        }
    }
    debug_assert_eq!(plain.len(), handle.content_len);
    Ok(plain)
}

/// Scatters the plaintext in `handle.buf[..handle.len]` back into the page
/// set, zero-filling every byte past it so pages are always fully defined.
pub fn scatter(handle: &ClusterHandle) {
    let data = &handle.buf.as_slice()[..handle.len];
    for (i, page) in handle.pages.iter().enumerate() {
        let start = i * PAGE_SIZE;
        let mut bytes = page.write();
        if start < data.len() {
            let take = (data.len() - start).min(PAGE_SIZE);
            bytes[..take].copy_from_slice(&data[start..start + take]);
            bytes[take..].fill(0);
        } else {
            bytes.fill(0);
        }
        drop(bytes);
        page.update_txn(|t| t.uptodate = true);
    }
}

/// Transforms the page cluster into the disk blob, leaving it in
/// `handle.buf` with `handle.len` valid bytes.
pub fn deflate(handle: &mut ClusterHandle, params: &ClusterParams) -> Result<(), ClusterError> {
    let content = handle.content_len;
    debug_assert!(content <= params.cluster_size());

    let plain = gather(handle)?;
    let pad_bound = params.cipher().block_size();

    handle.buf.ensure_capacity(params.worst_case_len(content))?;
    let mut out = handle.buf.take();
    out.clear();

    let mut compressed = false;
    if !params.compressor().is_null() && content >= MIN_COMPRESS_LEN {
        params.compressor().compress(&plain, &mut out)?;
        // Accept only a result that still wins after the marker and the
        // worst-case cipher pad; never persist an expanded cluster.
        if out.len() + MAGIC_LEN + pad_bound < content {
            out.extend_from_slice(&CLUSTER_MAGIC);
            compressed = true;
        } else {
            debug!(
                cluster = handle.index,
                raw = content,
                compressed = out.len(),
                "compression rejected"
            );
            out.clear();
        }
    }
    if !compressed {
        out.extend_from_slice(&plain);
    }

    if !params.cipher().is_null() {
        align(&mut out, params.cipher().block_size());
        params.cipher().encrypt_in_place(&mut out);
    }

    handle.len = out.len();
    handle.buf.give_back(out);
    debug!(
        cluster = handle.index,
        content,
        disk_len = handle.len,
        compressed,
        "cluster deflated"
    );
    Ok(())
}

/// Reverses `deflate`: turns the disk blob in `handle.buf[..handle.len]`
/// into `expected_len` plaintext bytes, verifying the pad, the magic
/// marker, and the decompressed length on the way.
pub fn inflate(
    handle: &mut ClusterHandle,
    params: &ClusterParams,
    expected_len: usize,
) -> Result<(), ClusterError> {
    let mut data = handle.buf.take();
    data.truncate(handle.len);

    if !params.cipher().is_null() {
        let bs = params.cipher().block_size();
        if data.is_empty() || data.len() % bs != 0 {
            return Err(ClusterError::DataCorruption(format!(
                "ciphered cluster {} is {} bytes, not block aligned",
                handle.index,
                data.len()
            )));
        }
        params.cipher().decrypt_in_place(&mut data);
        let pad = data[data.len() - 1] as usize;
        if pad == 0 || pad > bs || pad > data.len() {
            return Err(ClusterError::DataCorruption(format!(
                "cluster {} carries pad length {pad} outside 1..={bs}",
                handle.index
            )));
        }
        data.truncate(data.len() - pad);
    }

    if !params.compressor().is_null() && data.len() < expected_len {
        // Shorter than the plaintext means compression was applied; the
        // magic marker is the authoritative check before decompression.
        if data.len() < MAGIC_LEN {
            return Err(ClusterError::DataCorruption(format!(
                "cluster {} too short for a compressed payload",
                handle.index
            )));
        }
        let payload_len = data.len() - MAGIC_LEN;
        if data[payload_len..] != CLUSTER_MAGIC {
            return Err(ClusterError::DataCorruption(format!(
                "cluster {} magic marker mismatch",
                handle.index
            )));
        }
        let mut plain = Vec::new();
        params
            .compressor()
            .decompress(&data[..payload_len], &mut plain, expected_len)?;
        data = plain;
    } else if data.len() > expected_len {
        return Err(ClusterError::DataCorruption(format!(
            "cluster {} holds {} bytes, expected at most {}",
            handle.index,
            data.len(),
            expected_len
        )));
    }

    handle.len = data.len();
    handle.buf.give_back(data);
    debug!(
        cluster = handle.index,
        plain_len = handle.len,
        expected_len,
        "cluster inflated"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use packfs_store::PageCache;
    use proptest::prelude::*;

    use crate::cipher::{CipherContext, CipherId};
    use crate::cluster::{ClusterStatus, WriteWindow};
    use crate::compress::Compressor;

    const KEY: [u8; 32] = [0x42; 32];

    fn params(compressor: Compressor, cipher: CipherId) -> ClusterParams {
        let ctx = match cipher {
            CipherId::None => CipherContext::null(),
            CipherId::Aes256 => CipherContext::new(cipher, &KEY).unwrap(),
        };
        ClusterParams::new(12, compressor, ctx).unwrap()
    }

    fn handle_with(data: &[u8], cache: &PageCache) -> ClusterHandle {
        let mut h = ClusterHandle::new(0, WriteWindow::default(), ClusterStatus::Data);
        h.content_len = data.len();
        let p = params(Compressor::None, CipherId::None);
        h.grab_pages(cache, 1, &p);
        for (i, page) in h.pages.iter().enumerate() {
            let start = i * PAGE_SIZE;
            let take = (data.len() - start).min(PAGE_SIZE);
            page.write()[..take].copy_from_slice(&data[start..start + take]);
        }
        h
    }

    fn roundtrip(data: &[u8], p: &ClusterParams) -> Vec<u8> {
        let cache = PageCache::new();
        let mut h = handle_with(data, &cache);
        deflate(&mut h, p).unwrap();
        inflate(&mut h, p, data.len()).unwrap();
        h.buf.as_slice()[..h.len].to_vec()
    }

    fn all_pairs() -> Vec<ClusterParams> {
        let mut out = Vec::new();
        for compressor in [
            Compressor::None,
            Compressor::Lz4,
            Compressor::Zstd { level: 3 },
        ] {
            for cipher in [CipherId::None, CipherId::Aes256] {
                out.push(params(compressor, cipher));
            }
        }
        out
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn prop_roundtrip_all_pairs(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            for p in all_pairs() {
                let got = roundtrip(&data, &p);
                prop_assert_eq!(&got, &data);
            }
        }

        #[test]
        fn prop_compressible_repeats_roundtrip(byte in any::<u8>(), len in 0usize..=4096) {
            let data = vec![byte; len];
            for p in all_pairs() {
                let got = roundtrip(&data, &p);
                prop_assert_eq!(&got, &data);
            }
        }
    }

    #[test]
    fn reject_keeps_incompressible_cluster_raw() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let data: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();

        let p = params(Compressor::Lz4, CipherId::None);
        let cache = PageCache::new();
        let mut h = handle_with(&data, &cache);
        deflate(&mut h, &p).unwrap();
        // Never larger than skipping compression entirely.
        assert_eq!(h.len, data.len());
        inflate(&mut h, &p, data.len()).unwrap();
        assert_eq!(&h.buf.as_slice()[..h.len], &data[..]);
    }

    #[test]
    fn reject_bound_holds_with_cipher() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(8);
        let data: Vec<u8> = (0..4096).map(|_| rng.gen()).collect();

        let p = params(Compressor::Zstd { level: 3 }, CipherId::Aes256);
        let cache = PageCache::new();
        let mut h = handle_with(&data, &cache);
        deflate(&mut h, &p).unwrap();
        assert!(h.len <= data.len() + p.cipher().block_size());
    }

    #[test]
    fn magic_bit_flips_are_detected() {
        let data = vec![0x5Au8; 4096];
        let p = params(Compressor::Lz4, CipherId::None);
        let cache = PageCache::new();
        let mut h = handle_with(&data, &cache);
        deflate(&mut h, &p).unwrap();
        let blob = h.buf.as_slice()[..h.len].to_vec();
        assert!(blob.len() < data.len(), "zeros must compress");

        for byte in blob.len() - MAGIC_LEN..blob.len() {
            for bit in 0..8 {
                let mut tampered = blob.clone();
                tampered[byte] ^= 1 << bit;
                let mut h2 = ClusterHandle::new(0, WriteWindow::default(), ClusterStatus::Data);
                h2.len = tampered.len();
                h2.buf.give_back(tampered);
                let err = inflate(&mut h2, &p, data.len()).unwrap_err();
                assert!(
                    matches!(err, ClusterError::DataCorruption(_)),
                    "flip at byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn short_cluster_skips_compression() {
        let data = vec![0u8; MIN_COMPRESS_LEN - 1];
        let p = params(Compressor::Lz4, CipherId::None);
        let cache = PageCache::new();
        let mut h = handle_with(&data, &cache);
        deflate(&mut h, &p).unwrap();
        assert_eq!(h.len, data.len());
    }

    #[test]
    fn empty_cluster_deflates_to_pad_only_when_ciphered() {
        let p = params(Compressor::Lz4, CipherId::Aes256);
        let cache = PageCache::new();
        let mut h = handle_with(&[], &cache);
        deflate(&mut h, &p).unwrap();
        assert_eq!(h.len, p.cipher().block_size());
        inflate(&mut h, &p, 0).unwrap();
        assert_eq!(h.len, 0);
    }

    #[test]
    fn empty_cluster_deflates_to_nothing_unciphered() {
        let p = params(Compressor::Lz4, CipherId::None);
        let cache = PageCache::new();
        let mut h = handle_with(&[], &cache);
        deflate(&mut h, &p).unwrap();
        assert_eq!(h.len, 0);
    }

    #[test]
    fn corrupted_pad_byte_fails_closed() {
        let data = vec![0x33u8; 100];
        let p = params(Compressor::None, CipherId::Aes256);
        let cache = PageCache::new();
        let mut h = handle_with(&data, &cache);
        deflate(&mut h, &p).unwrap();

        // Truncating a whole block leaves the last decrypted byte as data,
        // not a valid pad in most cases; a misaligned blob always fails.
        let mut blob = h.buf.as_slice()[..h.len].to_vec();
        blob.pop();
        let mut h2 = ClusterHandle::new(0, WriteWindow::default(), ClusterStatus::Data);
        h2.len = blob.len();
        h2.buf.give_back(blob);
        let err = inflate(&mut h2, &p, data.len()).unwrap_err();
        assert!(matches!(err, ClusterError::DataCorruption(_)));
    }

    #[test]
    fn scatter_zero_fills_page_tails() {
        let p = params(Compressor::None, CipherId::None);
        let cache = PageCache::new();
        let mut h = ClusterHandle::new(0, WriteWindow::default(), ClusterStatus::Data);
        h.content_len = 4096;
        h.grab_pages(&cache, 1, &p);
        // Dirty the page first so the zero fill is observable.
        h.pages[0].write().fill(0xFF);

        h.buf.give_back(vec![0xABu8; 100]);
        h.len = 100;
        scatter(&h);
        let page = h.pages[0].read();
        assert!(page[..100].iter().all(|&b| b == 0xAB));
        assert!(page[100..].iter().all(|&b| b == 0));
        drop(page);
        assert!(h.pages[0].txn_state().uptodate);
    }

    #[test]
    fn oversized_raw_blob_is_corruption() {
        let p = params(Compressor::None, CipherId::None);
        let mut h = ClusterHandle::new(0, WriteWindow::default(), ClusterStatus::Data);
        h.buf.give_back(vec![0u8; 200]);
        h.len = 200;
        let err = inflate(&mut h, &p, 100).unwrap_err();
        assert!(matches!(err, ClusterError::DataCorruption(_)));
    }
}
