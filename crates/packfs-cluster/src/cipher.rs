//! Cluster ciphers: fixed-blocksize block transforms plus the pad
//! alignment scheme.
//!
//! Alignment appends between 1 and `block_size` pad bytes and records the
//! pad length in the last plaintext byte, so the pad is always recoverable
//! after decryption. Key material is validated once at attach time; lookup
//! identity is a one-way digest of the raw key, never the key itself.

use std::fmt;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::ClusterError;

/// Length of a key fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 16;

/// Cipher algorithm of a cluster object, chosen at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CipherId {
    /// No encryption
    #[default]
    None,
    /// AES-256, 16-byte blocks
    Aes256,
}

impl CipherId {
    /// Whether this is the null cipher.
    pub fn is_null(&self) -> bool {
        matches!(self, CipherId::None)
    }

    /// Cipher block size in bytes; 0 for the null cipher.
    pub fn block_size(&self) -> usize {
        match self {
            CipherId::None => 0,
            CipherId::Aes256 => 16,
        }
    }

    /// Required raw key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherId::None => 0,
            CipherId::Aes256 => 32,
        }
    }
}

/// One-way digest of a raw key, used as its lookup identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyFingerprint(pub [u8; FINGERPRINT_LEN]);

impl KeyFingerprint {
    fn of(raw: &[u8]) -> Self {
        let digest = Sha256::digest(raw);
        let mut id = [0u8; FINGERPRINT_LEN];
        id.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        Self(id)
    }

    /// Hex rendering for logs.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

enum ExpandedKey {
    None,
    Aes256(Box<Aes256>),
}

/// The expanded cipher state owned by an object's cluster parameters.
///
/// Built once from raw user key bytes; the raw key is kept zeroized and
/// the expanded schedule never leaves this context.
pub struct CipherContext {
    id: CipherId,
    fingerprint: Option<KeyFingerprint>,
    raw: Zeroizing<Vec<u8>>,
    expanded: ExpandedKey,
}

impl fmt::Debug for CipherContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherContext")
            .field("id", &self.id)
            .field(
                "fingerprint",
                &self.fingerprint.as_ref().map(KeyFingerprint::to_hex),
            )
            .finish()
    }
}

impl CipherContext {
    /// The null cipher context.
    pub fn null() -> Self {
        Self {
            id: CipherId::None,
            fingerprint: None,
            raw: Zeroizing::new(Vec::new()),
            expanded: ExpandedKey::None,
        }
    }

    /// Builds a context for `id`, attaching and expanding `raw_key`.
    pub fn new(id: CipherId, raw_key: &[u8]) -> Result<Self, ClusterError> {
        if id.is_null() {
            return Ok(Self::null());
        }
        if raw_key.len() != id.key_len() {
            return Err(ClusterError::InvalidParams(format!(
                "{id:?} needs a {} byte key, got {}",
                id.key_len(),
                raw_key.len()
            )));
        }
        let expanded = match id {
            CipherId::None => ExpandedKey::None,
            CipherId::Aes256 => ExpandedKey::Aes256(Box::new(Aes256::new(
                GenericArray::from_slice(raw_key),
            ))),
        };
        Ok(Self {
            id,
            fingerprint: Some(KeyFingerprint::of(raw_key)),
            raw: Zeroizing::new(raw_key.to_vec()),
            expanded,
        })
    }

    /// Cipher algorithm of this context.
    pub fn id(&self) -> CipherId {
        self.id
    }

    /// Whether no cipher is attached.
    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }

    /// Block size of the attached cipher; 0 when null.
    pub fn block_size(&self) -> usize {
        self.id.block_size()
    }

    /// Fingerprint of the attached key, if any.
    pub fn fingerprint(&self) -> Option<&KeyFingerprint> {
        self.fingerprint.as_ref()
    }

    /// Whether `raw_key` is the key this context was built from.
    pub fn key_matches(&self, raw_key: &[u8]) -> bool {
        self.raw.as_slice() == raw_key
    }

    /// Encrypts `buf` block-by-block in place. `buf` must be aligned to the
    /// cipher block size.
    pub fn encrypt_in_place(&self, buf: &mut [u8]) {
        match &self.expanded {
            ExpandedKey::None => {}
            ExpandedKey::Aes256(aes) => {
                debug_assert_eq!(buf.len() % self.block_size(), 0);
                for block in buf.chunks_exact_mut(self.block_size()) {
                    aes.encrypt_block(GenericArray::from_mut_slice(block));
                }
            }
        }
    }

    /// Decrypts `buf` block-by-block in place. `buf` must be aligned to the
    /// cipher block size.
    pub fn decrypt_in_place(&self, buf: &mut [u8]) {
        match &self.expanded {
            ExpandedKey::None => {}
            ExpandedKey::Aes256(aes) => {
                debug_assert_eq!(buf.len() % self.block_size(), 0);
                for block in buf.chunks_exact_mut(self.block_size()) {
                    aes.decrypt_block(GenericArray::from_mut_slice(block));
                }
            }
        }
    }
}

/// Pads `buf` up to a multiple of `block_size`, recording the pad length in
/// the last byte. Always appends at least one byte so the pad length is
/// recoverable; returns the new length.
pub fn align(buf: &mut Vec<u8>, block_size: usize) -> usize {
    debug_assert!(block_size > 1 && block_size <= u8::MAX as usize);
    let pad = block_size - buf.len() % block_size;
    for _ in 1..pad {
        buf.push(0);
    }
    buf.push(pad as u8);
    debug_assert_eq!(buf.len() % block_size, 0);
    buf.len()
}
