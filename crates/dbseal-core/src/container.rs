//! Encrypted database container.
//!
//! File layout:
//!   [ magic (7) | iv (12) | tag (16) | ciphertext (N) ]
//!
//! The ciphertext is AES-256-GCM output with the tag moved into the header, so
//! it has exactly the plaintext's length. The whole file is held in memory;
//! streaming is not supported.

use std::fs;
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::{generate_iv, open_detached, seal_detached, DERIVED_KEY_LEN, IV_LEN, TAG_LEN};
use crate::error::{EncryptionError, Result};
use crate::storage::write_atomic;

pub const CONTAINER_MAGIC: &[u8; MAGIC_LEN] = b"PSYENC1";
pub const MAGIC_LEN: usize = 7;
pub const HEADER_SIZE: usize = MAGIC_LEN + IV_LEN + TAG_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub iv: [u8; IV_LEN],
    pub tag: [u8; TAG_LEN],
}

impl ContainerHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..MAGIC_LEN].copy_from_slice(CONTAINER_MAGIC);
        buf[MAGIC_LEN..MAGIC_LEN + IV_LEN].copy_from_slice(&self.iv);
        buf[MAGIC_LEN + IV_LEN..].copy_from_slice(&self.tag);
        buf
    }

    /// Split a container into header and ciphertext. The magic is checked
    /// before anything else.
    pub fn parse(buf: &[u8]) -> Result<(Self, &[u8])> {
        if buf.len() < MAGIC_LEN || &buf[..MAGIC_LEN] != CONTAINER_MAGIC {
            return Err(EncryptionError::Format("magic mismatch"));
        }
        if buf.len() < HEADER_SIZE {
            return Err(EncryptionError::Format("truncated header"));
        }
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&buf[MAGIC_LEN..MAGIC_LEN + IV_LEN]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&buf[MAGIC_LEN + IV_LEN..HEADER_SIZE]);
        Ok((Self { iv, tag }, &buf[HEADER_SIZE..]))
    }
}

/// Encrypt `plaintext` under a fresh random IV.
pub fn encrypt_bytes(plaintext: &[u8], key: &[u8; DERIVED_KEY_LEN]) -> Result<Vec<u8>> {
    let iv = generate_iv();
    let (tag, ciphertext) = seal_detached(key, &iv, plaintext)?;
    let header = ContainerHeader { iv, tag };
    let mut out = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt_bytes(container: &[u8], key: &[u8; DERIVED_KEY_LEN]) -> Result<Zeroizing<Vec<u8>>> {
    let (header, ciphertext) = ContainerHeader::parse(container)?;
    open_detached(key, &header.iv, &header.tag, ciphertext)
}

/// Encrypt the closed database file at `plain_path` into `container_path`,
/// replacing any previous container atomically.
pub fn encrypt_file(plain_path: &Path, container_path: &Path, key: &[u8; DERIVED_KEY_LEN]) -> Result<()> {
    let plaintext = Zeroizing::new(fs::read(plain_path)?);
    let container = encrypt_bytes(&plaintext, key)?;
    write_atomic(container_path, &container)?;
    debug!(
        container = %container_path.display(),
        bytes = plaintext.len(),
        "database encrypted"
    );
    Ok(())
}

/// A container read from disk whose header has been validated. No key has
/// been involved yet.
pub struct SealedContainer {
    header: ContainerHeader,
    ciphertext: Vec<u8>,
}

impl SealedContainer {
    pub fn open(&self, key: &[u8; DERIVED_KEY_LEN]) -> Result<Zeroizing<Vec<u8>>> {
        open_detached(key, &self.header.iv, &self.header.tag, &self.ciphertext)
    }
}

/// Read `container_path` and check its header. Fails with `Format` before
/// the caller has to unseal anything.
pub fn read_container(container_path: &Path) -> Result<SealedContainer> {
    let bytes = fs::read(container_path)?;
    let (header, ciphertext) = ContainerHeader::parse(&bytes)?;
    Ok(SealedContainer {
        header,
        ciphertext: ciphertext.to_vec(),
    })
}

/// Decrypt `container_path` into `plain_path`. Nothing is written unless the
/// tag verifies.
pub fn decrypt_file(container_path: &Path, plain_path: &Path, key: &[u8; DERIVED_KEY_LEN]) -> Result<()> {
    let plaintext = read_container(container_path)?.open(key)?;
    write_atomic(plain_path, &plaintext)?;
    debug!(
        plain = %plain_path.display(),
        bytes = plaintext.len(),
        "database decrypted"
    );
    Ok(())
}
