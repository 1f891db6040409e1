use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{EncryptionError, Result};

pub const PBKDF2_ITERATIONS: u32 = 200_000;
pub const DERIVED_KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// 256-bit key material, wiped when dropped.
pub type DerivedKey = Zeroizing<[u8; DERIVED_KEY_LEN]>;

/// PBKDF2-HMAC-SHA256 over the PIN. Deterministic for a given `(pin, salt)`.
pub fn derive_key(pin: &str, salt: &[u8]) -> DerivedKey {
    let mut key = Zeroizing::new([0u8; DERIVED_KEY_LEN]);
    pbkdf2_hmac::<Sha256>(pin.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}

pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

pub fn generate_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// AES-256-GCM. Returns `(tag, ciphertext)` with the tag split off the end of
/// the cipher output; the ciphertext has the same length as `plaintext`.
pub fn seal_detached(
    key: &[u8; DERIVED_KEY_LEN],
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
) -> Result<([u8; TAG_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut sealed = cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "AES-GCM encryption failed")
        })?;
    let tag_start = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);
    Ok((tag, sealed))
}

/// Inverse of [`seal_detached`]. Any authentication failure is
/// [`EncryptionError::Integrity`].
pub fn open_detached(
    key: &[u8; DERIVED_KEY_LEN],
    iv: &[u8; IV_LEN],
    tag: &[u8; TAG_LEN],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut joined = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    joined.extend_from_slice(ciphertext);
    joined.extend_from_slice(tag);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(iv), joined.as_slice())
        .map_err(|_| EncryptionError::Integrity)?;
    Ok(Zeroizing::new(plaintext))
}

/// Constant-time comparison to prevent timing side channels.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
