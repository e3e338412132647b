//! Passphrase-based export/import, independent of the root-key envelope.
//!
//! Used for offline backup: a human-chosen passphrase derives a one-off
//! AES-256-GCM key via PBKDF2-HMAC-SHA256 (600,000 iterations, a fresh
//! 32-byte random salt per export), so a backup file never depends on the
//! live root key ring to be restored elsewhere.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::CryptoError;

const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
const PBKDF2_ITERATIONS: u32 = 600_000;

/// A passphrase-encrypted blob, self-contained and portable.
#[derive(Debug, Clone)]
pub struct ExportedBlob {
    /// Random per-export salt.
    pub salt: Vec<u8>,
    /// AEAD nonce.
    pub nonce: Vec<u8>,
    /// Ciphertext (includes the AEAD tag).
    pub ciphertext: Vec<u8>,
}

fn derive_key(passphrase: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    pbkdf2_hmac::<Sha256>(passphrase, salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypts `plaintext` under a key derived from `passphrase`.
pub fn export_value(passphrase: &[u8], plaintext: &[u8]) -> Result<ExportedBlob, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut key = derive_key(passphrase, &salt);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed);
    key.zeroize();

    Ok(ExportedBlob {
        salt: salt.to_vec(),
        nonce: nonce_bytes.to_vec(),
        ciphertext: ciphertext?,
    })
}

/// Decrypts a blob produced by [`export_value`]. A wrong passphrase fails
/// AEAD authentication rather than yielding garbage plaintext.
pub fn import_value(passphrase: &[u8], blob: &ExportedBlob) -> Result<Vec<u8>, CryptoError> {
    if blob.nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let mut key = derive_key(passphrase, &blob.salt);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let result = cipher
        .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed);
    key.zeroize();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_then_import_round_trips_with_correct_passphrase() {
        let blob = export_value(b"correct horse battery staple", b"postgres://u:p@h/d").unwrap();
        let recovered = import_value(b"correct horse battery staple", &blob).unwrap();
        assert_eq!(recovered, b"postgres://u:p@h/d");
    }

    #[test]
    fn import_with_wrong_passphrase_fails_and_yields_nothing() {
        let blob = export_value(b"correct horse battery staple", b"top-secret").unwrap();
        assert!(import_value(b"wrong passphrase", &blob).is_err());
    }

    #[test]
    fn each_export_uses_a_distinct_salt_and_nonce() {
        let a = export_value(b"pw", b"same plaintext").unwrap();
        let b = export_value(b"pw", b"same plaintext").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
