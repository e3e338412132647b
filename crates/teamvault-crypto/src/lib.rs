#![forbid(unsafe_code)]

//! Envelope encryption for TeamVault.
//!
//! Every value (a secret version, a lease credential bundle, a webhook
//! HMAC secret) is sealed under a freshly generated, single-use Data
//! Encryption Key (DEK). The DEK itself is sealed under a long-lived root
//! key and stored alongside the ciphertext. This means rotating the root
//! key never requires re-encrypting existing payloads — only re-wrapping
//! their DEKs — and a compromised DEK only ever exposes one value.
//!
//! Both layers use AES-256-GCM with a fresh random 96-bit nonce per seal.
//! Key material is held in [`zeroize`]-backed buffers that are scrubbed on
//! drop and never implement `Debug`, `Clone`, or `Serialize`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use std::collections::HashMap;
use teamvault_types::errors::{Categorize, ErrorCategory};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub mod export;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Errors raised while sealing or opening a value.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A supplied key was not exactly 32 bytes.
    #[error("key material must be exactly {KEY_LEN} bytes")]
    InvalidKeyLength,
    /// AEAD sealing failed (should not happen with valid key/nonce lengths).
    #[error("encryption failed")]
    EncryptionFailed,
    /// AEAD opening failed: wrong key, corrupted ciphertext, or a tampered tag.
    #[error("decryption failed")]
    DecryptionFailed,
    /// The payload references a root key generation we don't hold.
    #[error("unknown root key generation {0}")]
    UnknownKeyGeneration(i32),
}

impl Categorize for CryptoError {
    fn category(&self) -> ErrorCategory {
        match self {
            CryptoError::InvalidKeyLength => ErrorCategory::Validation,
            CryptoError::EncryptionFailed
            | CryptoError::DecryptionFailed
            | CryptoError::UnknownKeyGeneration(_) => ErrorCategory::Backend,
        }
    }
}

/// A 256-bit root key, scrubbed from memory on drop.
///
/// Deliberately has no `Debug`, `Clone`, or `Serialize` impl: the only way
/// to get key bytes out is through [`RootKey::from_bytes`]'s input, never
/// its output.
#[derive(ZeroizeOnDrop)]
pub struct RootKey([u8; KEY_LEN]);

impl RootKey {
    /// Builds a root key from exactly 32 bytes of secret material.
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a root key from a byte slice, failing if the length is wrong.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey(<redacted>)")
    }
}

/// An ephemeral, single-use data encryption key.
///
/// Generated fresh for every value, used once to seal it, then wrapped
/// under a [`RootKey`] and scrubbed from memory.
#[derive(ZeroizeOnDrop)]
struct Dek([u8; KEY_LEN]);

impl Dek {
    fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    fn from_bytes(mut bytes: [u8; KEY_LEN]) -> Self {
        let dek = Self(bytes);
        bytes.zeroize();
        dek
    }
}

/// Holds every root key generation TeamVault still has data encrypted
/// under, plus a pointer to the generation newly sealed values use.
///
/// Rotating the root key means minting a new generation and advancing
/// `current_generation`; older generations are retained so existing
/// `SecretVersion`/`Lease`/`Webhook` rows can still be opened.
pub struct RootKeyRing {
    keys: HashMap<i32, RootKey>,
    current_generation: i32,
}

impl RootKeyRing {
    /// Builds a ring with a single generation, numbered `0`.
    pub fn single(key: RootKey) -> Self {
        let mut keys = HashMap::new();
        keys.insert(0, key);
        Self {
            keys,
            current_generation: 0,
        }
    }

    /// Builds a ring from explicit (generation, key) pairs.
    ///
    /// Panics if `generations` does not contain `current_generation`.
    pub fn new(generations: HashMap<i32, RootKey>, current_generation: i32) -> Self {
        assert!(
            generations.contains_key(&current_generation),
            "current_generation must be present in the supplied key set"
        );
        Self {
            keys: generations,
            current_generation,
        }
    }

    /// The generation newly sealed values are wrapped under.
    pub fn current_generation(&self) -> i32 {
        self.current_generation
    }

    /// Adds a new generation and makes it current. Older generations are
    /// retained so previously sealed values remain decryptable.
    pub fn rotate_in(&mut self, generation: i32, key: RootKey) {
        self.keys.insert(generation, key);
        self.current_generation = generation;
    }

    fn get(&self, generation: i32) -> Result<&RootKey, CryptoError> {
        self.keys
            .get(&generation)
            .ok_or(CryptoError::UnknownKeyGeneration(generation))
    }
}

/// The envelope-encrypted form of a value, as persisted.
#[derive(Debug, Clone)]
pub struct SealedValue {
    /// AEAD ciphertext of the plaintext, sealed under the DEK.
    pub ciphertext: Vec<u8>,
    /// Nonce used for the ciphertext seal.
    pub nonce: Vec<u8>,
    /// The DEK, itself sealed under the root key.
    pub wrapped_dek: Vec<u8>,
    /// Nonce used for the DEK seal.
    pub wrapped_dek_nonce: Vec<u8>,
    /// Root key generation the DEK was wrapped under.
    pub root_key_generation: i32,
}

/// Seals and opens values using envelope encryption over a [`RootKeyRing`].
pub struct CryptoEngine {
    ring: RootKeyRing,
}

impl CryptoEngine {
    /// Builds an engine over the given key ring.
    pub fn new(ring: RootKeyRing) -> Self {
        Self { ring }
    }

    /// Mutable access to the underlying ring, e.g. to rotate in a new
    /// generation.
    pub fn ring_mut(&mut self) -> &mut RootKeyRing {
        &mut self.ring
    }

    /// Seals `plaintext` under a fresh DEK, itself wrapped under the
    /// current root key generation.
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedValue, CryptoError> {
        let dek = Dek::generate();
        let (ciphertext, nonce) = aes_gcm_encrypt(&dek.0, plaintext)?;

        let root_key = self.ring.get(self.ring.current_generation)?;
        let (wrapped_dek, wrapped_dek_nonce) = aes_gcm_encrypt(&root_key.0, &dek.0)?;

        Ok(SealedValue {
            ciphertext,
            nonce,
            wrapped_dek,
            wrapped_dek_nonce,
            root_key_generation: self.ring.current_generation,
        })
    }

    /// Opens a previously sealed value, unwrapping its DEK under the
    /// root key generation it was wrapped with.
    pub fn open(&self, sealed: &SealedValue) -> Result<Vec<u8>, CryptoError> {
        let root_key = self.ring.get(sealed.root_key_generation)?;
        let dek_bytes: Zeroizing<Vec<u8>> = Zeroizing::new(aes_gcm_decrypt(
            &root_key.0,
            &sealed.wrapped_dek,
            &sealed.wrapped_dek_nonce,
        )?);
        let dek_arr: [u8; KEY_LEN] = match dek_bytes.as_slice().try_into() {
            Ok(arr) => arr,
            Err(_) => return Err(CryptoError::DecryptionFailed),
        };
        let dek = Dek::from_bytes(dek_arr);

        aes_gcm_decrypt(&dek.0, &sealed.ciphertext, &sealed.nonce)
    }
}

fn aes_gcm_encrypt(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok((ciphertext, nonce_bytes.to_vec()))
}

fn aes_gcm_decrypt(key: &[u8; KEY_LEN], ciphertext: &[u8], nonce: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> CryptoEngine {
        CryptoEngine::new(RootKeyRing::single(RootKey::from_bytes([7u8; KEY_LEN])))
    }

    #[test]
    fn seal_then_open_round_trips() {
        let engine = engine();
        let sealed = engine.seal(b"s3cr3t-value").unwrap();
        let opened = engine.open(&sealed).unwrap();
        assert_eq!(opened, b"s3cr3t-value");
    }

    #[test]
    fn each_seal_uses_a_distinct_dek_and_nonce() {
        let engine = engine();
        let a = engine.seal(b"same plaintext").unwrap();
        let b = engine.seal(b"same plaintext").unwrap();
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.wrapped_dek, b.wrapped_dek);
        assert_ne!(a.nonce, b.nonce);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let engine = engine();
        let mut sealed = engine.seal(b"data").unwrap();
        let last = sealed.ciphertext.len() - 1;
        sealed.ciphertext[last] ^= 0xFF;
        assert!(matches!(engine.open(&sealed), Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn unknown_generation_is_rejected() {
        let engine = engine();
        let mut sealed = engine.seal(b"data").unwrap();
        sealed.root_key_generation = 99;
        assert!(matches!(
            engine.open(&sealed),
            Err(CryptoError::UnknownKeyGeneration(99))
        ));
    }

    #[test]
    fn rotation_keeps_old_generations_decryptable() {
        let mut engine = engine();
        let sealed_under_gen0 = engine.seal(b"before rotation").unwrap();

        engine
            .ring_mut()
            .rotate_in(1, RootKey::from_bytes([9u8; KEY_LEN]));
        let sealed_under_gen1 = engine.seal(b"after rotation").unwrap();

        assert_eq!(sealed_under_gen1.root_key_generation, 1);
        assert_eq!(engine.open(&sealed_under_gen0).unwrap(), b"before rotation");
        assert_eq!(engine.open(&sealed_under_gen1).unwrap(), b"after rotation");
    }
}
