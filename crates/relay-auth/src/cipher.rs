//! Authenticated encryption for secrets kept at rest.
//!
//! Tokens are `base64(nonce || ciphertext || tag)` produced by AES-256-GCM with a
//! key derived from an operator secret via SHA-256. A fresh random nonce is drawn
//! for every call to [`TokenCipher::encrypt`].

use std::fmt;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::rand_core::RngCore as _;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use tracing::info;

const NONCE_BYTES: usize = 12;
const GENERATED_KEY_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("encryption key material has invalid length")]
    InvalidKey,
    #[error("payload encryption failed")]
    Encrypt,
    #[error("ciphertext is malformed: {0}")]
    Malformed(&'static str),
    #[error("ciphertext failed integrity check")]
    Authentication,
}

impl CipherError {
    /// True for the failures a caller sees when decrypting a bad token.
    pub fn is_decrypt_error(&self) -> bool {
        matches!(self, CipherError::Malformed(_) | CipherError::Authentication)
    }
}

#[derive(Clone)]
pub struct TokenCipher {
    aead: Aes256Gcm,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher").finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Derive the cipher key from an operator secret of any length.
    pub fn new(secret: &str) -> Result<Self, CipherError> {
        let digest = Sha256::digest(secret.as_bytes());
        let aead = Aes256Gcm::new_from_slice(&digest).map_err(|_| CipherError::InvalidKey)?;
        Ok(Self { aead })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut payload = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(BASE64_STANDARD.encode(payload))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, CipherError> {
        let raw = BASE64_STANDARD
            .decode(token.trim())
            .map_err(|_| CipherError::Malformed("invalid base64"))?;
        if raw.len() < NONCE_BYTES {
            return Err(CipherError::Malformed("payload is truncated"));
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_BYTES);
        let plaintext = self
            .aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Authentication)?;
        String::from_utf8(plaintext).map_err(|_| CipherError::Malformed("payload is not valid UTF-8"))
    }
}

/// Hex string of `len` random bytes from the OS RNG.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Pick the encryption secret: an explicit key wins, otherwise the key file is
/// read, and generated when absent or blank.
pub fn resolve_encryption_secret(explicit: Option<&str>, key_path: &Path) -> Result<String> {
    if let Some(key) = explicit.map(str::trim).filter(|key| !key.is_empty()) {
        return Ok(key.to_string());
    }
    ensure_key_file(key_path)
}

/// Read the key file, writing a fresh hex-encoded key first if needed.
pub fn ensure_key_file(path: &Path) -> Result<String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create key directory {}", parent.display()))?;
    }

    match std::fs::read_to_string(path) {
        Ok(existing) => {
            let key = existing.trim();
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read key file {}", path.display()));
        }
    }

    let key = random_hex(GENERATED_KEY_BYTES);
    write_private_file(path, key.as_bytes())
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    info!(path = %path.display(), "generated integrations encryption key");
    Ok(key)
}

fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
