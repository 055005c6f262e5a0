//! Authenticated encryption using ChaCha20-Poly1305.
//!
//! Message bodies are encrypted with AEAD for confidentiality and
//! integrity. The nonce is random per message and travels prepended to
//! the ciphertext, which keeps the stored record self-contained.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce as ChaNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// A nonce for AEAD encryption. Must be unique per key; random nonces
/// are safe here given per-pair keys and low message volume.
#[derive(Clone, Copy, Debug)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a new random nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Encrypt plaintext, returning `ciphertext || tag`.
pub fn encrypt(key: &[u8; KEY_SIZE], nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(ChaNonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

/// Decrypt `ciphertext || tag`.
///
/// Returns a generic [`Error::Decryption`] on any failure to prevent
/// oracle attacks.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(ChaNonce::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| Error::Decryption)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt with a random nonce, prepending it to the output.
///
/// Output format: `nonce (12 bytes) || ciphertext || tag (16 bytes)`
pub fn encrypt_with_random_nonce(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let nonce = Nonce::random();
    let ciphertext = encrypt(key, &nonce, plaintext)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(nonce.as_bytes());
    output.extend_from_slice(&ciphertext);

    Ok(output)
}

/// Decrypt data produced by [`encrypt_with_random_nonce`].
pub fn decrypt_with_prepended_nonce(
    key: &[u8; KEY_SIZE],
    data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Decryption);
    }

    let nonce = Nonce::from_bytes(data[..NONCE_SIZE].try_into().map_err(|_| Error::Decryption)?);
    decrypt(key, &nonce, &data[NONCE_SIZE..])
}
