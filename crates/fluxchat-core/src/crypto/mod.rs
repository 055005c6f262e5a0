//! Cryptographic primitives for the engine.
//!
//! Well-audited primitives only:
//!
//! - **X25519**: static-static key exchange (pair secret)
//! - **ChaCha20-Poly1305**: authenticated encryption
//! - **HKDF-SHA256**: key derivation
//!
//! No custom cryptography, no unaudited primitives.

mod aead;
mod keys;
mod pair;

pub use aead::{
    decrypt, decrypt_with_prepended_nonce, encrypt, encrypt_with_random_nonce, Nonce, KEY_SIZE,
    NONCE_SIZE, TAG_SIZE,
};
pub use keys::{SharedSecret, StaticKeypair, X25519PublicKey, X25519_KEY_SIZE};
pub use pair::PairCipher;

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Derive keys using HKDF-SHA256.
pub fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_derive() {
        let ikm = b"input key material";
        let info = b"fluxchat key derivation";

        let out1 = hkdf_derive(Some(b"salt"), ikm, info, 32).expect("derive");
        assert_eq!(out1.len(), 32);

        // Deterministic
        let out2 = hkdf_derive(Some(b"salt"), ikm, info, 32).expect("derive");
        assert_eq!(&*out1, &*out2);

        // Different info -> different output
        let out3 = hkdf_derive(Some(b"salt"), ikm, b"different", 32).expect("derive");
        assert_ne!(&*out1, &*out3);
    }

    #[test]
    fn test_random_bytes() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }
}
