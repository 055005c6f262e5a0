//! Per-pair message encryption.
//!
//! `PairCipher` owns the local long-term keypair and derives a stable
//! secret for each remote identity: HKDF-SHA256 over the static-static
//! Diffie-Hellman output, with the info string bound to the sorted key
//! pair so both sides derive the same secret without negotiation.
//! Derived secrets are cached per remote key; derivation never touches
//! the network.

use crate::crypto::aead;
use crate::crypto::keys::{StaticKeypair, X25519PublicKey};
use crate::crypto::hkdf_derive;
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroizing;

/// HKDF info prefix binding derived secrets to this protocol.
const PAIR_SECRET_INFO: &[u8] = b"fluxchat pair secret v1";

/// Encrypts and decrypts message bodies for one local identity.
pub struct PairCipher {
    keypair: StaticKeypair,
    // Derivation is deterministic, so cache entries never invalidate.
    cache: Mutex<HashMap<X25519PublicKey, [u8; aead::KEY_SIZE]>>,
}

impl PairCipher {
    /// Create a cipher for the given local keypair.
    pub fn new(keypair: StaticKeypair) -> Self {
        Self {
            keypair,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The local public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        self.keypair.public_key()
    }

    /// Derive (or fetch from cache) the pair secret for a remote key.
    pub fn derive_secret(&self, remote: &X25519PublicKey) -> Result<[u8; aead::KEY_SIZE]> {
        {
            let cache = self
                .cache
                .lock()
                .map_err(|_| Error::Crypto("cache lock poisoned".into()))?;
            if let Some(secret) = cache.get(remote) {
                return Ok(*secret);
            }
        }

        let shared = self.keypair.diffie_hellman(remote);

        // Sort the two public keys so both peers derive with identical info.
        let mut keys = [self.keypair.public_key().to_hex(), remote.to_hex()];
        keys.sort();
        let mut info = Vec::from(PAIR_SECRET_INFO);
        info.extend_from_slice(keys[0].as_bytes());
        info.extend_from_slice(keys[1].as_bytes());

        let derived = hkdf_derive(None, shared.as_bytes(), &info, aead::KEY_SIZE)?;
        let secret: [u8; aead::KEY_SIZE] = derived[..]
            .try_into()
            .map_err(|_| Error::Crypto("bad derived length".into()))?;

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| Error::Crypto("cache lock poisoned".into()))?;
        cache.insert(remote.clone(), secret);

        Ok(secret)
    }

    /// Encrypt a message body for a remote identity.
    ///
    /// Returns base64 of `nonce || ciphertext || tag`, suitable for
    /// storing in the `ciphertext` field of a message record.
    pub fn seal(&self, plaintext: &str, remote: &X25519PublicKey) -> Result<String> {
        let secret = self.derive_secret(remote)?;
        let sealed = aead::encrypt_with_random_nonce(&secret, plaintext.as_bytes())?;
        Ok(BASE64.encode(sealed))
    }

    /// Decrypt a message body from a remote identity.
    ///
    /// Fails with [`Error::Decryption`] on corrupt or foreign-keyed
    /// input, including bodies that were never encrypted.
    pub fn open(&self, ciphertext: &str, remote: &X25519PublicKey) -> Result<String> {
        let secret = self.derive_secret(remote)?;
        let sealed = BASE64.decode(ciphertext).map_err(|_| Error::Decryption)?;
        let plaintext = aead::decrypt_with_prepended_nonce(&secret, &sealed)?;
        let plaintext = Zeroizing::new(
            String::from_utf8(plaintext.to_vec()).map_err(|_| Error::Decryption)?,
        );
        Ok(plaintext.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher_pair() -> (PairCipher, PairCipher) {
        (
            PairCipher::new(StaticKeypair::generate()),
            PairCipher::new(StaticKeypair::generate()),
        )
    }

    #[test]
    fn test_both_sides_derive_same_secret() {
        let (alice, bob) = cipher_pair();

        let a = alice.derive_secret(bob.public_key()).expect("derive");
        let b = bob.derive_secret(alice.public_key()).expect("derive");

        assert_eq!(a, b);
    }

    #[test]
    fn test_derivation_is_cached_and_stable() {
        let (alice, bob) = cipher_pair();

        let first = alice.derive_secret(bob.public_key()).expect("derive");
        let second = alice.derive_secret(bob.public_key()).expect("derive");

        assert_eq!(first, second);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (alice, bob) = cipher_pair();

        let sealed = alice.seal("hi Bob", bob.public_key()).expect("seal");
        assert_ne!(sealed, "hi Bob");

        let opened = bob.open(&sealed, alice.public_key()).expect("open");
        assert_eq!(opened, "hi Bob");
    }

    #[test]
    fn test_foreign_key_fails() {
        let (alice, bob) = cipher_pair();
        let mallory = PairCipher::new(StaticKeypair::generate());

        let sealed = alice.seal("for Bob only", bob.public_key()).expect("seal");
        assert!(matches!(
            mallory.open(&sealed, alice.public_key()),
            Err(Error::Decryption)
        ));
    }

    #[test]
    fn test_plaintext_input_fails_open() {
        let (alice, bob) = cipher_pair();
        // A body that was sent with the plaintext fallback is not valid
        // base64-sealed input and must surface as a decryption failure.
        assert!(matches!(
            bob.open("just plain text", alice.public_key()),
            Err(Error::Decryption)
        ));
    }
}
