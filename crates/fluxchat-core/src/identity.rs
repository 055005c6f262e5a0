//! Identities, friendships, and conversation id derivation.
//!
//! An identity key is the hex-encoded X25519 public key; it doubles as
//! the path component identifying a user in the shared store. The
//! conversation id between two identities is a pure function of the two
//! keys, so both peers always agree on it without negotiation.

use crate::crypto::X25519PublicKey;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identifier for a user: the hex-encoded public key.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Wrap a hex-encoded key string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The key of a public key.
    pub fn from_public(public: &X25519PublicKey) -> Self {
        Self(public.to_hex())
    }

    /// The underlying hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse back into the public key, if well-formed.
    pub fn to_public(&self) -> Option<X25519PublicKey> {
        X25519PublicKey::from_hex(&self.0)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", crate::logging::RedactedKey(&self.0))
    }
}

/// A user: stable public key plus display alias. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identity key.
    pub key: IdentityKey,
    /// Display alias.
    pub alias: String,
}

/// An accepted friendship edge with one peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    /// The peer's identity key.
    pub peer: IdentityKey,
    /// The peer's display alias.
    pub alias: String,
    /// Deterministic conversation id shared with the peer.
    pub conversation_id: String,
    /// The peer's encryption public key, when known. Absent keys force
    /// the plaintext send fallback.
    pub encryption_key: Option<X25519PublicKey>,
}

impl Friendship {
    /// Create a friendship edge between the local identity and a peer.
    pub fn new(
        local: &IdentityKey,
        peer: IdentityKey,
        alias: impl Into<String>,
        encryption_key: Option<X25519PublicKey>,
    ) -> Self {
        let conversation_id = conversation_id(local, &peer);
        Self {
            peer,
            alias: alias.into(),
            conversation_id,
            encryption_key,
        }
    }
}

/// The authenticated user's friendship set, shared across components.
pub type FriendSet = std::sync::Arc<std::sync::RwLock<std::collections::HashMap<IdentityKey, Friendship>>>;

/// Derive the conversation id for a pair of identities.
///
/// Sorts the two keys and joins them, so both sides compute the same id
/// independently.
pub fn conversation_id(a: &IdentityKey, b: &IdentityKey) -> String {
    let mut keys = [a.as_str(), b.as_str()];
    keys.sort();
    format!("{}|{}", keys[0], keys[1])
}
