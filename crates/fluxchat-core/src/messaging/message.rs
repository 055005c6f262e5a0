//! Message records and view models.
//!
//! `StoredMessage` is the persisted/wire shape shared by both replicas
//! and the direct transport; its field names are wire-exact. The
//! decrypted `ChatMessage` is what history reads hand to the UI.

use crate::identity::IdentityKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Globally unique identifier for a message.
///
/// Random 16 bytes, hex-encoded on the wire. Stable across every
/// replica a message appears in; history dedup keys on it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; 16]);

impl MessageId {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Parse from the wire hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 16] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Hex form used in store paths and record fields.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for MessageId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid message id"))
    }
}

/// Generate a random message id.
pub fn generate_message_id() -> MessageId {
    MessageId(crate::crypto::random_bytes::<16>())
}

/// How a message reached (or is reaching) its recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMethod {
    /// Delivered over the direct transport.
    Direct,
    /// Parked in the durable relay inbox.
    Relay,
    /// Only recorded locally (e.g. a note to self).
    Local,
}

/// A message record as persisted in the store and sent on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Unique, stable identifier.
    pub id: MessageId,
    /// Deterministic conversation id.
    pub conversation_id: String,
    /// Sender identity key.
    pub from: IdentityKey,
    /// Recipient identity key.
    pub to: IdentityKey,
    /// Send time, Unix milliseconds.
    pub timestamp_ms: i64,
    /// Encrypted body; plaintext when the pair key was unavailable.
    pub ciphertext: String,
    /// Delivery path taken at send time.
    pub delivery_method: DeliveryMethod,
    /// Flipped to true on confirmed receipt; never unset.
    pub delivered: bool,
}

/// A decrypted message view handed to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    /// Unique identifier.
    pub id: MessageId,
    /// Conversation id.
    pub conversation_id: String,
    /// Sender identity key.
    pub from: IdentityKey,
    /// Recipient identity key.
    pub to: IdentityKey,
    /// Send time, Unix milliseconds.
    pub timestamp_ms: i64,
    /// Decrypted body, or the raw ciphertext when decryption failed.
    pub text: String,
    /// Delivery path.
    pub delivery_method: DeliveryMethod,
    /// Whether receipt has been confirmed.
    pub delivered: bool,
    /// True when the message arrived via the offline inbox. Only set on
    /// views built at redelivery time; the stored record does not carry
    /// the flag, so history reads report `false`.
    pub was_offline: bool,
    /// True when the body could not be decrypted and `text` carries the
    /// raw ciphertext as best-effort content.
    pub undecryptable: bool,
}
