//! Error types for the fluxchat engine.
//!
//! The taxonomy separates failures that must reach the caller
//! (identity and authorization problems) from failures the engine
//! absorbs internally by falling back to the durable inbox or by
//! retrying on the next poll cycle.

use thiserror::Error;

/// Core error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// No local identity session; fatal to the calling operation.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The recipient has no friendship record. Surfaced, never retried.
    #[error("recipient is not a friend")]
    NotFriend(String),

    /// Direct handshake or send exceeded its bound. Recovered locally
    /// by falling back to the offline inbox.
    #[error("direct transport timed out")]
    TransportTimeout,

    /// Direct transport failed for a reason other than a timeout.
    #[error("transport error")]
    Transport(String),

    /// Shared store read/write failed. Retried by the next poll cycle.
    #[error("shared store unavailable")]
    StoreUnavailable(String),

    /// Payload could not be decrypted with the expected pair secret.
    /// The raw ciphertext is surfaced as best-effort content, flagged.
    #[error("decryption failed")]
    Decryption,

    /// Cryptographic operation failed. Details are intentionally vague.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Message from a sender with no friendship record. Dropped with a
    /// log entry, never surfaced to the conversation view.
    #[error("message from untrusted sender")]
    UntrustedSender(String),

    /// Local persistence or bookkeeping failed.
    #[error("storage error")]
    Storage(String),

    /// Encoding/decoding error.
    #[error("encoding error")]
    Encoding(String),
}

/// Result type alias using the engine's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error is surfaced to the caller.
    ///
    /// Transport and store failures are absorbed internally (inbox
    /// fallback, poll-cycle retry); identity and authorization failures
    /// always reach the caller.
    pub fn is_surfaced(&self) -> bool {
        matches!(self, Error::NotAuthenticated | Error::NotFriend(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surfaced_split() {
        assert!(Error::NotAuthenticated.is_surfaced());
        assert!(Error::NotFriend("abcd".into()).is_surfaced());
        assert!(!Error::TransportTimeout.is_surfaced());
        assert!(!Error::StoreUnavailable("offline".into()).is_surfaced());
        assert!(!Error::UntrustedSender("abcd".into()).is_surfaced());
    }

    #[test]
    fn test_display_is_generic() {
        let e = Error::Crypto("chacha20 rejected nonce".into());
        assert_eq!(e.to_string(), "cryptographic operation failed");
    }
}
