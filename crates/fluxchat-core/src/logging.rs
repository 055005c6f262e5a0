//! Logging helpers with automatic sensitive data redaction.
//!
//! Public keys are pseudonymous but long; secrets must never appear in
//! log output at all. These wrappers give tracing call sites a safe
//! `Display` for both cases.

use std::fmt;

/// A wrapper that redacts its contents entirely when displayed.
pub struct Redacted<T>(pub T);

impl<T: fmt::Display> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: fmt::Debug> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Abbreviate a hex-encoded identity key, showing first and last 4 chars.
pub struct RedactedKey<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedKey<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 12 {
            write!(f, "{}..{}", &s[..4], &s[s.len() - 4..])
        } else {
            write!(f, "[KEY]")
        }
    }
}

impl<'a> fmt::Debug for RedactedKey<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a byte slice, showing only its length.
pub struct RedactedBytes<'a>(pub &'a [u8]);

impl<'a> fmt::Display for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedBytes<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_display() {
        assert_eq!(format!("{}", Redacted("pair secret")), "[REDACTED]");
    }

    #[test]
    fn test_redacted_key() {
        let key = "a1b2c3d4e5f60718293a4b5c6d7e8f90";
        let shown = format!("{}", RedactedKey(key));
        assert_eq!(shown, "a1b2..8f90");
    }

    #[test]
    fn test_short_key_fully_hidden() {
        assert_eq!(format!("{}", RedactedKey("abcd")), "[KEY]");
    }

    #[test]
    fn test_redacted_bytes() {
        assert_eq!(format!("{}", RedactedBytes(&[0u8; 7])), "[7 bytes]");
    }
}
