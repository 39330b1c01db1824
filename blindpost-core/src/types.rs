//! Handles and transport endpoint tokens.

use std::fmt;

use crate::error::ProtocolError;

/// Maximum handle length in bytes.
pub const MAX_HANDLE_LENGTH: usize = 64;

/// Maximum length of a direct transport address disclosed in a handshake.
pub const MAX_ADDRESS_LENGTH: usize = 512;

/// A short human-chosen identifier bound to a long-term public key.
///
/// Always 1..=64 characters from `[A-Za-z0-9_-]`. Validation happens at
/// construction; a `Handle` in hand is always valid.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(String);

impl Handle {
    /// Validate and wrap a handle.
    pub fn new(handle: impl Into<String>) -> Result<Self, ProtocolError> {
        let handle = handle.into();
        if handle.is_empty() || handle.len() > MAX_HANDLE_LENGTH {
            return Err(ProtocolError::InvalidHandle);
        }
        let allowed = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if !handle.chars().all(allowed) {
            return Err(ProtocolError::InvalidHandle);
        }
        Ok(Self(handle))
    }

    /// Borrow as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

impl std::str::FromStr for Handle {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Opaque token that lets the holder deliver anonymous replies to whoever
/// attached it, without learning their network address.
///
/// The core never looks inside. Transports decide what the string means.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReplyHandle(String);

impl ReplyHandle {
    /// Wrap a transport-specific tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Borrow the raw tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tags identify a sender to the transport. Keep logs short.
        let shown: String = self.0.chars().take(8).collect();
        write!(f, "ReplyHandle({shown}..)")
    }
}

/// A directly addressable transport endpoint.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Wrap a transport address. Rejects empty or oversized addresses.
    pub fn new(address: impl Into<String>) -> Result<Self, ProtocolError> {
        let address = address.into();
        if address.is_empty() || address.len() > MAX_ADDRESS_LENGTH || address.contains('\0') {
            return Err(ProtocolError::Malformed("address"));
        }
        Ok(Self(address))
    }

    /// Borrow the raw address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

/// Where a payload goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// A known transport address.
    Address(Address),
    /// An anonymous reply handle.
    Reply(ReplyHandle),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_charset() {
        assert!(Handle::new("alice").is_ok());
        assert!(Handle::new("Bob_the-2nd").is_ok());
        assert_eq!(Handle::new(""), Err(ProtocolError::InvalidHandle));
        assert_eq!(Handle::new("al ice"), Err(ProtocolError::InvalidHandle));
        assert_eq!(Handle::new("alice!"), Err(ProtocolError::InvalidHandle));
        assert_eq!(Handle::new("ålice"), Err(ProtocolError::InvalidHandle));
    }

    #[test]
    fn test_handle_length() {
        assert!(Handle::new("a".repeat(MAX_HANDLE_LENGTH)).is_ok());
        assert_eq!(
            Handle::new("a".repeat(MAX_HANDLE_LENGTH + 1)),
            Err(ProtocolError::InvalidHandle)
        );
    }

    #[test]
    fn test_address_bounds() {
        assert!(Address::new("client.gateway@mix").is_ok());
        assert!(Address::new("").is_err());
        assert!(Address::new("x".repeat(MAX_ADDRESS_LENGTH + 1)).is_err());
    }
}
