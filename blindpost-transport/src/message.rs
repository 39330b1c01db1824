//! Zeroizing message wrapper.
//!
//! Plaintext is short-lived by construction. Callers must opt-in to copying.

use zeroize::Zeroizing;

/// A received chat message that zeroizes on Drop.
///
/// This type does not implement `Clone` to prevent accidental plaintext duplication.
/// If you need to keep the text, use `into_string()` or copy explicitly.
pub struct Message(Zeroizing<String>);

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message({} bytes)", self.0.len())
    }
}

impl Message {
    pub(crate) fn new(text: Zeroizing<String>) -> Self {
        Self(text)
    }

    /// Message text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Message as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the message is empty. Never true for a delivered message.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy the text out. The internal buffer is still zeroized on drop.
    pub fn into_string(self) -> String {
        self.0.as_str().to_owned()
    }
}

// Explicitly NOT implementing Clone to prevent plaintext duplication
