//! Protocol errors.
//!
//! Every failure maps onto one of four classes. The class decides what the
//! engines do with it: drop silently, reply with an explicit failure, or
//! surface it to the local caller. Display strings are deliberately terse so
//! that nothing about key material or verification internals leaks.

use thiserror::Error;

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unparseable input. Dropped, never acknowledged.
    Protocol,
    /// A signature or AEAD check failed.
    Authentication,
    /// Unknown handle, recipient or sender key.
    NotFound,
    /// Duplicate registration, missing or consumed challenge, incomplete handshake.
    State,
    /// Store or primitive failure that is not the peer's fault.
    Internal,
}

/// All possible protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    // --- Protocol ---
    /// Encoded message exceeds the wire limit.
    #[error("message too large")]
    MessageTooLarge,

    /// Input ended before all fields were read.
    #[error("message truncated")]
    Truncated,

    /// Bytes remained after the last field.
    #[error("trailing bytes")]
    TrailingBytes,

    /// Version byte is not ours.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Kind byte does not name a message.
    #[error("unknown message kind 0x{0:02x}")]
    UnknownMessageKind(u8),

    /// A field violated its encoding or presence rule.
    #[error("malformed {0}")]
    Malformed(&'static str),

    /// Handle is empty, too long, or contains forbidden characters.
    #[error("invalid handle")]
    InvalidHandle,

    /// Bytes do not encode a valid public key.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Well-formed message that is not valid in this context.
    #[error("unexpected message")]
    UnexpectedMessage,

    /// Plaintext is empty.
    #[error("empty plaintext")]
    EmptyPlaintext,

    /// Plaintext exceeds the maximum size.
    #[error("plaintext too large")]
    PlaintextTooLarge,

    /// Plaintext is not valid UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,

    /// Plaintext contains a NUL byte.
    #[error("nul byte in plaintext")]
    NulByteInPlaintext,

    // --- Authentication ---
    /// Signature did not verify.
    #[error("bad signature")]
    BadSignature,

    /// AEAD open failed or the key agreement was degenerate.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Relay: the claimed sender handle is not registered.
    #[error("unknown sender")]
    UnknownSender,

    /// Receive: no inner sender identity and no cached key for the conversation.
    #[error("unknown inner sender")]
    UnknownInnerSender,

    /// Introduced identity disagrees with the authenticated sender or the cached key.
    #[error("sender mismatch")]
    SenderMismatch,

    /// Inner payload was already accepted once.
    #[error("replayed message")]
    Replay,

    /// Direct envelope from a peer we never disclosed our address to.
    #[error("unsolicited direct message")]
    UnsolicitedDirect,

    // --- Not found ---
    /// Relay: the recipient handle is not registered.
    #[error("recipient not found")]
    RecipientNotFound,

    /// Send: no public key cached for the peer.
    #[error("unknown recipient")]
    UnknownRecipient,

    /// Login: the handle is not registered.
    #[error("handle not found")]
    HandleNotFound,

    // --- State ---
    /// Register: the handle is already claimed.
    #[error("already registered")]
    AlreadyRegistered,

    /// Register or login: a live challenge for the handle is already outstanding.
    #[error("challenge pending")]
    ChallengePending,

    /// Confirm: no live challenge for the handle (absent, expired, or consumed).
    #[error("no pending challenge")]
    NoPendingChallenge,

    /// Direct mode requires a handshake both sent and received.
    #[error("handshake incomplete")]
    HandshakeIncomplete,

    // --- Internal ---
    /// Backing store failed.
    #[error("store error: {0}")]
    Store(String),

    /// A primitive failed unexpectedly.
    #[error("internal error")]
    Internal,
}

impl ProtocolError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MessageTooLarge
            | Self::Truncated
            | Self::TrailingBytes
            | Self::UnsupportedVersion(_)
            | Self::UnknownMessageKind(_)
            | Self::Malformed(_)
            | Self::InvalidHandle
            | Self::InvalidPublicKey
            | Self::UnexpectedMessage
            | Self::EmptyPlaintext
            | Self::PlaintextTooLarge
            | Self::InvalidUtf8
            | Self::NulByteInPlaintext => ErrorClass::Protocol,

            Self::BadSignature
            | Self::DecryptionFailed
            | Self::UnknownSender
            | Self::UnknownInnerSender
            | Self::SenderMismatch
            | Self::Replay
            | Self::UnsolicitedDirect => ErrorClass::Authentication,

            Self::RecipientNotFound | Self::UnknownRecipient | Self::HandleNotFound => {
                ErrorClass::NotFound
            }

            Self::AlreadyRegistered
            | Self::ChallengePending
            | Self::NoPendingChallenge
            | Self::HandshakeIncomplete => ErrorClass::State,

            Self::Store(_) | Self::Internal => ErrorClass::Internal,
        }
    }
}

/// Failure inside an [`IdentityStore`](crate::store::IdentityStore) or
/// [`ChallengeStore`](crate::store::ChallengeStore) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl From<StoreError> for ProtocolError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.0)
    }
}
