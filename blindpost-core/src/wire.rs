//! Envelope codec.
//!
//! Wire format:
//! ```text
//! +-------------+----------+------------------+
//! | VERSION (1B)| KIND (1B)| FIELDS (N bytes) |
//! +-------------+----------+------------------+
//! ```
//!
//! Field encodings:
//! - handle: `u8` length + UTF-8
//! - bytes: `u16` BE length + raw
//! - key / nonce / signature: fixed width (32 / 32 / 64)
//! - bool: `0x00` or `0x01`, anything else is malformed
//!
//! Decoding is exhaustive and strict: unknown versions, unknown kinds,
//! presence-rule violations and trailing bytes are all errors. Nothing is
//! guessed.

use zeroize::Zeroizing;

use crate::crypto::{
    PublicKey, Signature, CHALLENGE_NONCE_LENGTH, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH,
};
use crate::error::ProtocolError;
use crate::types::{Address, Handle, MAX_HANDLE_LENGTH};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Maximum encoded message length.
pub const MAX_WIRE_LENGTH: usize = 16384;

/// Maximum text plaintext length.
pub const MAX_PLAINTEXT_LENGTH: usize = 4000;

const REGISTER_LABEL: &[u8] = b"blindpost/v1/register";
const LOGIN_LABEL: &[u8] = b"blindpost/v1/login";
const INNER_LABEL: &[u8] = b"blindpost/v1/inner";
const OUTER_LABEL: &[u8] = b"blindpost/v1/outer";
const REPLY_LABEL: &[u8] = b"blindpost/v1/reply";

/// Inner payload flag: sender identity is included.
const FLAG_SENDER_INTRO: u8 = 0x01;

/// Message kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Claim a handle.
    RegisterRequest = 0x01,
    /// Nonce to sign.
    Challenge = 0x02,
    /// Signed registration nonce.
    RegisterConfirm = 0x03,
    /// Registration outcome.
    RegisterResult = 0x04,
    /// Ask for a handle's key.
    LookupRequest = 0x05,
    /// Lookup outcome.
    LookupResult = 0x06,
    /// Dual-signed peer message.
    MessageEnvelope = 0x07,
    /// Relayed inner payload.
    Deliver = 0x08,
    /// Relay outcome, to the sender only.
    RelayResult = 0x09,
    /// Prove possession of a registered handle.
    LoginRequest = 0x0A,
    /// Signed login nonce.
    LoginConfirm = 0x0B,
    /// Login outcome.
    LoginResult = 0x0C,
    /// Abandon an outstanding challenge.
    RegisterCancel = 0x0D,
    /// Directory-signed wrapper around any directory reply.
    DirectoryReply = 0x0E,
}

impl MessageKind {
    /// Parse kind from byte. No fallback.
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x01 => Ok(Self::RegisterRequest),
            0x02 => Ok(Self::Challenge),
            0x03 => Ok(Self::RegisterConfirm),
            0x04 => Ok(Self::RegisterResult),
            0x05 => Ok(Self::LookupRequest),
            0x06 => Ok(Self::LookupResult),
            0x07 => Ok(Self::MessageEnvelope),
            0x08 => Ok(Self::Deliver),
            0x09 => Ok(Self::RelayResult),
            0x0A => Ok(Self::LoginRequest),
            0x0B => Ok(Self::LoginConfirm),
            0x0C => Ok(Self::LoginResult),
            0x0D => Ok(Self::RegisterCancel),
            0x0E => Ok(Self::DirectoryReply),
            other => Err(ProtocolError::UnknownMessageKind(other)),
        }
    }

    /// Convert to byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Identity disclosed on the first message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderIntro {
    /// Sender's handle.
    pub handle: Handle,
    /// Sender's long-term key.
    pub public_key: PublicKey,
}

/// The end-to-end layer. Opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerPayload {
    /// Present only on the first message to a peer.
    pub sender: Option<SenderIntro>,
    /// Per-message X25519 public key.
    pub ephemeral_public_key: [u8; 32],
    /// `nonce || sealed` under the derived message key.
    pub ciphertext: Vec<u8>,
    /// Sender's signature over everything above.
    pub inner_signature: Signature,
}

impl InnerPayload {
    /// Bytes covered by `inner_signature`.
    pub fn signing_input(
        sender: Option<&SenderIntro>,
        ephemeral_public_key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::raw(INNER_LABEL);
        write_inner_unsigned(&mut w, sender, ephemeral_public_key, ciphertext)?;
        Ok(w.into_inner())
    }

    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::raw(&[]);
        write_inner_unsigned(
            &mut w,
            self.sender.as_ref(),
            &self.ephemeral_public_key,
            &self.ciphertext,
        )?;
        w.fixed(self.inner_signature.as_bytes());
        w.finish()
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_WIRE_LENGTH {
            return Err(ProtocolError::MessageTooLarge);
        }
        let mut r = Reader::new(bytes);
        let sender = match r.u8()? {
            0x00 => None,
            FLAG_SENDER_INTRO => Some(SenderIntro {
                handle: r.handle()?,
                public_key: r.public_key()?,
            }),
            _ => return Err(ProtocolError::Malformed("inner flags")),
        };
        let ephemeral_public_key = r.fixed::<32>()?;
        let ciphertext = r.bytes()?.to_vec();
        let inner_signature = Signature::from_bytes(r.fixed::<SIGNATURE_LENGTH>()?);
        r.finish()?;
        Ok(Self {
            sender,
            ephemeral_public_key,
            ciphertext,
            inner_signature,
        })
    }
}

fn write_inner_unsigned(
    w: &mut Writer,
    sender: Option<&SenderIntro>,
    ephemeral_public_key: &[u8; 32],
    ciphertext: &[u8],
) -> Result<(), ProtocolError> {
    match sender {
        Some(intro) => {
            w.u8(FLAG_SENDER_INTRO);
            w.handle(&intro.handle);
            w.fixed(intro.public_key.as_bytes());
        }
        None => w.u8(0x00),
    }
    w.fixed(ephemeral_public_key);
    w.bytes(ciphertext)
}

/// The relay layer: authenticates the sender to the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Claimed sender. The relay verifies `outer_signature` against its record.
    pub sender_handle: Handle,
    /// Addressee.
    pub recipient_handle: Handle,
    /// Encoded [`InnerPayload`], forwarded verbatim.
    pub inner_payload: Vec<u8>,
    /// Sender's signature over sender, recipient and inner payload.
    pub outer_signature: Signature,
}

impl MessageEnvelope {
    /// Bytes covered by `outer_signature`.
    pub fn signing_input(
        sender_handle: &Handle,
        recipient_handle: &Handle,
        inner_payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::raw(OUTER_LABEL);
        w.handle(sender_handle);
        w.handle(recipient_handle);
        w.bytes(inner_payload)?;
        Ok(w.into_inner())
    }
}

/// Every message that crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Claim `handle` for `public_key`.
    RegisterRequest {
        /// Candidate handle.
        handle: Handle,
        /// Key to bind.
        public_key: PublicKey,
    },
    /// Nonce the requester must sign.
    Challenge {
        /// Fresh random nonce.
        nonce: [u8; CHALLENGE_NONCE_LENGTH],
    },
    /// Answer to a registration challenge.
    RegisterConfirm {
        /// Handle being registered.
        handle: Handle,
        /// Signature over the registration signing input.
        signature: Signature,
    },
    /// Registration outcome.
    RegisterResult {
        /// Whether the handle is now bound.
        ok: bool,
    },
    /// Ask for the key bound to `handle`.
    LookupRequest {
        /// Target handle.
        handle: Handle,
    },
    /// Lookup outcome. `found` on the wire is `public_key.is_some()`.
    LookupResult {
        /// Key when found.
        public_key: Option<PublicKey>,
    },
    /// Dual-signed peer message, sent to the relay or directly to a peer.
    MessageEnvelope(MessageEnvelope),
    /// Relay to recipient: inner payload plus the relay-authenticated sender.
    Deliver {
        /// Sender as authenticated by the relay.
        sender_handle: Handle,
        /// Encoded [`InnerPayload`].
        inner_payload: Vec<u8>,
    },
    /// Relay to sender: delivery outcome.
    RelayResult {
        /// Addressee of the relayed envelope.
        recipient_handle: Handle,
        /// Whether the envelope was forwarded.
        delivered: bool,
    },
    /// Prove possession of `handle`.
    LoginRequest {
        /// Registered handle.
        handle: Handle,
    },
    /// Answer to a login challenge.
    LoginConfirm {
        /// Handle logging in.
        handle: Handle,
        /// Signature over the login signing input.
        signature: Signature,
    },
    /// Login outcome.
    LoginResult {
        /// Whether the login succeeded.
        ok: bool,
    },
    /// Drop the outstanding challenge for `handle`.
    RegisterCancel {
        /// Handle whose challenge to drop.
        handle: Handle,
    },
    /// Directory-signed reply.
    DirectoryReply {
        /// An encoded message (never itself a `DirectoryReply`).
        body: Vec<u8>,
        /// Directory's signature over the body.
        signature: Signature,
    },
}

impl WireMessage {
    /// Kind discriminator.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::RegisterRequest { .. } => MessageKind::RegisterRequest,
            Self::Challenge { .. } => MessageKind::Challenge,
            Self::RegisterConfirm { .. } => MessageKind::RegisterConfirm,
            Self::RegisterResult { .. } => MessageKind::RegisterResult,
            Self::LookupRequest { .. } => MessageKind::LookupRequest,
            Self::LookupResult { .. } => MessageKind::LookupResult,
            Self::MessageEnvelope(_) => MessageKind::MessageEnvelope,
            Self::Deliver { .. } => MessageKind::Deliver,
            Self::RelayResult { .. } => MessageKind::RelayResult,
            Self::LoginRequest { .. } => MessageKind::LoginRequest,
            Self::LoginConfirm { .. } => MessageKind::LoginConfirm,
            Self::LoginResult { .. } => MessageKind::LoginResult,
            Self::RegisterCancel { .. } => MessageKind::RegisterCancel,
            Self::DirectoryReply { .. } => MessageKind::DirectoryReply,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut w = Writer::message(self.kind());
        match self {
            Self::RegisterRequest { handle, public_key } => {
                w.handle(handle);
                w.fixed(public_key.as_bytes());
            }
            Self::Challenge { nonce } => w.fixed(nonce),
            Self::RegisterConfirm { handle, signature }
            | Self::LoginConfirm { handle, signature } => {
                w.handle(handle);
                w.fixed(signature.as_bytes());
            }
            Self::RegisterResult { ok } | Self::LoginResult { ok } => w.bool(*ok),
            Self::LookupRequest { handle }
            | Self::LoginRequest { handle }
            | Self::RegisterCancel { handle } => w.handle(handle),
            Self::LookupResult { public_key } => {
                w.bool(public_key.is_some());
                if let Some(pk) = public_key {
                    w.fixed(pk.as_bytes());
                }
            }
            Self::MessageEnvelope(env) => {
                w.handle(&env.sender_handle);
                w.handle(&env.recipient_handle);
                w.bytes(&env.inner_payload)?;
                w.fixed(env.outer_signature.as_bytes());
            }
            Self::Deliver {
                sender_handle,
                inner_payload,
            } => {
                w.handle(sender_handle);
                w.bytes(inner_payload)?;
            }
            Self::RelayResult {
                recipient_handle,
                delivered,
            } => {
                w.handle(recipient_handle);
                w.bool(*delivered);
            }
            Self::DirectoryReply { body, signature } => {
                w.bytes(body)?;
                w.fixed(signature.as_bytes());
            }
        }
        w.finish()
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_WIRE_LENGTH {
            return Err(ProtocolError::MessageTooLarge);
        }
        let mut r = Reader::new(bytes);
        let version = r.u8()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let kind = MessageKind::from_byte(r.u8()?)?;

        let msg = match kind {
            MessageKind::RegisterRequest => Self::RegisterRequest {
                handle: r.handle()?,
                public_key: r.public_key()?,
            },
            MessageKind::Challenge => Self::Challenge {
                nonce: r.fixed::<CHALLENGE_NONCE_LENGTH>()?,
            },
            MessageKind::RegisterConfirm => Self::RegisterConfirm {
                handle: r.handle()?,
                signature: r.signature()?,
            },
            MessageKind::RegisterResult => Self::RegisterResult { ok: r.bool()? },
            MessageKind::LookupRequest => Self::LookupRequest { handle: r.handle()? },
            MessageKind::LookupResult => {
                let public_key = if r.bool()? {
                    Some(r.public_key()?)
                } else {
                    None
                };
                Self::LookupResult { public_key }
            }
            MessageKind::MessageEnvelope => Self::MessageEnvelope(MessageEnvelope {
                sender_handle: r.handle()?,
                recipient_handle: r.handle()?,
                inner_payload: r.bytes()?.to_vec(),
                outer_signature: r.signature()?,
            }),
            MessageKind::Deliver => Self::Deliver {
                sender_handle: r.handle()?,
                inner_payload: r.bytes()?.to_vec(),
            },
            MessageKind::RelayResult => Self::RelayResult {
                recipient_handle: r.handle()?,
                delivered: r.bool()?,
            },
            MessageKind::LoginRequest => Self::LoginRequest { handle: r.handle()? },
            MessageKind::LoginConfirm => Self::LoginConfirm {
                handle: r.handle()?,
                signature: r.signature()?,
            },
            MessageKind::LoginResult => Self::LoginResult { ok: r.bool()? },
            MessageKind::RegisterCancel => Self::RegisterCancel { handle: r.handle()? },
            MessageKind::DirectoryReply => Self::DirectoryReply {
                body: r.bytes()?.to_vec(),
                signature: r.signature()?,
            },
        };
        r.finish()?;
        Ok(msg)
    }

    /// Wrap an encoded reply body in a signed `DirectoryReply`.
    pub fn directory_reply(
        body: &WireMessage,
        sign: impl FnOnce(&[u8]) -> Signature,
    ) -> Result<Self, ProtocolError> {
        if matches!(body, Self::DirectoryReply { .. }) {
            return Err(ProtocolError::Malformed("nested directory reply"));
        }
        let body = body.encode()?;
        let signature = sign(&reply_signing_input(&body));
        Ok(Self::DirectoryReply { body, signature })
    }
}

/// Bytes the directory signs for a `DirectoryReply` body.
pub fn reply_signing_input(body: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(REPLY_LABEL.len() + body.len());
    input.extend_from_slice(REPLY_LABEL);
    input.extend_from_slice(body);
    input
}

/// Unwrap a `DirectoryReply`, verifying it first when `directory_key` is pinned.
pub fn open_directory_reply(
    body: &[u8],
    signature: &Signature,
    directory_key: Option<&PublicKey>,
) -> Result<WireMessage, ProtocolError> {
    if let Some(key) = directory_key {
        crate::crypto::verify(key, &reply_signing_input(body), signature)?;
    }
    let inner = WireMessage::decode(body)?;
    if matches!(inner, WireMessage::DirectoryReply { .. }) {
        return Err(ProtocolError::Malformed("nested directory reply"));
    }
    Ok(inner)
}

/// Bytes a registrant signs to answer a registration challenge.
pub fn register_signing_input(handle: &Handle, nonce: &[u8; CHALLENGE_NONCE_LENGTH]) -> Vec<u8> {
    challenge_signing_input(REGISTER_LABEL, handle, nonce)
}

/// Bytes a user signs to answer a login challenge.
pub fn login_signing_input(handle: &Handle, nonce: &[u8; CHALLENGE_NONCE_LENGTH]) -> Vec<u8> {
    challenge_signing_input(LOGIN_LABEL, handle, nonce)
}

fn challenge_signing_input(label: &[u8], handle: &Handle, nonce: &[u8]) -> Vec<u8> {
    let mut w = Writer::raw(label);
    w.handle(handle);
    w.fixed(nonce);
    w.into_inner()
}

/// Decrypted content of an inner payload.
///
/// Text and handshake bodies share one envelope shape; only the recipient
/// can tell them apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Chat text.
    Text(Zeroizing<String>),
    /// Direct transport address disclosed by a handshake.
    Handshake(Address),
}

impl Body {
    const TEXT: u8 = 0x00;
    const HANDSHAKE: u8 = 0x01;

    /// Encode for sealing.
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let (kind, bytes) = match self {
            Self::Text(text) => (Self::TEXT, text.as_bytes()),
            Self::Handshake(address) => (Self::HANDSHAKE, address.as_str().as_bytes()),
        };
        let mut out = Zeroizing::new(Vec::with_capacity(1 + bytes.len()));
        out.push(kind);
        out.extend_from_slice(bytes);
        out
    }

    /// Decode and validate an opened plaintext.
    pub fn decode(plaintext: &[u8]) -> Result<Self, ProtocolError> {
        let (&kind, rest) = plaintext
            .split_first()
            .ok_or(ProtocolError::EmptyPlaintext)?;
        match kind {
            Self::TEXT => {
                let text = validate_plaintext(rest)?;
                Ok(Self::Text(Zeroizing::new(text.to_owned())))
            }
            Self::HANDSHAKE => {
                let address = std::str::from_utf8(rest).map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Self::Handshake(Address::new(address)?))
            }
            _ => Err(ProtocolError::Malformed("body kind")),
        }
    }
}

/// Validate chat text.
///
/// # Errors
///
/// Returns error if:
/// - Text is empty
/// - Text exceeds MAX_PLAINTEXT_LENGTH
/// - Text contains a NUL byte
/// - Text is not valid UTF-8
pub fn validate_plaintext(plaintext: &[u8]) -> Result<&str, ProtocolError> {
    if plaintext.is_empty() {
        return Err(ProtocolError::EmptyPlaintext);
    }
    if plaintext.len() > MAX_PLAINTEXT_LENGTH {
        return Err(ProtocolError::PlaintextTooLarge);
    }
    if plaintext.contains(&0x00) {
        return Err(ProtocolError::NulByteInPlaintext);
    }
    std::str::from_utf8(plaintext).map_err(|_| ProtocolError::InvalidUtf8)
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn message(kind: MessageKind) -> Self {
        Self {
            buf: vec![PROTOCOL_VERSION, kind.to_byte()],
        }
    }

    fn raw(prefix: &[u8]) -> Self {
        Self {
            buf: prefix.to_vec(),
        }
    }

    fn u8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    fn fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn handle(&mut self, handle: &Handle) {
        let raw = handle.as_str().as_bytes();
        // Handle::new caps length at MAX_HANDLE_LENGTH, well under u8::MAX.
        debug_assert!(raw.len() <= MAX_HANDLE_LENGTH);
        #[allow(clippy::cast_possible_truncation)]
        self.buf.push(raw.len() as u8);
        self.buf.extend_from_slice(raw);
    }

    fn bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::MessageTooLarge)?;
        self.buf.extend_from_slice(&len.to_be_bytes());
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn finish(self) -> Result<Vec<u8>, ProtocolError> {
        if self.buf.len() > MAX_WIRE_LENGTH {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(self.buf)
    }

    fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < n {
            return Err(ProtocolError::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        match self.u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            _ => Err(ProtocolError::Malformed("bool")),
        }
    }

    fn fixed<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn handle(&mut self) -> Result<Handle, ProtocolError> {
        let len = usize::from(self.u8()?);
        let raw = self.take(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidHandle)?;
        Handle::new(s)
    }

    fn public_key(&mut self) -> Result<PublicKey, ProtocolError> {
        PublicKey::from_bytes(&self.fixed::<PUBLIC_KEY_LENGTH>()?)
    }

    fn signature(&mut self) -> Result<Signature, ProtocolError> {
        Ok(Signature::from_bytes(self.fixed::<SIGNATURE_LENGTH>()?))
    }

    fn bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = u16::from_be_bytes(self.fixed::<2>()?);
        self.take(usize::from(len))
    }

    fn finish(self) -> Result<(), ProtocolError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeypair;

    fn handle(s: &str) -> Handle {
        Handle::new(s).unwrap()
    }

    #[test]
    fn test_message_kind_roundtrip() {
        for byte in 0x01..=0x0E {
            let kind = MessageKind::from_byte(byte).unwrap();
            assert_eq!(kind.to_byte(), byte);
        }
    }

    #[test]
    fn test_unknown_message_kind() {
        assert_eq!(
            MessageKind::from_byte(0x00),
            Err(ProtocolError::UnknownMessageKind(0x00))
        );
        assert_eq!(
            MessageKind::from_byte(0x0F),
            Err(ProtocolError::UnknownMessageKind(0x0F))
        );
    }

    #[test]
    fn test_register_request_layout() {
        let pk = IdentityKeypair::generate().public_key();
        let wire = WireMessage::RegisterRequest {
            handle: handle("alice"),
            public_key: pk,
        }
        .encode()
        .unwrap();
        assert_eq!(&wire[..3], &[PROTOCOL_VERSION, 0x01, 5]);
        assert_eq!(&wire[3..8], b"alice");
        assert_eq!(&wire[8..], pk.as_bytes());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = WireMessage::MessageEnvelope(MessageEnvelope {
            sender_handle: handle("alice"),
            recipient_handle: handle("bob"),
            inner_payload: vec![7; 300],
            outer_signature: Signature::from_bytes([3; 64]),
        });
        let wire = msg.encode().unwrap();
        assert_eq!(WireMessage::decode(&wire).unwrap(), msg);
    }

    #[test]
    fn test_inner_payload_roundtrip() {
        let pk = IdentityKeypair::generate().public_key();
        let inner = InnerPayload {
            sender: Some(SenderIntro {
                handle: handle("alice"),
                public_key: pk,
            }),
            ephemeral_public_key: [9; 32],
            ciphertext: vec![1, 2, 3],
            inner_signature: Signature::from_bytes([5; 64]),
        };
        let bytes = inner.encode().unwrap();
        assert_eq!(InnerPayload::decode(&bytes).unwrap(), inner);

        let anonymous = InnerPayload {
            sender: None,
            ..inner
        };
        let bytes = anonymous.encode().unwrap();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(InnerPayload::decode(&bytes).unwrap(), anonymous);
    }

    #[test]
    fn test_inner_bad_flags() {
        let mut bytes = InnerPayload {
            sender: None,
            ephemeral_public_key: [9; 32],
            ciphertext: vec![1],
            inner_signature: Signature::from_bytes([5; 64]),
        }
        .encode()
        .unwrap();
        bytes[0] = 0x02;
        assert_eq!(
            InnerPayload::decode(&bytes),
            Err(ProtocolError::Malformed("inner flags"))
        );
    }

    #[test]
    fn test_lookup_result_presence() {
        let found = WireMessage::LookupResult {
            public_key: Some(IdentityKeypair::generate().public_key()),
        };
        let wire = found.encode().unwrap();
        assert_eq!(WireMessage::decode(&wire).unwrap(), found);

        let missing = WireMessage::LookupResult { public_key: None }
            .encode()
            .unwrap();
        assert_eq!(missing, vec![PROTOCOL_VERSION, 0x06, 0x00]);

        // found=false followed by a key
        let mut bad = missing.clone();
        bad.extend_from_slice(&[1; 32]);
        assert_eq!(WireMessage::decode(&bad), Err(ProtocolError::TrailingBytes));

        // found=true without a key
        assert_eq!(
            WireMessage::decode(&[PROTOCOL_VERSION, 0x06, 0x01]),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn test_bool_strict() {
        assert_eq!(
            WireMessage::decode(&[PROTOCOL_VERSION, 0x04, 0x02]),
            Err(ProtocolError::Malformed("bool"))
        );
    }

    #[test]
    fn test_bad_version() {
        assert_eq!(
            WireMessage::decode(&[0x02, 0x04, 0x01]),
            Err(ProtocolError::UnsupportedVersion(0x02))
        );
    }

    #[test]
    fn test_empty_and_truncated() {
        assert_eq!(WireMessage::decode(&[]), Err(ProtocolError::Truncated));
        assert_eq!(
            WireMessage::decode(&[PROTOCOL_VERSION, 0x05, 5, b'a']),
            Err(ProtocolError::Truncated)
        );
    }

    #[test]
    fn test_invalid_handle_on_wire() {
        assert_eq!(
            WireMessage::decode(&[PROTOCOL_VERSION, 0x05, 2, b'a', b' ']),
            Err(ProtocolError::InvalidHandle)
        );
        assert_eq!(
            WireMessage::decode(&[PROTOCOL_VERSION, 0x05, 0]),
            Err(ProtocolError::InvalidHandle)
        );
    }

    #[test]
    fn test_oversized_rejected() {
        let msg = WireMessage::Deliver {
            sender_handle: handle("a"),
            inner_payload: vec![0; MAX_WIRE_LENGTH],
        };
        assert_eq!(msg.encode(), Err(ProtocolError::MessageTooLarge));
        assert_eq!(
            WireMessage::decode(&vec![PROTOCOL_VERSION; MAX_WIRE_LENGTH + 1]),
            Err(ProtocolError::MessageTooLarge)
        );
    }

    #[test]
    fn test_directory_reply_wraps_and_signs() {
        let directory = IdentityKeypair::generate();
        let body = WireMessage::RegisterResult { ok: true };
        let reply = WireMessage::directory_reply(&body, |m| directory.sign(m)).unwrap();
        let WireMessage::DirectoryReply { body: raw, signature } = &reply else {
            panic!("expected directory reply");
        };
        assert!(crate::crypto::verify(
            &directory.public_key(),
            &reply_signing_input(raw),
            signature
        )
        .is_ok());
        assert_eq!(WireMessage::decode(raw).unwrap(), body);

        assert!(WireMessage::directory_reply(&reply, |m| directory.sign(m)).is_err());

        let pinned = directory.public_key();
        assert_eq!(open_directory_reply(raw, signature, Some(&pinned)).unwrap(), body);

        let forger = IdentityKeypair::generate();
        let forged = forger.sign(&reply_signing_input(raw));
        assert_eq!(
            open_directory_reply(raw, &forged, Some(&pinned)),
            Err(ProtocolError::BadSignature)
        );
        // Unpinned clients accept whatever is well-formed.
        assert!(open_directory_reply(raw, &forged, None).is_ok());
    }

    #[test]
    fn test_signing_inputs_are_domain_separated() {
        let h = handle("alice");
        let nonce = [4u8; 32];
        assert_ne!(
            register_signing_input(&h, &nonce),
            login_signing_input(&h, &nonce)
        );
    }

    #[test]
    fn test_body_kinds() {
        let text = Body::Text(Zeroizing::new("hi".to_string()));
        assert_eq!(Body::decode(&text.encode()).unwrap(), text);

        let hs = Body::Handshake(Address::new("client@gateway").unwrap());
        assert_eq!(Body::decode(&hs.encode()).unwrap(), hs);

        assert_eq!(Body::decode(&[]), Err(ProtocolError::EmptyPlaintext));
        assert_eq!(Body::decode(&[0x00]), Err(ProtocolError::EmptyPlaintext));
        assert_eq!(
            Body::decode(&[0x07, b'x']),
            Err(ProtocolError::Malformed("body kind"))
        );
    }

    #[test]
    fn test_validate_plaintext() {
        assert_eq!(validate_plaintext(b"Hello"), Ok("Hello"));
        assert_eq!(
            validate_plaintext(&[0x48, 0x00, 0x49]),
            Err(ProtocolError::NulByteInPlaintext)
        );
        assert_eq!(
            validate_plaintext(&[0xFF, 0xFE]),
            Err(ProtocolError::InvalidUtf8)
        );
        assert_eq!(
            validate_plaintext(&vec![b'a'; MAX_PLAINTEXT_LENGTH + 1]),
            Err(ProtocolError::PlaintextTooLarge)
        );
    }
}
