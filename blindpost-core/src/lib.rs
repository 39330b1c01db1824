//! BlindPost Protocol Core
//!
//! Handle directory and secure relay protocol over an anonymous transport.
//!
//! This crate provides:
//! - Envelope codec with strict bounds checking
//! - Crypto adapter (Ed25519 identities, X25519 + HKDF + ChaCha20-Poly1305 sealing)
//! - Directory engine: registration challenge-response, login, lookup, relay
//! - Peer session engine: dual-signed envelopes, key learning, handshake promotion
//!
//! Nothing in here performs I/O. Engines take bytes and return bytes; the
//! transport crate moves them.
//!
//! # Security Invariants
//!
//! - A handle binds to a key only after the key signs a fresh, single-use nonce
//! - The relay forwards only envelopes whose outer signature verifies under the sender's record
//! - Recipients accept only inner payloads signed by the introduced or cached key
//! - Ephemeral keys are never reused; repeated ones are rejected as replays
//! - Failures are never acknowledged to unauthenticated peers
//! - Direct use of `unsafe` is forbidden (#![forbid(unsafe_code)])

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod crypto;
pub mod directory;
pub mod error;
pub mod session;
pub mod store;
pub mod types;
pub mod wire;

pub use crypto::{IdentityKeypair, PublicKey, Signature};
pub use directory::{Directory, DirectoryConfig, Outbound};
pub use error::{ErrorClass, ProtocolError, StoreError};
pub use session::{
    ConversationState, HandshakePolicy, Outgoing, PeerSession, Received, Route, TransportMode,
};
pub use store::{
    ChallengePurpose, ChallengeStore, IdentityRecord, IdentityStore, MemoryChallengeStore,
    MemoryIdentityStore,
};
pub use types::{Address, Destination, Handle, ReplyHandle};
pub use wire::{MessageEnvelope, WireMessage};
