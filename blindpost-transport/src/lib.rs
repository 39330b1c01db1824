//! BlindPost Transport
//!
//! Async transport layer for BlindPost.
//!
//! This crate wraps `blindpost-core` and provides:
//! - The [`Transport`] adapter contract: send to an address or reply handle, receive with an optional reply handle
//! - [`MemoryNetwork`], an in-process anonymous network with single-use reply blocks
//! - [`NymClientTransport`], the Nym native-client websocket adapter
//! - [`Client`], a pull-based participant that registers, looks up and chats
//!
//! # Security Invariants & Hard Failures
//!
//! - **Bounded Waits**: Every wait for the directory or the network has a timeout.
//! - **Fail Closed**: Unverifiable peer messages and unsigned directory replies
//!   (with a pinned directory key) are dropped and never answered.
//! - **No Duplication**: `Client` and `Message` do not implement `Clone`.
//! - **Zeroization**: Received plaintext lives in zeroizing buffers.
//! - **Strict Framing**: One transport message = one wire message. No buffering.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod adapter;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod nym;

pub use adapter::{Inbound, Transport};
pub use client::{Client, Event};
pub use config::ClientConfig;
pub use error::TransportError;
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::Message;
pub use nym::NymClientTransport;
