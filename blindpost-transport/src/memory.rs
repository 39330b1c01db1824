//! In-process anonymous network.
//!
//! Models the parts of a mixnet the protocol depends on: endpoints are
//! addressable, anonymous senders are identified to the receiver only by an
//! opaque sender tag, and each tag is backed by a pool of single-use reply
//! blocks that senders top up by attaching them to their messages.

use std::sync::Arc;

use async_trait::async_trait;
use blindpost_core::{Address, Destination, ReplyHandle};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::adapter::{Inbound, Transport};
use crate::error::TransportError;

#[derive(Debug)]
struct ReplyPool {
    owner: Address,
    remaining: u32,
}

#[derive(Debug, Default)]
struct NetworkInner {
    mailboxes: DashMap<Address, mpsc::UnboundedSender<Inbound>>,
    pools: DashMap<ReplyHandle, ReplyPool>,
}

/// A shared in-memory network. Clone to share.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `address`.
    pub fn join(&self, address: &str) -> Result<MemoryTransport, TransportError> {
        let address = Address::new(address)?;
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.mailboxes.insert(address.clone(), tx).is_some() {
            debug!(%address, "endpoint replaced");
        }

        let mut raw = [0u8; 16];
        OsRng.fill_bytes(&mut raw);
        Ok(MemoryTransport {
            network: Arc::clone(&self.inner),
            address,
            tag: ReplyHandle::new(hex::encode(raw)),
            inbox: Mutex::new(rx),
        })
    }

    /// Reply blocks left behind `tag`.
    pub fn remaining_replies(&self, tag: &ReplyHandle) -> u32 {
        self.inner.pools.get(tag).map_or(0, |p| p.remaining)
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: Arc<NetworkInner>,
    address: Address,
    tag: ReplyHandle,
    inbox: Mutex<mpsc::UnboundedReceiver<Inbound>>,
}

impl MemoryTransport {
    /// The sender tag receivers see for our anonymous sends.
    pub fn sender_tag(&self) -> &ReplyHandle {
        &self.tag
    }

    fn deliver(&self, to: &Address, inbound: Inbound) -> Result<(), TransportError> {
        let mailbox = self
            .network
            .mailboxes
            .get(to)
            .ok_or(TransportError::Unreachable)?;
        mailbox.send(inbound).map_err(|_| TransportError::Unreachable)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(
        &self,
        payload: Vec<u8>,
        destination: Destination,
        reply_budget: u32,
    ) -> Result<(), TransportError> {
        match destination {
            Destination::Address(to) => {
                let reply = if reply_budget > 0 {
                    let mut pool = self
                        .network
                        .pools
                        .entry(self.tag.clone())
                        .or_insert_with(|| ReplyPool {
                            owner: self.address.clone(),
                            remaining: 0,
                        });
                    pool.remaining = pool.remaining.saturating_add(reply_budget);
                    drop(pool);
                    Some(self.tag.clone())
                } else {
                    None
                };
                self.deliver(&to, Inbound { payload, reply })
            }
            Destination::Reply(tag) => {
                let owner = {
                    let mut pool = self
                        .network
                        .pools
                        .get_mut(&tag)
                        .ok_or(TransportError::ReplyHandleExhausted)?;
                    if pool.remaining == 0 {
                        return Err(TransportError::ReplyHandleExhausted);
                    }
                    pool.remaining -= 1;
                    pool.owner.clone()
                };
                self.deliver(&owner, Inbound { payload, reply: None })
            }
        }
    }

    async fn receive(&self) -> Result<Inbound, TransportError> {
        self.inbox.lock().await.recv().await.ok_or(TransportError::Closed)
    }

    fn address(&self) -> &Address {
        &self.address
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.network.mailboxes.remove(&self.address);
    }
}
