//! Async participant client.
//!
//! Drives a [`PeerSession`] over a [`Transport`]. Pull-based: the application
//! calls [`Client::next_event`] in a loop. Anything that arrives while an
//! operation waits for its directory reply is queued, not lost.
//!
//! Every wait is bounded. A registration or login that times out cancels its
//! challenge at the directory before returning.

use std::collections::VecDeque;

use blindpost_core::wire::open_directory_reply;
use blindpost_core::{
    Address, ChallengePurpose, Destination, Handle, IdentityKeypair, Outgoing, PeerSession,
    ProtocolError, PublicKey, Received, Route, WireMessage,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapter::{Inbound, Transport};
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::message::Message;

/// Something the application should know about.
#[derive(Debug)]
pub enum Event {
    /// Verified, decrypted chat text.
    Message {
        /// Authenticated sender.
        from: Handle,
        /// Plaintext.
        message: Message,
    },
    /// A peer disclosed its direct address.
    Handshake {
        /// Authenticated sender.
        from: Handle,
        /// Disclosed address.
        address: Address,
        /// Whether the conversation is now direct.
        promoted: bool,
    },
    /// The directory's verdict on one of our relayed envelopes.
    DeliveryReport {
        /// Addressee.
        recipient: Handle,
        /// Whether it was forwarded.
        delivered: bool,
    },
}

enum Incoming {
    Directory(WireMessage),
    Event(Event),
}

/// A participant.
pub struct Client<T> {
    transport: T,
    session: PeerSession,
    config: ClientConfig,
    pending: VecDeque<Event>,
}

impl<T: Transport> Client<T> {
    /// Build a client for `handle` with `identity`.
    pub fn new(transport: T, handle: Handle, identity: IdentityKeypair, config: ClientConfig) -> Self {
        let session = PeerSession::new(handle, identity, config.policy);
        Self {
            transport,
            session,
            config,
            pending: VecDeque::new(),
        }
    }

    /// Protocol state.
    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Configuration in force.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Claim our handle at the directory.
    pub async fn register(&mut self) -> Result<(), TransportError> {
        let request = self.session.register_request()?;
        self.challenge_flow(request, ChallengePurpose::Register).await?;
        info!(handle = %self.session.handle(), "registered");
        Ok(())
    }

    /// Prove possession of our handle and refresh our reply handle.
    pub async fn login(&mut self) -> Result<(), TransportError> {
        let request = self.session.login_request()?;
        self.challenge_flow(request, ChallengePurpose::Login).await?;
        info!(handle = %self.session.handle(), "logged in");
        Ok(())
    }

    /// Ask the directory for `peer`'s key. Caches it when found.
    pub async fn lookup(&mut self, peer: &Handle) -> Result<Option<PublicKey>, TransportError> {
        let request = self.session.lookup_request(peer)?;
        self.to_directory(request).await?;
        let reply = self
            .await_directory(|m| matches!(m, WireMessage::LookupResult { .. }))
            .await?;
        let WireMessage::LookupResult { public_key } = reply else {
            return Err(ProtocolError::UnexpectedMessage.into());
        };
        if let Some(key) = public_key {
            if !self.session.learn_key(peer, key) {
                warn!(peer = %peer, "directory key differs from the pinned direct peer key");
            }
        }
        debug!(peer = %peer, found = public_key.is_some(), "lookup result");
        Ok(public_key)
    }

    /// Send chat text to `peer`, looking its key up first if needed.
    pub async fn send_text(&mut self, peer: &Handle, text: &str) -> Result<(), TransportError> {
        self.ensure_key(peer).await?;
        let outgoing = self.session.seal_text(peer, text)?;
        self.dispatch(outgoing).await
    }

    /// Disclose our direct address to `peer`.
    ///
    /// The handshake counts as sent only once the transport accepted it.
    pub async fn initiate_handshake(&mut self, peer: &Handle) -> Result<(), TransportError> {
        self.ensure_key(peer).await?;
        let address = self.transport.address().clone();
        let outgoing = self.session.seal_handshake(peer, address)?;
        self.dispatch(outgoing).await?;
        if self.session.mark_handshake_sent(peer) {
            debug!(peer = %peer, "handshake sent, conversation is direct");
        }
        Ok(())
    }

    /// Stop relaying traffic for `peer`.
    pub fn promote_to_direct(&self, peer: &Handle) -> Result<(), TransportError> {
        Ok(self.session.promote_to_direct(peer)?)
    }

    /// Next event, bounded by `receive_timeout`.
    pub async fn next_event(&mut self) -> Result<Event, TransportError> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        let wait = self.config.receive_timeout;
        timeout(wait, async {
            loop {
                let inbound = self.transport.receive().await?;
                match self.classify(inbound) {
                    Some(Incoming::Event(event)) => return Ok::<_, TransportError>(event),
                    Some(Incoming::Directory(stray)) => {
                        debug!(kind = ?stray.kind(), "dropping unsolicited directory reply");
                    }
                    None => {}
                }
            }
        })
        .await?
    }

    async fn ensure_key(&mut self, peer: &Handle) -> Result<(), TransportError> {
        if self.session.peer_key(peer).is_some() {
            return Ok(());
        }
        match self.lookup(peer).await? {
            Some(_) => Ok(()),
            None => Err(ProtocolError::UnknownRecipient.into()),
        }
    }

    async fn challenge_flow(
        &mut self,
        request: Vec<u8>,
        purpose: ChallengePurpose,
    ) -> Result<(), TransportError> {
        let outcome = self.challenge_exchange(request, purpose).await;
        if matches!(outcome, Err(TransportError::Timeout)) {
            // Best effort. The directory purges it on expiry anyway.
            match self.session.cancel_request() {
                Ok(cancel) => {
                    if let Err(e) = self.to_directory(cancel).await {
                        warn!(error = %e, "failed to cancel challenge");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode cancel"),
            }
        }
        outcome
    }

    async fn challenge_exchange(
        &mut self,
        request: Vec<u8>,
        purpose: ChallengePurpose,
    ) -> Result<(), TransportError> {
        let is_result = move |m: &WireMessage| match purpose {
            ChallengePurpose::Register => matches!(m, WireMessage::RegisterResult { .. }),
            ChallengePurpose::Login => matches!(m, WireMessage::LoginResult { .. }),
        };

        self.to_directory(request).await?;
        let nonce = match self
            .await_directory(|m| matches!(m, WireMessage::Challenge { .. }) || is_result(m))
            .await?
        {
            WireMessage::Challenge { nonce } => nonce,
            // Refused before a challenge was issued.
            _ => return Err(TransportError::Rejected),
        };

        let confirm = self.session.answer_challenge(purpose, &nonce)?;
        self.to_directory(confirm).await?;
        match self.await_directory(is_result).await? {
            WireMessage::RegisterResult { ok: true } | WireMessage::LoginResult { ok: true } => {
                Ok(())
            }
            _ => Err(TransportError::Rejected),
        }
    }

    /// Wait for a directory reply that satisfies `accept`, queueing events.
    async fn await_directory(
        &mut self,
        accept: impl Fn(&WireMessage) -> bool,
    ) -> Result<WireMessage, TransportError> {
        let wait = self.config.request_timeout;
        timeout(wait, async {
            loop {
                let inbound = self.transport.receive().await?;
                match self.classify(inbound) {
                    Some(Incoming::Directory(msg)) if accept(&msg) => {
                        return Ok::<_, TransportError>(msg)
                    }
                    Some(Incoming::Directory(stale)) => {
                        debug!(kind = ?stale.kind(), "dropping stale directory reply");
                    }
                    Some(Incoming::Event(event)) => self.pending.push_back(event),
                    None => {}
                }
            }
        })
        .await?
    }

    /// Authenticate and sort one inbound payload. `None` means dropped.
    fn classify(&self, inbound: Inbound) -> Option<Incoming> {
        let msg = match WireMessage::decode(&inbound.payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "dropping undecodable payload");
                return None;
            }
        };

        let reply = match msg {
            WireMessage::DirectoryReply { body, signature } => {
                match open_directory_reply(&body, &signature, self.config.directory_key.as_ref()) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(error = %e, "dropping unauthenticated directory reply");
                        return None;
                    }
                }
            }
            direct @ WireMessage::MessageEnvelope(_) => return self.open_peer(&direct),
            other => {
                debug!(kind = ?other.kind(), "dropping unexpected message");
                return None;
            }
        };

        match reply {
            WireMessage::Deliver { .. } => self.open_peer(&reply),
            WireMessage::RelayResult {
                recipient_handle,
                delivered,
            } => {
                if !delivered {
                    self.session.delivery_failed(&recipient_handle);
                }
                Some(Incoming::Event(Event::DeliveryReport {
                    recipient: recipient_handle,
                    delivered,
                }))
            }
            other => Some(Incoming::Directory(other)),
        }
    }

    fn open_peer(&self, msg: &WireMessage) -> Option<Incoming> {
        match self.session.receive(msg) {
            Ok(Received::Message { from, text }) => Some(Incoming::Event(Event::Message {
                from,
                message: Message::new(text),
            })),
            Ok(Received::Handshake {
                from,
                address,
                promoted,
            }) => Some(Incoming::Event(Event::Handshake {
                from,
                address,
                promoted,
            })),
            Err(e) => {
                // Fail closed. Never answered.
                debug!(error = %e, "dropping peer message");
                None
            }
        }
    }

    async fn to_directory(&self, payload: Vec<u8>) -> Result<(), TransportError> {
        self.transport
            .send(
                payload,
                Destination::Address(self.config.directory.clone()),
                self.config.reply_budget,
            )
            .await
    }

    async fn dispatch(&self, outgoing: Outgoing) -> Result<(), TransportError> {
        match outgoing.route {
            Route::Directory => self.to_directory(outgoing.payload).await,
            Route::Direct(address) => {
                self.transport
                    .send(outgoing.payload, Destination::Address(address), 0)
                    .await
            }
        }
    }
}

impl<T> std::fmt::Debug for Client<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("pending", &self.pending.len())
            .finish()
    }
}
