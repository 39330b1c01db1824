//! Peer session engine.
//!
//! Per conversation: `Unknown → KeyDiscovered → Established`, plus an
//! independent handshake record that decides whether traffic goes through the
//! directory or straight to the peer.
//!
//! Crypto runs outside the conversation map's locks. The map is only touched
//! to snapshot state before sealing and to commit state after opening, so two
//! messages for the same new peer cannot both "learn" a key.

use std::collections::VecDeque;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{self, open_with, seal_to, IdentityKeypair, PublicKey, CHALLENGE_NONCE_LENGTH};
use crate::error::ProtocolError;
use crate::store::ChallengePurpose;
use crate::types::{Address, Handle};
use crate::wire::{
    login_signing_input, register_signing_input, validate_plaintext, Body, InnerPayload,
    MessageEnvelope, SenderIntro, WireMessage,
};

/// How many recent ephemeral keys each conversation remembers.
pub const REPLAY_WINDOW: usize = 256;

/// What to do once a handshake has been both sent and received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakePolicy {
    /// Leave promotion to the application.
    #[default]
    Manual,
    /// Switch to direct transport as soon as both directions are done.
    AutoPromote,
}

/// Where a conversation's traffic goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Through the directory.
    Relayed,
    /// Straight to the peer's disclosed address.
    Direct,
}

/// Key knowledge for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// No key for the peer.
    Unknown,
    /// Key known, nothing exchanged yet.
    KeyDiscovered,
    /// At least one message sealed to or verified from the peer.
    Established,
}

/// Client-local handshake progress for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Address the peer disclosed to us.
    pub direct_address: Option<Address>,
    /// We disclosed our address.
    pub sent: bool,
    /// The peer disclosed theirs.
    pub received: bool,
    /// Current routing.
    pub mode: TransportMode,
}

impl Default for HandshakeRecord {
    fn default() -> Self {
        Self {
            direct_address: None,
            sent: false,
            received: false,
            mode: TransportMode::Relayed,
        }
    }
}

#[derive(Debug, Default)]
struct Conversation {
    public_key: Option<PublicKey>,
    introduced: bool,
    established: bool,
    seen: VecDeque<[u8; 32]>,
    handshake: HandshakeRecord,
}

impl Conversation {
    fn state(&self) -> ConversationState {
        match (self.public_key, self.established) {
            (None, _) => ConversationState::Unknown,
            (Some(_), false) => ConversationState::KeyDiscovered,
            (Some(_), true) => ConversationState::Established,
        }
    }

    /// Record `ephemeral` as seen. Returns `false` if it already was.
    fn remember(&mut self, ephemeral: [u8; 32]) -> bool {
        if self.seen.contains(&ephemeral) {
            return false;
        }
        if self.seen.len() == REPLAY_WINDOW {
            self.seen.pop_front();
        }
        self.seen.push_back(ephemeral);
        true
    }
}

/// How an outgoing envelope must be routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Send to the directory for relay.
    Directory,
    /// Send straight to the peer.
    Direct(Address),
}

/// A sealed, dual-signed envelope ready for the transport.
#[derive(Debug, Clone)]
pub struct Outgoing {
    /// Routing decision taken at seal time.
    pub route: Route,
    /// Encoded `MessageEnvelope`.
    pub payload: Vec<u8>,
}

/// A verified, decrypted inbound message.
#[derive(Debug)]
pub enum Received {
    /// Chat text.
    Message {
        /// Authenticated sender.
        from: Handle,
        /// Plaintext, zeroized on drop.
        text: Zeroizing<String>,
    },
    /// The peer disclosed a direct address.
    Handshake {
        /// Authenticated sender.
        from: Handle,
        /// Disclosed address.
        address: Address,
        /// Whether this receipt switched the conversation to direct.
        promoted: bool,
    },
}

/// One participant's view of all its conversations.
pub struct PeerSession {
    handle: Handle,
    identity: IdentityKeypair,
    policy: HandshakePolicy,
    conversations: DashMap<Handle, Conversation>,
}

impl PeerSession {
    /// Build a session for `handle` backed by `identity`.
    pub fn new(handle: Handle, identity: IdentityKeypair, policy: HandshakePolicy) -> Self {
        Self {
            handle,
            identity,
            policy,
            conversations: DashMap::new(),
        }
    }

    /// Our handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Our long-term public key.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Handshake policy in force.
    pub fn policy(&self) -> HandshakePolicy {
        self.policy
    }

    // --- directory requests ---

    /// Encode a registration request for our handle and key.
    pub fn register_request(&self) -> Result<Vec<u8>, ProtocolError> {
        WireMessage::RegisterRequest {
            handle: self.handle.clone(),
            public_key: self.identity.public_key(),
        }
        .encode()
    }

    /// Encode a login request for our handle.
    pub fn login_request(&self) -> Result<Vec<u8>, ProtocolError> {
        WireMessage::LoginRequest {
            handle: self.handle.clone(),
        }
        .encode()
    }

    /// Encode a cancel for our outstanding challenge.
    pub fn cancel_request(&self) -> Result<Vec<u8>, ProtocolError> {
        WireMessage::RegisterCancel {
            handle: self.handle.clone(),
        }
        .encode()
    }

    /// Encode a key lookup for `target`.
    pub fn lookup_request(&self, target: &Handle) -> Result<Vec<u8>, ProtocolError> {
        WireMessage::LookupRequest {
            handle: target.clone(),
        }
        .encode()
    }

    /// Sign `nonce` and encode the confirm matching `purpose`.
    pub fn answer_challenge(
        &self,
        purpose: ChallengePurpose,
        nonce: &[u8; CHALLENGE_NONCE_LENGTH],
    ) -> Result<Vec<u8>, ProtocolError> {
        let handle = self.handle.clone();
        let msg = match purpose {
            ChallengePurpose::Register => WireMessage::RegisterConfirm {
                signature: self.identity.sign(&register_signing_input(&handle, nonce)),
                handle,
            },
            ChallengePurpose::Login => WireMessage::LoginConfirm {
                signature: self.identity.sign(&login_signing_input(&handle, nonce)),
                handle,
            },
        };
        msg.encode()
    }

    // --- conversations ---

    /// Cache `public_key` for `peer`, typically from a lookup.
    ///
    /// A changed key resets a relayed conversation. A direct conversation
    /// keeps its pinned key and the change is refused. Returns whether
    /// `public_key` is now the cached key.
    pub fn learn_key(&self, peer: &Handle, public_key: PublicKey) -> bool {
        let mut conv = self.conversations.entry(peer.clone()).or_default();
        match conv.public_key {
            Some(known) if known == public_key => true,
            Some(_) if conv.handshake.mode == TransportMode::Direct => {
                warn!(peer = %peer, key = %public_key.fingerprint(), "refusing key change for direct peer");
                false
            }
            Some(_) => {
                warn!(peer = %peer, key = %public_key.fingerprint(), "peer key changed");
                *conv = Conversation {
                    public_key: Some(public_key),
                    ..Conversation::default()
                };
                true
            }
            None => {
                conv.public_key = Some(public_key);
                true
            }
        }
    }

    /// Cached key for `peer`.
    pub fn peer_key(&self, peer: &Handle) -> Option<PublicKey> {
        self.conversations.get(peer).and_then(|c| c.public_key)
    }

    /// Key knowledge for `peer`.
    pub fn conversation_state(&self, peer: &Handle) -> ConversationState {
        self.conversations
            .get(peer)
            .map_or(ConversationState::Unknown, |c| c.state())
    }

    /// Current routing for `peer`.
    pub fn mode(&self, peer: &Handle) -> TransportMode {
        self.conversations
            .get(peer)
            .map_or(TransportMode::Relayed, |c| c.handshake.mode)
    }

    /// Address `peer` disclosed, if any.
    pub fn direct_address(&self, peer: &Handle) -> Option<Address> {
        self.conversations
            .get(peer)
            .and_then(|c| c.handshake.direct_address.clone())
    }

    /// Snapshot of the handshake record for `peer`.
    pub fn handshake(&self, peer: &Handle) -> Option<HandshakeRecord> {
        self.conversations.get(peer).map(|c| c.handshake.clone())
    }

    /// Seal chat text for `peer`.
    pub fn seal_text(&self, peer: &Handle, text: &str) -> Result<Outgoing, ProtocolError> {
        validate_plaintext(text.as_bytes())?;
        self.seal(peer, &Body::Text(Zeroizing::new(text.to_owned())))
    }

    /// Seal a handshake disclosing `address` to `peer`.
    ///
    /// The handshake record is untouched until the envelope has left; call
    /// [`mark_handshake_sent`](Self::mark_handshake_sent) then.
    pub fn seal_handshake(&self, peer: &Handle, address: Address) -> Result<Outgoing, ProtocolError> {
        self.seal(peer, &Body::Handshake(address))
    }

    /// Record that our handshake to `peer` was sent.
    ///
    /// Under `AutoPromote` this switches the conversation to direct if the
    /// peer's handshake already arrived. Returns whether the mode is now direct.
    pub fn mark_handshake_sent(&self, peer: &Handle) -> bool {
        let Some(mut conv) = self.conversations.get_mut(peer) else {
            return false;
        };
        conv.handshake.sent = true;
        match self.policy {
            HandshakePolicy::AutoPromote => try_promote(peer, &mut conv.handshake),
            HandshakePolicy::Manual => conv.handshake.mode == TransportMode::Direct,
        }
    }

    /// Switch `peer` to direct transport.
    ///
    /// Requires a handshake both sent and received. Irreversible.
    pub fn promote_to_direct(&self, peer: &Handle) -> Result<(), ProtocolError> {
        let mut conv = self
            .conversations
            .get_mut(peer)
            .ok_or(ProtocolError::HandshakeIncomplete)?;
        if try_promote(peer, &mut conv.handshake) {
            Ok(())
        } else {
            Err(ProtocolError::HandshakeIncomplete)
        }
    }

    /// The relay could not deliver to `peer`. Re-introduce on the next send.
    pub fn delivery_failed(&self, peer: &Handle) {
        if let Some(mut conv) = self.conversations.get_mut(peer) {
            conv.introduced = false;
        }
    }

    fn direct_peer_key(&self, peer: &Handle) -> Result<PublicKey, ProtocolError> {
        let conv = self
            .conversations
            .get(peer)
            .ok_or(ProtocolError::UnsolicitedDirect)?;
        match conv.public_key {
            Some(key) if conv.handshake.sent => Ok(key),
            _ => Err(ProtocolError::UnsolicitedDirect),
        }
    }

    fn seal(&self, peer: &Handle, body: &Body) -> Result<Outgoing, ProtocolError> {
        let (peer_key, introduced, route) = {
            let conv = self
                .conversations
                .get(peer)
                .ok_or(ProtocolError::UnknownRecipient)?;
            let key = conv.public_key.ok_or(ProtocolError::UnknownRecipient)?;
            let route = match (&conv.handshake.mode, &conv.handshake.direct_address) {
                (TransportMode::Direct, Some(address)) => Route::Direct(address.clone()),
                _ => Route::Directory,
            };
            (key, conv.introduced, route)
        };

        let intro = (!introduced).then(|| SenderIntro {
            handle: self.handle.clone(),
            public_key: self.identity.public_key(),
        });

        let sealed = seal_to(&peer_key, &body.encode())?;
        let inner_signature = self.identity.sign(&InnerPayload::signing_input(
            intro.as_ref(),
            &sealed.ephemeral_public_key,
            &sealed.ciphertext,
        )?);
        let inner_payload = InnerPayload {
            sender: intro,
            ephemeral_public_key: sealed.ephemeral_public_key,
            ciphertext: sealed.ciphertext,
            inner_signature,
        }
        .encode()?;

        let outer = MessageEnvelope::signing_input(&self.handle, peer, &inner_payload)?;
        let payload = WireMessage::MessageEnvelope(MessageEnvelope {
            sender_handle: self.handle.clone(),
            recipient_handle: peer.clone(),
            outer_signature: self.identity.sign(&outer),
            inner_payload,
        })
        .encode()?;

        if let Some(mut conv) = self.conversations.get_mut(peer) {
            conv.introduced = true;
            conv.established = true;
        }
        debug!(peer = %peer, ?route, "sealed envelope");
        Ok(Outgoing { route, payload })
    }

    /// Verify and open a relayed `Deliver` or a direct `MessageEnvelope`.
    ///
    /// A direct envelope is only accepted from a peer we sent a handshake to,
    /// and only under the key already cached for it. Any failure means the
    /// message is dropped. Callers must not answer it.
    pub fn receive(&self, msg: &WireMessage) -> Result<Received, ProtocolError> {
        let (sender, inner_bytes, direct) = match msg {
            WireMessage::Deliver {
                sender_handle,
                inner_payload,
            } => (sender_handle, inner_payload, None),
            WireMessage::MessageEnvelope(env) => {
                if env.recipient_handle != self.handle {
                    return Err(ProtocolError::UnexpectedMessage);
                }
                (&env.sender_handle, &env.inner_payload, Some(env))
            }
            _ => return Err(ProtocolError::UnexpectedMessage),
        };

        let inner = InnerPayload::decode(inner_bytes)?;
        let cached = match direct {
            Some(_) => Some(self.direct_peer_key(sender)?),
            None => self.peer_key(sender),
        };
        let sender_key = match &inner.sender {
            Some(intro) => {
                if &intro.handle != sender {
                    return Err(ProtocolError::SenderMismatch);
                }
                if cached.is_some_and(|k| k != intro.public_key) {
                    return Err(ProtocolError::SenderMismatch);
                }
                intro.public_key
            }
            None => cached.ok_or(ProtocolError::UnknownInnerSender)?,
        };

        crypto::verify(
            &sender_key,
            &InnerPayload::signing_input(
                inner.sender.as_ref(),
                &inner.ephemeral_public_key,
                &inner.ciphertext,
            )?,
            &inner.inner_signature,
        )?;
        if let Some(env) = direct {
            let outer = MessageEnvelope::signing_input(&env.sender_handle, &env.recipient_handle, &env.inner_payload)?;
            crypto::verify(&sender_key, &outer, &env.outer_signature)?;
        }

        let plaintext = open_with(&self.identity, &inner.ephemeral_public_key, &inner.ciphertext)?;
        let body = Body::decode(&plaintext)?;

        let mut conv = self.conversations.entry(sender.clone()).or_default();
        match conv.public_key {
            Some(known) if known != sender_key => return Err(ProtocolError::SenderMismatch),
            Some(_) => {}
            None => {
                info!(peer = %sender, key = %sender_key.fingerprint(), "learned peer key");
                conv.public_key = Some(sender_key);
            }
        }
        if !conv.remember(inner.ephemeral_public_key) {
            return Err(ProtocolError::Replay);
        }
        conv.established = true;

        match body {
            Body::Text(text) => Ok(Received::Message {
                from: sender.clone(),
                text,
            }),
            Body::Handshake(address) => {
                conv.handshake.direct_address = Some(address.clone());
                conv.handshake.received = true;
                let promoted = self.policy == HandshakePolicy::AutoPromote
                    && try_promote(sender, &mut conv.handshake);
                Ok(Received::Handshake {
                    from: sender.clone(),
                    address,
                    promoted,
                })
            }
        }
    }
}

/// Switch to direct if both directions are done. Returns whether the mode is now direct.
fn try_promote(peer: &Handle, handshake: &mut HandshakeRecord) -> bool {
    if handshake.mode == TransportMode::Direct {
        return true;
    }
    if handshake.sent && handshake.received && handshake.direct_address.is_some() {
        handshake.mode = TransportMode::Direct;
        info!(peer = %peer, "conversation promoted to direct");
        return true;
    }
    false
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("handle", &self.handle)
            .field("conversations", &self.conversations.len())
            .finish()
    }
}
