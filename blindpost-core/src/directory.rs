//! Directory protocol engine.
//!
//! Per handle: `Unregistered → Challenged → Registered`.
//!
//! The engine is synchronous and transport-agnostic. Every operation returns
//! the [`Outbound`] payloads the caller must hand to its transport; every
//! payload is a `DirectoryReply` signed with the directory's identity.
//!
//! Operations on the same handle are serialized by a striped lock. Nothing
//! here suspends, so no lock is ever held across transport I/O.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::crypto::{self, challenge_nonce, IdentityKeypair, PublicKey, Signature};
use crate::error::{ErrorClass, ProtocolError};
use crate::store::{
    ChallengePurpose, ChallengeStore, IdentityRecord, IdentityStore, PendingChallenge,
};
use crate::types::{Handle, ReplyHandle};
use crate::wire::{
    login_signing_input, register_signing_input, MessageEnvelope, MessageKind, WireMessage,
};

/// Default pending-challenge lifetime.
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(30);

const LOCK_STRIPES: usize = 64;

/// Directory tunables.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// How long a challenge stays answerable.
    pub challenge_ttl: Duration,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
        }
    }
}

impl DirectoryConfig {
    /// Set the challenge lifetime.
    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }
}

/// A signed payload the directory wants sent.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Reply handle to send on.
    pub destination: ReplyHandle,
    /// Kind of the wrapped body. For logs.
    pub kind: MessageKind,
    /// Encoded `DirectoryReply`.
    pub payload: Vec<u8>,
    /// Set when this carries a challenge. If sending fails, abandon it.
    pub challenge_for: Option<Handle>,
}

/// The directory service state machine.
pub struct Directory<I, C> {
    identity: IdentityKeypair,
    identities: I,
    challenges: C,
    config: DirectoryConfig,
    locks: Vec<Mutex<()>>,
}

impl<I: IdentityStore, C: ChallengeStore> Directory<I, C> {
    /// Build an engine over the given stores.
    pub fn new(identity: IdentityKeypair, identities: I, challenges: C, config: DirectoryConfig) -> Self {
        let locks = (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            identity,
            identities,
            challenges,
            config,
            locks,
        }
    }

    /// The key clients pin to verify replies.
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Engine configuration.
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Identity store.
    pub fn identities(&self) -> &I {
        &self.identities
    }

    /// Challenge store.
    pub fn challenges(&self) -> &C {
        &self.challenges
    }

    /// Start registering `handle` for `public_key`.
    ///
    /// Issues a fresh challenge to `reply`. The identity store is untouched.
    pub fn register(
        &self,
        handle: &Handle,
        public_key: PublicKey,
        reply: &ReplyHandle,
    ) -> Result<Outbound, ProtocolError> {
        let _guard = self.lock(handle);

        if self.identities.exists(handle)? {
            return Err(ProtocolError::AlreadyRegistered);
        }
        self.open_challenge(handle, public_key, reply, ChallengePurpose::Register)
    }

    /// Finish registering `handle` with the signed nonce.
    ///
    /// The challenge is consumed whatever the outcome.
    pub fn complete_registration(
        &self,
        handle: &Handle,
        signature: &Signature,
        reply: &ReplyHandle,
    ) -> Result<Outbound, ProtocolError> {
        let _guard = self.lock(handle);

        let challenge = self.consume_challenge(handle, ChallengePurpose::Register)?;
        crypto::verify(
            &challenge.claimed_public_key,
            &register_signing_input(handle, &challenge.nonce),
            signature,
        )?;

        self.identities.put(IdentityRecord {
            handle: handle.clone(),
            public_key: challenge.claimed_public_key,
            reply_handle: reply.clone(),
        })?;
        info!(
            handle = %handle,
            key = %challenge.claimed_public_key.fingerprint(),
            "handle registered"
        );

        self.reply(reply.clone(), &WireMessage::RegisterResult { ok: true })
    }

    /// Start a login for an already registered `handle`.
    pub fn login(&self, handle: &Handle, reply: &ReplyHandle) -> Result<Outbound, ProtocolError> {
        let _guard = self.lock(handle);

        let record = self
            .identities
            .get(handle)?
            .ok_or(ProtocolError::HandleNotFound)?;
        self.open_challenge(handle, record.public_key, reply, ChallengePurpose::Login)
    }

    /// Finish a login. Refreshes the stored reply handle on success.
    pub fn complete_login(
        &self,
        handle: &Handle,
        signature: &Signature,
        reply: &ReplyHandle,
    ) -> Result<Outbound, ProtocolError> {
        let _guard = self.lock(handle);

        let challenge = self.consume_challenge(handle, ChallengePurpose::Login)?;
        crypto::verify(
            &challenge.claimed_public_key,
            &login_signing_input(handle, &challenge.nonce),
            signature,
        )?;

        let mut record = self
            .identities
            .get(handle)?
            .ok_or(ProtocolError::HandleNotFound)?;
        record.reply_handle = reply.clone();
        self.identities.put(record)?;
        debug!(handle = %handle, "login complete");

        self.reply(reply.clone(), &WireMessage::LoginResult { ok: true })
    }

    /// Answer a key lookup. Absent handles get an explicit not-found.
    pub fn lookup(&self, target: &Handle, reply: &ReplyHandle) -> Result<Outbound, ProtocolError> {
        let public_key = self.identities.get(target)?.map(|r| r.public_key);
        debug!(target = %target, found = public_key.is_some(), "lookup");
        self.reply(reply.clone(), &WireMessage::LookupResult { public_key })
    }

    /// Authenticate and forward an envelope.
    ///
    /// Returns the `Deliver` for the recipient followed by the sender's
    /// `RelayResult`. The sender's stored reply handle is refreshed to
    /// `reply` when one was observed.
    pub fn relay(
        &self,
        envelope: &MessageEnvelope,
        reply: Option<&ReplyHandle>,
    ) -> Result<Vec<Outbound>, ProtocolError> {
        let sender = self
            .identities
            .get(&envelope.sender_handle)?
            .ok_or(ProtocolError::UnknownSender)?;

        let signed = MessageEnvelope::signing_input(
            &envelope.sender_handle,
            &envelope.recipient_handle,
            &envelope.inner_payload,
        )?;
        crypto::verify(&sender.public_key, &signed, &envelope.outer_signature)?;

        let sender_reply = match reply {
            Some(observed) => {
                self.refresh_reply_handle(&envelope.sender_handle, observed)?;
                observed.clone()
            }
            None => sender.reply_handle,
        };

        let recipient = self
            .identities
            .get(&envelope.recipient_handle)?
            .ok_or(ProtocolError::RecipientNotFound)?;

        let deliver = self.reply(
            recipient.reply_handle,
            &WireMessage::Deliver {
                sender_handle: envelope.sender_handle.clone(),
                inner_payload: envelope.inner_payload.clone(),
            },
        )?;
        let report = self.reply(
            sender_reply,
            &WireMessage::RelayResult {
                recipient_handle: envelope.recipient_handle.clone(),
                delivered: true,
            },
        )?;
        debug!(
            from = %envelope.sender_handle,
            to = %envelope.recipient_handle,
            "relayed envelope"
        );
        Ok(vec![deliver, report])
    }

    /// Drop the challenge for `handle` if it was opened from `reply`.
    pub fn cancel_registration(&self, handle: &Handle, reply: &ReplyHandle) -> Result<bool, ProtocolError> {
        let _guard = self.lock(handle);
        let removed = self.challenges.remove_if_reply(handle, reply)?;
        debug!(handle = %handle, removed, "challenge cancel");
        Ok(removed)
    }

    /// Drop the challenge for `handle` unconditionally.
    ///
    /// Used when the challenge could not be delivered.
    pub fn abandon_challenge(&self, handle: &Handle) -> Result<bool, ProtocolError> {
        let _guard = self.lock(handle);
        Ok(self.challenges.remove(handle)?)
    }

    /// Drop every expired challenge. Returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize, ProtocolError> {
        Ok(self
            .challenges
            .purge_expired(Instant::now(), self.config.challenge_ttl)?)
    }

    /// Decode one inbound payload and run it through the engine.
    ///
    /// Failures are mapped onto replies by class: malformed input and relay
    /// authentication failures are dropped, everything the requester may
    /// legitimately learn is answered.
    pub fn handle_inbound(&self, payload: &[u8], reply: Option<&ReplyHandle>) -> Vec<Outbound> {
        let msg = match WireMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "dropping undecodable payload");
                return Vec::new();
            }
        };
        let kind = msg.kind();

        let result = match (&msg, reply) {
            (WireMessage::MessageEnvelope(envelope), _) => match self.relay(envelope, reply) {
                Err(ProtocolError::RecipientNotFound) => {
                    self.relay_failure(envelope, reply).map(|o| o.into_iter().collect())
                }
                other => other,
            },
            (WireMessage::RegisterCancel { handle }, Some(reply)) => {
                self.cancel_registration(handle, reply).map(|_| Vec::new())
            }
            (_, None) => {
                debug!(?kind, "dropping request without reply handle");
                return Vec::new();
            }
            (WireMessage::RegisterRequest { handle, public_key }, Some(reply)) => self
                .register(handle, *public_key, reply)
                .or_else(|e| self.refuse(e, reply, WireMessage::RegisterResult { ok: false }))
                .map(|o| vec![o]),
            (WireMessage::RegisterConfirm { handle, signature }, Some(reply)) => self
                .complete_registration(handle, signature, reply)
                .or_else(|e| self.refuse(e, reply, WireMessage::RegisterResult { ok: false }))
                .map(|o| vec![o]),
            (WireMessage::LoginRequest { handle }, Some(reply)) => self
                .login(handle, reply)
                .or_else(|e| self.refuse(e, reply, WireMessage::LoginResult { ok: false }))
                .map(|o| vec![o]),
            (WireMessage::LoginConfirm { handle, signature }, Some(reply)) => self
                .complete_login(handle, signature, reply)
                .or_else(|e| self.refuse(e, reply, WireMessage::LoginResult { ok: false }))
                .map(|o| vec![o]),
            (WireMessage::LookupRequest { handle }, Some(reply)) => {
                self.lookup(handle, reply).map(|o| vec![o])
            }
            (_, Some(_)) => Err(ProtocolError::UnexpectedMessage),
        };

        match result {
            Ok(out) => out,
            Err(e) => {
                match e.class() {
                    ErrorClass::Internal => warn!(?kind, error = %e, "request failed"),
                    _ => debug!(?kind, error = %e, "dropping request"),
                }
                Vec::new()
            }
        }
    }

    /// Map a register/login failure to an explicit negative result.
    ///
    /// Malformed requests are still dropped.
    fn refuse(
        &self,
        error: ProtocolError,
        reply: &ReplyHandle,
        result: WireMessage,
    ) -> Result<Outbound, ProtocolError> {
        if error.class() == ErrorClass::Protocol {
            return Err(error);
        }
        debug!(error = %error, "refusing request");
        self.reply(reply.clone(), &result)
    }

    fn relay_failure(
        &self,
        envelope: &MessageEnvelope,
        reply: Option<&ReplyHandle>,
    ) -> Result<Option<Outbound>, ProtocolError> {
        let destination = match reply {
            Some(r) => r.clone(),
            None => match self.identities.get(&envelope.sender_handle)? {
                Some(sender) => sender.reply_handle,
                None => return Ok(None),
            },
        };
        debug!(
            from = %envelope.sender_handle,
            to = %envelope.recipient_handle,
            "recipient not found"
        );
        self.reply(
            destination,
            &WireMessage::RelayResult {
                recipient_handle: envelope.recipient_handle.clone(),
                delivered: false,
            },
        )
        .map(Some)
    }

    fn open_challenge(
        &self,
        handle: &Handle,
        public_key: PublicKey,
        reply: &ReplyHandle,
        purpose: ChallengePurpose,
    ) -> Result<Outbound, ProtocolError> {
        let now = Instant::now();
        if let Some(existing) = self.challenges.peek(handle)? {
            if !existing.is_expired(now, self.config.challenge_ttl) {
                return Err(ProtocolError::ChallengePending);
            }
            self.challenges.remove(handle)?;
        }

        let nonce = challenge_nonce();
        let inserted = self.challenges.insert_if_absent(PendingChallenge {
            handle: handle.clone(),
            nonce,
            claimed_public_key: public_key,
            reply_handle: reply.clone(),
            created_at: now,
            purpose,
        })?;
        if !inserted {
            return Err(ProtocolError::ChallengePending);
        }
        debug!(handle = %handle, ?purpose, "challenge issued");

        let mut out = self.reply(reply.clone(), &WireMessage::Challenge { nonce })?;
        out.challenge_for = Some(handle.clone());
        Ok(out)
    }

    fn consume_challenge(
        &self,
        handle: &Handle,
        purpose: ChallengePurpose,
    ) -> Result<PendingChallenge, ProtocolError> {
        let challenge = self
            .challenges
            .take(handle)?
            .ok_or(ProtocolError::NoPendingChallenge)?;
        if challenge.is_expired(Instant::now(), self.config.challenge_ttl) {
            return Err(ProtocolError::NoPendingChallenge);
        }
        if challenge.purpose != purpose {
            return Err(ProtocolError::NoPendingChallenge);
        }
        Ok(challenge)
    }

    fn refresh_reply_handle(&self, handle: &Handle, observed: &ReplyHandle) -> Result<(), ProtocolError> {
        let _guard = self.lock(handle);
        if let Some(mut record) = self.identities.get(handle)? {
            if &record.reply_handle != observed {
                record.reply_handle = observed.clone();
                self.identities.put(record)?;
            }
        }
        Ok(())
    }

    fn reply(&self, destination: ReplyHandle, body: &WireMessage) -> Result<Outbound, ProtocolError> {
        let signed = WireMessage::directory_reply(body, |m| self.identity.sign(m))?;
        Ok(Outbound {
            destination,
            kind: body.kind(),
            payload: signed.encode()?,
            challenge_for: None,
        })
    }

    fn lock(&self, handle: &Handle) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        handle.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let stripe = (hasher.finish() as usize) % self.locks.len();
        self.locks[stripe]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryChallengeStore, MemoryIdentityStore};
    use crate::wire::open_directory_reply;

    type TestDirectory = Directory<MemoryIdentityStore, MemoryChallengeStore>;

    fn directory() -> TestDirectory {
        directory_with(DirectoryConfig::default())
    }

    fn directory_with(config: DirectoryConfig) -> TestDirectory {
        Directory::new(
            IdentityKeypair::generate(),
            MemoryIdentityStore::new(),
            MemoryChallengeStore::new(),
            config,
        )
    }

    fn h(s: &str) -> Handle {
        Handle::new(s).unwrap()
    }

    fn tag(s: &str) -> ReplyHandle {
        ReplyHandle::new(s)
    }

    fn open(dir: &TestDirectory, out: &Outbound) -> WireMessage {
        match WireMessage::decode(&out.payload).unwrap() {
            WireMessage::DirectoryReply { body, signature } => {
                open_directory_reply(&body, &signature, Some(&dir.public_key())).unwrap()
            }
            other => panic!("unsigned reply: {other:?}"),
        }
    }

    fn nonce_of(dir: &TestDirectory, out: &Outbound) -> [u8; 32] {
        match open(dir, out) {
            WireMessage::Challenge { nonce } => nonce,
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    fn register(dir: &TestDirectory, name: &str, id: &IdentityKeypair, reply: &str) {
        let handle = h(name);
        let out = dir.register(&handle, id.public_key(), &tag(reply)).unwrap();
        assert_eq!(out.challenge_for, Some(handle.clone()));
        let nonce = nonce_of(dir, &out);
        let sig = id.sign(&register_signing_input(&handle, &nonce));
        let done = dir.complete_registration(&handle, &sig, &tag(reply)).unwrap();
        assert_eq!(open(dir, &done), WireMessage::RegisterResult { ok: true });
    }

    fn envelope(
        from: &str,
        sender: &IdentityKeypair,
        to: &str,
        inner: &[u8],
    ) -> MessageEnvelope {
        let signed = MessageEnvelope::signing_input(&h(from), &h(to), inner).unwrap();
        MessageEnvelope {
            sender_handle: h(from),
            recipient_handle: h(to),
            inner_payload: inner.to_vec(),
            outer_signature: sender.sign(&signed),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a1");

        let out = dir.lookup(&h("alice"), &tag("q")).unwrap();
        assert_eq!(out.destination, tag("q"));
        assert_eq!(
            open(&dir, &out),
            WireMessage::LookupResult {
                public_key: Some(alice.public_key())
            }
        );

        let out = dir.lookup(&h("ghost"), &tag("q")).unwrap();
        assert_eq!(open(&dir, &out), WireMessage::LookupResult { public_key: None });
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a1");

        let mallory = IdentityKeypair::generate();
        assert_eq!(
            dir.register(&h("alice"), mallory.public_key(), &tag("m")).unwrap_err(),
            ProtocolError::AlreadyRegistered
        );
        let record = dir.identities().get(&h("alice")).unwrap().unwrap();
        assert_eq!(record.public_key, alice.public_key());
        assert_eq!(record.reply_handle, tag("a1"));
        assert!(dir.challenges().is_empty());
    }

    #[test]
    fn test_nonce_single_use() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        let handle = h("alice");
        let out = dir.register(&handle, alice.public_key(), &tag("a")).unwrap();
        let sig = alice.sign(&register_signing_input(&handle, &nonce_of(&dir, &out)));

        assert!(dir.complete_registration(&handle, &sig, &tag("a")).is_ok());
        let replay = dir.complete_registration(&handle, &sig, &tag("a")).unwrap_err();
        assert_eq!(replay, ProtocolError::NoPendingChallenge);
        assert_eq!(replay.class(), ErrorClass::State);
    }

    #[test]
    fn test_bad_signature_consumes_challenge() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        let handle = h("alice");
        let out = dir.register(&handle, alice.public_key(), &tag("a")).unwrap();
        let nonce = nonce_of(&dir, &out);

        let wrong = IdentityKeypair::generate().sign(&register_signing_input(&handle, &nonce));
        assert_eq!(
            dir.complete_registration(&handle, &wrong, &tag("a")).unwrap_err(),
            ProtocolError::BadSignature
        );
        // The correct answer is now too late.
        let right = alice.sign(&register_signing_input(&handle, &nonce));
        assert_eq!(
            dir.complete_registration(&handle, &right, &tag("a")).unwrap_err(),
            ProtocolError::NoPendingChallenge
        );
        assert!(!dir.identities().exists(&handle).unwrap());
    }

    #[test]
    fn test_concurrent_register_pending() {
        let dir = directory();
        let handle = h("alice");
        dir.register(&handle, IdentityKeypair::generate().public_key(), &tag("a"))
            .unwrap();
        assert_eq!(
            dir.register(&handle, IdentityKeypair::generate().public_key(), &tag("b"))
                .unwrap_err(),
            ProtocolError::ChallengePending
        );
    }

    #[test]
    fn test_concurrent_confirm_single_winner() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        let handle = h("alice");
        let out = dir.register(&handle, alice.public_key(), &tag("a")).unwrap();
        let sig = alice.sign(&register_signing_input(&handle, &nonce_of(&dir, &out)));

        let wins = std::thread::scope(|s| {
            let workers: Vec<_> = (0..8)
                .map(|_| s.spawn(|| dir.complete_registration(&handle, &sig, &tag("a")).is_ok()))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(wins, 1);
    }

    #[test]
    fn test_expired_challenge() {
        let dir = directory_with(DirectoryConfig::default().with_challenge_ttl(Duration::ZERO));
        let alice = IdentityKeypair::generate();
        let handle = h("alice");
        let out = dir.register(&handle, alice.public_key(), &tag("a")).unwrap();
        let sig = alice.sign(&register_signing_input(&handle, &nonce_of(&dir, &out)));
        assert_eq!(
            dir.complete_registration(&handle, &sig, &tag("a")).unwrap_err(),
            ProtocolError::NoPendingChallenge
        );

        // An expired challenge does not block a new attempt, and is purged.
        dir.register(&handle, alice.public_key(), &tag("a")).unwrap();
        assert_eq!(dir.purge_expired().unwrap(), 1);
        assert!(dir.challenges().is_empty());
    }

    #[test]
    fn test_login_refreshes_reply_handle() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a1");

        let handle = h("alice");
        let out = dir.login(&handle, &tag("a2")).unwrap();
        let nonce = nonce_of(&dir, &out);
        let sig = alice.sign(&login_signing_input(&handle, &nonce));
        let done = dir.complete_login(&handle, &sig, &tag("a2")).unwrap();
        assert_eq!(open(&dir, &done), WireMessage::LoginResult { ok: true });
        assert_eq!(
            dir.identities().get(&handle).unwrap().unwrap().reply_handle,
            tag("a2")
        );
    }

    #[test]
    fn test_login_challenge_not_usable_for_registration() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a1");

        let handle = h("alice");
        let out = dir.login(&handle, &tag("a2")).unwrap();
        let nonce = nonce_of(&dir, &out);
        let sig = alice.sign(&register_signing_input(&handle, &nonce));
        assert_eq!(
            dir.complete_registration(&handle, &sig, &tag("a2")).unwrap_err(),
            ProtocolError::NoPendingChallenge
        );
    }

    #[test]
    fn test_login_unknown_handle() {
        let dir = directory();
        assert_eq!(
            dir.login(&h("ghost"), &tag("g")).unwrap_err(),
            ProtocolError::HandleNotFound
        );
    }

    #[test]
    fn test_cancel_requires_same_reply_handle() {
        let dir = directory();
        let handle = h("alice");
        dir.register(&handle, IdentityKeypair::generate().public_key(), &tag("a"))
            .unwrap();
        assert!(!dir.cancel_registration(&handle, &tag("other")).unwrap());
        assert_eq!(dir.challenges().len(), 1);
        assert!(dir.cancel_registration(&handle, &tag("a")).unwrap());
        assert!(dir.challenges().is_empty());
    }

    #[test]
    fn test_relay_delivers_and_refreshes() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        let bob = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a1");
        register(&dir, "bob", &bob, "b1");

        let env = envelope("alice", &alice, "bob", b"opaque");
        let out = dir.relay(&env, Some(&tag("a2"))).unwrap();
        assert_eq!(out.len(), 2);

        assert_eq!(out[0].destination, tag("b1"));
        assert_eq!(
            open(&dir, &out[0]),
            WireMessage::Deliver {
                sender_handle: h("alice"),
                inner_payload: b"opaque".to_vec()
            }
        );
        assert_eq!(out[1].destination, tag("a2"));
        assert_eq!(
            open(&dir, &out[1]),
            WireMessage::RelayResult {
                recipient_handle: h("bob"),
                delivered: true
            }
        );
        assert_eq!(
            dir.identities().get(&h("alice")).unwrap().unwrap().reply_handle,
            tag("a2")
        );
    }

    #[test]
    fn test_concurrent_relays_refresh_to_an_observed_handle() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        let bob = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a0");
        register(&dir, "bob", &bob, "b0");

        let observed: Vec<ReplyHandle> = (1..=8).map(|i| tag(&format!("a{i}"))).collect();
        let env = envelope("alice", &alice, "bob", b"opaque");
        std::thread::scope(|s| {
            let workers: Vec<_> = observed
                .iter()
                .map(|reply| {
                    let env = &env;
                    let dir = &dir;
                    s.spawn(move || dir.relay(env, Some(reply)).unwrap())
                })
                .collect();
            for w in workers {
                let out = w.join().unwrap();
                assert_eq!(out[0].destination, tag("b0"));
            }
        });

        let record = dir.identities().get(&h("alice")).unwrap().unwrap();
        assert!(observed.contains(&record.reply_handle));
        assert_eq!(record.public_key, alice.public_key());
    }

    #[test]
    fn test_relay_unknown_sender_and_bad_signature() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        let bob = IdentityKeypair::generate();
        register(&dir, "bob", &bob, "b1");

        let env = envelope("alice", &alice, "bob", b"x");
        assert_eq!(
            dir.relay(&env, Some(&tag("a"))).unwrap_err(),
            ProtocolError::UnknownSender
        );
        let wire = WireMessage::MessageEnvelope(env).encode().unwrap();
        assert!(dir.handle_inbound(&wire, Some(&tag("a"))).is_empty());

        register(&dir, "alice", &alice, "a1");
        let forged = envelope("alice", &IdentityKeypair::generate(), "bob", b"x");
        assert_eq!(
            dir.relay(&forged, Some(&tag("a2"))).unwrap_err(),
            ProtocolError::BadSignature
        );
        // A forged envelope must not steer the sender's reply handle.
        assert_eq!(
            dir.identities().get(&h("alice")).unwrap().unwrap().reply_handle,
            tag("a1")
        );
        let wire = WireMessage::MessageEnvelope(forged).encode().unwrap();
        assert!(dir.handle_inbound(&wire, Some(&tag("a2"))).is_empty());
    }

    #[test]
    fn test_relay_unknown_recipient_reports_to_sender_only() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a1");

        let env = envelope("alice", &alice, "ghost", b"x");
        assert_eq!(
            dir.relay(&env, Some(&tag("a2"))).unwrap_err(),
            ProtocolError::RecipientNotFound
        );

        let wire = WireMessage::MessageEnvelope(env).encode().unwrap();
        let out = dir.handle_inbound(&wire, Some(&tag("a2")));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].destination, tag("a2"));
        assert_eq!(
            open(&dir, &out[0]),
            WireMessage::RelayResult {
                recipient_handle: h("ghost"),
                delivered: false
            }
        );
    }

    #[test]
    fn test_inbound_registration_failures_are_answered() {
        let dir = directory();
        let alice = IdentityKeypair::generate();
        register(&dir, "alice", &alice, "a1");

        let dup = WireMessage::RegisterRequest {
            handle: h("alice"),
            public_key: IdentityKeypair::generate().public_key(),
        }
        .encode()
        .unwrap();
        let out = dir.handle_inbound(&dup, Some(&tag("m")));
        assert_eq!(out.len(), 1);
        assert_eq!(open(&dir, &out[0]), WireMessage::RegisterResult { ok: false });

        let stray = WireMessage::RegisterConfirm {
            handle: h("carol"),
            signature: Signature::from_bytes([0; 64]),
        }
        .encode()
        .unwrap();
        let out = dir.handle_inbound(&stray, Some(&tag("c")));
        assert_eq!(open(&dir, &out[0]), WireMessage::RegisterResult { ok: false });
    }

    #[test]
    fn test_inbound_drops_garbage_and_client_bound_kinds() {
        let dir = directory();
        assert!(dir.handle_inbound(&[0xde, 0xad], Some(&tag("x"))).is_empty());
        let stray = WireMessage::RegisterResult { ok: true }.encode().unwrap();
        assert!(dir.handle_inbound(&stray, Some(&tag("x"))).is_empty());
        let lookup = WireMessage::LookupRequest { handle: h("alice") }.encode().unwrap();
        assert!(dir.handle_inbound(&lookup, None).is_empty());
    }
}
