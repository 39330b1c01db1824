//! Identity and pending-challenge stores.
//!
//! The directory only ever talks to these traits. The in-memory
//! implementations are what the server runs today and what the tests inject.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::crypto::{PublicKey, CHALLENGE_NONCE_LENGTH};
use crate::error::StoreError;
use crate::types::{Handle, ReplyHandle};

/// One registered handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Claimed handle.
    pub handle: Handle,
    /// Bound long-term key.
    pub public_key: PublicKey,
    /// Most recent reply handle observed from this identity.
    pub reply_handle: ReplyHandle,
}

/// `handle -> record`. Operations are atomic per handle.
pub trait IdentityStore: Send + Sync {
    /// Fetch the record for `handle`.
    fn get(&self, handle: &Handle) -> Result<Option<IdentityRecord>, StoreError>;

    /// Insert or overwrite the record for `record.handle`.
    fn put(&self, record: IdentityRecord) -> Result<(), StoreError>;

    /// Whether `handle` is registered.
    fn exists(&self, handle: &Handle) -> Result<bool, StoreError> {
        Ok(self.get(handle)?.is_some())
    }
}

/// What a challenge was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengePurpose {
    /// Binding a new handle.
    Register,
    /// Proving possession of an existing one.
    Login,
}

/// An outstanding challenge.
#[derive(Debug, Clone)]
pub struct PendingChallenge {
    /// Candidate handle.
    pub handle: Handle,
    /// Single-use random nonce.
    pub nonce: [u8; CHALLENGE_NONCE_LENGTH],
    /// Key the response must verify under.
    pub claimed_public_key: PublicKey,
    /// Where the outcome goes.
    pub reply_handle: ReplyHandle,
    /// Issue time.
    pub created_at: Instant,
    /// Register or login.
    pub purpose: ChallengePurpose,
}

impl PendingChallenge {
    /// Whether the challenge is older than `ttl` at `now`.
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.created_at) >= ttl
    }
}

/// Pending challenges, at most one per handle.
pub trait ChallengeStore: Send + Sync {
    /// Insert unless a challenge for the handle already exists.
    ///
    /// Returns `false` (and leaves the existing one) if one was present.
    fn insert_if_absent(&self, challenge: PendingChallenge) -> Result<bool, StoreError>;

    /// Copy of the challenge for `handle`, left in place.
    fn peek(&self, handle: &Handle) -> Result<Option<PendingChallenge>, StoreError>;

    /// Atomically remove and return the challenge for `handle`.
    ///
    /// Two concurrent callers can never both receive the same challenge.
    fn take(&self, handle: &Handle) -> Result<Option<PendingChallenge>, StoreError>;

    /// Remove the challenge for `handle` only if it was opened from `reply`.
    fn remove_if_reply(&self, handle: &Handle, reply: &ReplyHandle) -> Result<bool, StoreError>;

    /// Remove the challenge for `handle` unconditionally.
    fn remove(&self, handle: &Handle) -> Result<bool, StoreError>;

    /// Drop every challenge older than `ttl`. Returns how many were dropped.
    fn purge_expired(&self, now: Instant, ttl: Duration) -> Result<usize, StoreError>;
}

/// In-memory identity store.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    records: DashMap<Handle, IdentityRecord>,
}

impl MemoryIdentityStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no handle is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, handle: &Handle) -> Result<Option<IdentityRecord>, StoreError> {
        Ok(self.records.get(handle).map(|r| r.value().clone()))
    }

    fn put(&self, record: IdentityRecord) -> Result<(), StoreError> {
        self.records.insert(record.handle.clone(), record);
        Ok(())
    }

    fn exists(&self, handle: &Handle) -> Result<bool, StoreError> {
        Ok(self.records.contains_key(handle))
    }
}

/// In-memory challenge store.
#[derive(Debug, Default)]
pub struct MemoryChallengeStore {
    pending: DashMap<Handle, PendingChallenge>,
}

impl MemoryChallengeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of outstanding challenges.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl ChallengeStore for MemoryChallengeStore {
    fn insert_if_absent(&self, challenge: PendingChallenge) -> Result<bool, StoreError> {
        match self.pending.entry(challenge.handle.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(challenge);
                Ok(true)
            }
        }
    }

    fn peek(&self, handle: &Handle) -> Result<Option<PendingChallenge>, StoreError> {
        Ok(self.pending.get(handle).map(|c| c.value().clone()))
    }

    fn take(&self, handle: &Handle) -> Result<Option<PendingChallenge>, StoreError> {
        Ok(self.pending.remove(handle).map(|(_, c)| c))
    }

    fn remove_if_reply(&self, handle: &Handle, reply: &ReplyHandle) -> Result<bool, StoreError> {
        Ok(self
            .pending
            .remove_if(handle, |_, c| &c.reply_handle == reply)
            .is_some())
    }

    fn remove(&self, handle: &Handle) -> Result<bool, StoreError> {
        Ok(self.pending.remove(handle).is_some())
    }

    fn purge_expired(&self, now: Instant, ttl: Duration) -> Result<usize, StoreError> {
        let before = self.pending.len();
        self.pending.retain(|_, c| !c.is_expired(now, ttl));
        Ok(before.saturating_sub(self.pending.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeypair;

    fn challenge(handle: &str, reply: &str, created_at: Instant) -> PendingChallenge {
        PendingChallenge {
            handle: Handle::new(handle).unwrap(),
            nonce: [1; 32],
            claimed_public_key: IdentityKeypair::generate().public_key(),
            reply_handle: ReplyHandle::new(reply),
            created_at,
            purpose: ChallengePurpose::Register,
        }
    }

    #[test]
    fn test_identity_put_get() {
        let store = MemoryIdentityStore::new();
        let handle = Handle::new("alice").unwrap();
        assert!(!store.exists(&handle).unwrap());

        let record = IdentityRecord {
            handle: handle.clone(),
            public_key: IdentityKeypair::generate().public_key(),
            reply_handle: ReplyHandle::new("tag-1"),
        };
        store.put(record.clone()).unwrap();
        assert_eq!(store.get(&handle).unwrap(), Some(record));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let store = MemoryChallengeStore::new();
        let now = Instant::now();
        assert!(store.insert_if_absent(challenge("alice", "a", now)).unwrap());
        assert!(!store.insert_if_absent(challenge("alice", "b", now)).unwrap());

        let taken = store.take(&Handle::new("alice").unwrap()).unwrap().unwrap();
        assert_eq!(taken.reply_handle, ReplyHandle::new("a"));
    }

    #[test]
    fn test_take_is_single_use() {
        let store = MemoryChallengeStore::new();
        let handle = Handle::new("alice").unwrap();
        store
            .insert_if_absent(challenge("alice", "a", Instant::now()))
            .unwrap();
        assert!(store.take(&handle).unwrap().is_some());
        assert!(store.take(&handle).unwrap().is_none());
    }

    #[test]
    fn test_remove_if_reply() {
        let store = MemoryChallengeStore::new();
        let handle = Handle::new("alice").unwrap();
        store
            .insert_if_absent(challenge("alice", "a", Instant::now()))
            .unwrap();
        assert!(!store.remove_if_reply(&handle, &ReplyHandle::new("b")).unwrap());
        assert_eq!(store.len(), 1);
        assert!(store.remove_if_reply(&handle, &ReplyHandle::new("a")).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryChallengeStore::new();
        let ttl = Duration::from_secs(30);
        let old = Instant::now();
        let now = old + Duration::from_secs(60);
        store.insert_if_absent(challenge("old", "a", old)).unwrap();
        store.insert_if_absent(challenge("fresh", "b", now)).unwrap();

        let purged = store.purge_expired(now, ttl).unwrap();
        assert_eq!(purged, 1);
        assert!(store.take(&Handle::new("fresh").unwrap()).unwrap().is_some());
    }
}
