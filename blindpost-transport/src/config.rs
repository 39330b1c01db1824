//! Client configuration.

use std::time::Duration;

use blindpost_core::{Address, HandshakePolicy, PublicKey};

/// Default bound on every wait for a directory reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a single `next_event()` wait.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of reply blocks attached to each directory request.
pub const DEFAULT_REPLY_BUDGET: u32 = 10;

/// Configuration for a participant client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The directory's transport address.
    pub directory: Address,
    /// Pinned directory key. Unsigned or forged replies are dropped when set.
    pub directory_key: Option<PublicKey>,
    /// Bound on each wait for a directory reply.
    pub request_timeout: Duration,
    /// Bound on each `next_event()` wait.
    pub receive_timeout: Duration,
    /// Reply blocks attached to every request sent to the directory.
    pub reply_budget: u32,
    /// What to do when a handshake completes in both directions.
    pub policy: HandshakePolicy,
}

impl ClientConfig {
    /// Defaults for talking to `directory`.
    pub fn new(directory: Address) -> Self {
        Self {
            directory,
            directory_key: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            reply_budget: DEFAULT_REPLY_BUDGET,
            policy: HandshakePolicy::Manual,
        }
    }

    /// Pin the directory's public key.
    pub fn with_directory_key(mut self, key: PublicKey) -> Self {
        self.directory_key = Some(key);
        self
    }

    /// Set the directory reply timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the `next_event()` timeout.
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Set the reply budget.
    pub fn with_reply_budget(mut self, budget: u32) -> Self {
        self.reply_budget = budget;
        self
    }

    /// Set the handshake policy.
    pub fn with_policy(mut self, policy: HandshakePolicy) -> Self {
        self.policy = policy;
        self
    }
}
