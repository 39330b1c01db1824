//! Environment-driven service configuration.

use std::fmt;
use std::time::Duration;

use blindpost_core::directory::DEFAULT_CHALLENGE_TTL;
use blindpost_core::{DirectoryConfig, IdentityKeypair};
use blindpost_transport::nym::DEFAULT_NYM_CLIENT_URL;
use thiserror::Error;
use tracing::warn;
use zeroize::Zeroizing;

const ENV_NYM_CLIENT_URL: &str = "BLINDPOST_NYM_CLIENT_URL";
const ENV_CHALLENGE_TTL: &str = "BLINDPOST_CHALLENGE_TTL_SECS";
const ENV_CLEANUP_INTERVAL: &str = "BLINDPOST_CLEANUP_INTERVAL_SECS";
const ENV_MAX_IN_FLIGHT: &str = "BLINDPOST_MAX_IN_FLIGHT";
const ENV_DIRECTORY_KEY: &str = "BLINDPOST_DIRECTORY_KEY";

const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Bad configuration value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Not a number, or out of range.
    #[error("{name}: invalid value {value:?}")]
    Invalid {
        /// Variable name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
    /// The directory key is not a 32-byte hex seed.
    #[error("BLINDPOST_DIRECTORY_KEY: not a 32-byte hex seed")]
    BadKey,
}

/// Directory service settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Websocket URL of the local Nym client.
    pub nym_client_url: String,
    /// Lifetime of an unanswered challenge.
    pub challenge_ttl: Duration,
    /// How often expired challenges are purged.
    pub cleanup_interval: Duration,
    /// Inbound messages processed concurrently.
    pub max_in_flight: usize,
    directory_seed: Option<Zeroizing<String>>,
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("nym_client_url", &self.nym_client_url)
            .field("challenge_ttl", &self.challenge_ttl)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("max_in_flight", &self.max_in_flight)
            .field("directory_key", &self.directory_seed.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            nym_client_url: DEFAULT_NYM_CLIENT_URL.to_string(),
            challenge_ttl: DEFAULT_CHALLENGE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            directory_seed: None,
        }
    }
}

impl ServerConfig {
    /// Read `BLINDPOST_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`ServerConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup(ENV_NYM_CLIENT_URL) {
            config.nym_client_url = url;
        }
        if let Some(secs) = lookup(ENV_CHALLENGE_TTL) {
            config.challenge_ttl = Duration::from_secs(positive(ENV_CHALLENGE_TTL, &secs)?);
        }
        if let Some(secs) = lookup(ENV_CLEANUP_INTERVAL) {
            config.cleanup_interval = Duration::from_secs(positive(ENV_CLEANUP_INTERVAL, &secs)?);
        }
        if let Some(n) = lookup(ENV_MAX_IN_FLIGHT) {
            let n = positive(ENV_MAX_IN_FLIGHT, &n)?;
            config.max_in_flight = usize::try_from(n).map_err(|_| ConfigError::Invalid {
                name: ENV_MAX_IN_FLIGHT,
                value: n.to_string(),
            })?;
        }
        if let Some(seed) = lookup(ENV_DIRECTORY_KEY) {
            let seed = Zeroizing::new(seed);
            IdentityKeypair::from_hex_seed(&seed).map_err(|_| ConfigError::BadKey)?;
            config.directory_seed = Some(seed);
        }
        Ok(config)
    }

    /// Use a fixed directory identity seed (hex).
    pub fn with_directory_seed(mut self, hex_seed: &str) -> Result<Self, ConfigError> {
        IdentityKeypair::from_hex_seed(hex_seed).map_err(|_| ConfigError::BadKey)?;
        self.directory_seed = Some(Zeroizing::new(hex_seed.to_string()));
        Ok(self)
    }

    /// Set the challenge lifetime.
    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    /// Set the purge interval. Zero is clamped to one millisecond.
    pub fn with_cleanup_interval(mut self, every: Duration) -> Self {
        self.cleanup_interval = every.max(Duration::from_millis(1));
        self
    }

    /// Set the worker bound. Zero is clamped to one.
    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    /// Engine settings derived from this config.
    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig::default().with_challenge_ttl(self.challenge_ttl)
    }

    /// The configured directory identity, or a fresh ephemeral one.
    pub fn directory_identity(&self) -> Result<IdentityKeypair, ConfigError> {
        match &self.directory_seed {
            Some(seed) => IdentityKeypair::from_hex_seed(seed).map_err(|_| ConfigError::BadKey),
            None => {
                warn!("{ENV_DIRECTORY_KEY} not set, using an ephemeral directory key");
                Ok(IdentityKeypair::generate())
            }
        }
    }
}

fn positive(name: &'static str, value: &str) -> Result<u64, ConfigError> {
    match value.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}
