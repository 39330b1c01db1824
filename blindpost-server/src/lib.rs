//! BlindPost Directory Service
//!
//! Runs the directory engine behind an anonymous transport.
//!
//! # Service Invariants
//!
//! - **Pull Loop**: One inbound message at a time is taken from the transport
//!   and handed to a worker. At most `max_in_flight` workers run at once.
//! - **Replies Only**: The service never initiates traffic. Every send answers
//!   an inbound message through a reply handle.
//! - **No Dangling Challenges**: A challenge that could not be delivered is
//!   abandoned immediately. The rest are purged once their TTL lapses.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use blindpost_core::{ChallengeStore, Destination, Directory, IdentityStore};
use blindpost_transport::{Inbound, Transport, TransportError};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub use config::{ConfigError, ServerConfig};

/// Serve `directory` over `transport` until `shutdown` resolves.
///
/// Returns an error only if the transport fails. Workers already running
/// finish on their own.
pub async fn serve<T, I, C, F>(
    transport: Arc<T>,
    directory: Arc<Directory<I, C>>,
    config: &ServerConfig,
    shutdown: F,
) -> Result<(), TransportError>
where
    T: Transport + 'static,
    I: IdentityStore + 'static,
    C: ChallengeStore + 'static,
    F: Future<Output = ()>,
{
    let cleanup = tokio::spawn(purge_loop(Arc::clone(&directory), config.cleanup_interval));
    let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    info!(
        address = %transport.address(),
        directory = %directory.public_key().fingerprint(),
        max_in_flight = config.max_in_flight,
        "directory serving"
    );

    tokio::pin!(shutdown);
    let result = loop {
        let permit = tokio::select! {
            _ = &mut shutdown => break Ok(()),
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break Ok(()),
            },
        };
        let inbound = tokio::select! {
            _ = &mut shutdown => break Ok(()),
            inbound = transport.receive() => match inbound {
                Ok(inbound) => inbound,
                Err(e) => break Err(e),
            },
        };

        let transport = Arc::clone(&transport);
        let directory = Arc::clone(&directory);
        tokio::spawn(async move {
            handle_one(transport.as_ref(), &directory, inbound).await;
            drop(permit);
        });
    };

    cleanup.abort();
    match &result {
        Ok(()) => info!("directory stopped"),
        Err(e) => warn!(error = %e, "directory stopped on transport failure"),
    }
    result
}

async fn handle_one<T, I, C>(transport: &T, directory: &Directory<I, C>, inbound: Inbound)
where
    T: Transport,
    I: IdentityStore,
    C: ChallengeStore,
{
    for out in directory.handle_inbound(&inbound.payload, inbound.reply.as_ref()) {
        let kind = out.kind;
        let sent = transport
            .send(out.payload, Destination::Reply(out.destination), 0)
            .await;
        let Err(e) = sent else {
            continue;
        };
        warn!(?kind, error = %e, "reply not delivered");
        if let Some(handle) = out.challenge_for {
            match directory.abandon_challenge(&handle) {
                Ok(removed) => debug!(%handle, removed, "challenge abandoned"),
                Err(e) => warn!(%handle, error = %e, "failed to abandon challenge"),
            }
        }
    }
}

async fn purge_loop<I, C>(directory: Arc<Directory<I, C>>, every: Duration)
where
    I: IdentityStore,
    C: ChallengeStore,
{
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match directory.purge_expired() {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "expired challenges purged"),
            Err(e) => warn!(error = %e, "challenge purge failed"),
        }
    }
}
