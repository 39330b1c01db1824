use std::sync::Arc;

use anyhow::Context;
use blindpost_core::{Directory, MemoryChallengeStore, MemoryIdentityStore};
use blindpost_server::{serve, ServerConfig};
use blindpost_transport::{NymClientTransport, Transport};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let identity = config.directory_identity().context("invalid directory key")?;
    info!(public_key = %identity.public_key(), "directory identity");

    let transport = NymClientTransport::connect(&config.nym_client_url)
        .await
        .with_context(|| format!("connecting to nym client at {}", config.nym_client_url))?;
    info!(address = %transport.address(), "directory listening");

    let directory = Directory::new(
        identity,
        MemoryIdentityStore::new(),
        MemoryChallengeStore::new(),
        config.directory_config(),
    );

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // No signal handler. Run until the transport fails.
            std::future::pending::<()>().await;
        }
    };
    serve(Arc::new(transport), Arc::new(directory), &config, shutdown)
        .await
        .context("transport failed")?;
    Ok(())
}
