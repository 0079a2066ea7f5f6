//! grantline-sync - follow real-time channels from the command line
//!
//! Connects with the environment configuration, subscribes to the
//! configured channels and logs every state change and update until Ctrl-C.

use std::rc::Rc;

use anyhow::Context;
use grantline_client::config::{IdentityConfig, SyncConfig};
use grantline_client::ws::{
    event_loop, ChannelFacade, ConnectionManager, DataCache, SyncDriver, TokioScheduler, WsTransport,
};
use grantline_shared::UpdateEnvelope;
use tracing_subscriber::EnvFilter;

/// Stand-in for the application's data cache: logs what would be merged.
struct LoggingCache;

impl DataCache for LoggingCache {
    fn merge(&self, channel: &str, update: &UpdateEnvelope) {
        tracing::info!(
            %channel,
            message_type = %update.message_type,
            timestamp = %update.timestamp,
            payload = %update.payload,
            "update"
        );
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("grantline_client=debug")),
        )
        .init();

    let config = SyncConfig::from_env();
    let session = IdentityConfig::from_env();
    url::Url::parse(&config.url).with_context(|| format!("invalid GRANTLINE_WS_URL '{}'", config.url))?;
    if session.identity.is_none() {
        anyhow::bail!("GRANTLINE_USER_ID and GRANTLINE_TENANT_ID must be set");
    }

    let (events, receiver) = event_loop();
    let manager = ConnectionManager::new(
        config.reconnect.clone(),
        WsTransport::new(config.url.clone(), events.clone()),
        TokioScheduler::new(events),
    );

    let _state = manager.on_state_change(|state| tracing::info!(%state, "sync state"));
    let cache: Rc<dyn DataCache> = Rc::new(LoggingCache);
    let facades: Vec<ChannelFacade> = session
        .channels
        .iter()
        .map(|channel| ChannelFacade::with_cache(&manager, channel, cache.clone()))
        .collect();
    tracing::info!(channels = ?session.channels, url = %config.url, "following channels");

    manager.sync_identity(&session);

    let driver = SyncDriver::new(manager.clone(), receiver);
    tokio::select! {
        _ = driver.run() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            tracing::info!("shutting down");
        }
    }

    manager.stop();
    drop(facades);
    Ok(())
}
