//! Wiring of the agent's long-lived parts.

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::commands::{CommandContext, CommandRegistry};
use crate::config::AgentConfig;
use crate::errors::{AgentError, Result};
use crate::persistence::WatchStore;
use crate::sampler::Sampler;
use crate::server::{Server, ServerContext, ShutdownTx};
use crate::token_store::SharedTokenStore;
use crate::watcher::WatchManager;

/// A bound, ready-to-run agent
pub struct Agent {
    server: Server,
    sampler: Arc<Sampler>,
    watches: Arc<WatchManager>,
}

impl Agent {
    /// Open storage, reconcile stale watches, start sampling and bind the listener
    pub async fn start(config: &AgentConfig, tokens: SharedTokenStore) -> Result<Self> {
        let store = WatchStore::new(&config.storage.db_dir)?;
        let watches = Arc::new(WatchManager::new(store, config.limits.watch.clone()));
        watches
            .reconcile()
            .map_err(|e| AgentError::Storage(e.to_string()))?;

        if config.auth.required && tokens.is_empty() {
            warn!("Authentication is required but no tokens are loaded; every auth attempt will fail");
        }

        let sampler = Arc::new(Sampler::new(&config.limits.sampler));
        sampler.start();

        let commands = Arc::new(CommandContext {
            sampler: sampler.clone(),
            watches: watches.clone(),
            oscmd_whitelist: config.security.oscmd_whitelist.clone(),
            command_timeout: config.limits.command_timeout,
        });
        let ctx = Arc::new(ServerContext {
            tokens,
            registry: Arc::new(CommandRegistry::standard()),
            commands,
            auth_required: config.auth.required,
            remote_ip_whitelist: config.security.remote_ip_whitelist.clone(),
        });

        let server = Server::bind(&config.listen_addr(), ctx).await?;
        Ok(Self {
            server,
            sampler,
            watches,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownTx {
        self.server.shutdown_handle()
    }

    /// Serve until shut down, then stop the sampler and live watches
    pub async fn run(self) -> Result<()> {
        let result = self.server.run().await;
        self.sampler.stop();
        self.watches.shutdown();
        info!("Agent stopped");
        result
    }
}
