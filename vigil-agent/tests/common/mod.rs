//! Shared harness: an agent on an ephemeral port with its own data directory.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use vigil_agent::Agent;
use vigil_agent::config::AgentConfig;
use vigil_agent::errors::Result;
use vigil_agent::server::ShutdownTx;
use vigil_agent::token_store::TokenStore;
use vigil_protocol::client::Client;

pub const TOKEN: &str = "T";

pub struct TestAgent {
    pub addr: SocketAddr,
    pub dir: TempDir,
    shutdown: ShutdownTx,
    task: JoinHandle<Result<()>>,
}

impl TestAgent {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start an agent after letting the caller adjust its config
    pub async fn start_with(configure: impl FnOnce(&mut AgentConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = AgentConfig::default();
        config.port = 0;
        config.storage.db_dir = dir.path().join("data");
        config.limits.watch.max_duration = Duration::from_secs(60);
        config.security.oscmd_whitelist = vec!["echo".to_string(), "uptime".to_string()];
        configure(&mut config);

        let tokens = Arc::new(TokenStore::from_tokens([TOKEN]));
        let agent = Agent::start(&config, tokens).await.unwrap();
        let addr = agent.local_addr().unwrap();
        let shutdown = agent.shutdown_handle();
        let task = tokio::spawn(agent.run());

        Self {
            addr,
            dir,
            shutdown,
            task,
        }
    }

    /// A fresh directory under the agent's temp dir
    pub fn make_dir(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    pub async fn client(&self) -> Client {
        Client::connect(self.addr).await.unwrap()
    }

    pub async fn authenticated_client(&self) -> Client {
        let mut client = self.client().await;
        let response = client.authenticate(TOKEN).await.unwrap();
        assert!(response.is_ok(), "auth failed: {:?}", response);
        client
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(()).await;
        let result = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        assert!(matches!(result, Ok(Ok(Ok(())))), "agent did not stop cleanly");
    }
}
