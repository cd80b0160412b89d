//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the sandboxed
//! filesystem, the file services and the message router from a validated
//! configuration, then runs the RPC and transfer listeners until shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::auth::{StaticTokenValidator, TokenValidator};
use crate::config::Config;
use crate::files::{FileSystemRpcHandler, FileTransferEndpointService, SandboxedFileSystem};
use crate::network::{RpcConnections, RpcServer, TransferServer};
use crate::router::MessageRouter;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Which listener an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Listener {
    /// WebSocket RPC channel.
    Rpc,
    /// HTTP file transfer channel.
    Transfer,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A listener is bound and accepting connections.
    ListenerBound { listener: Listener, addr: SocketAddr },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// The one sandbox shared by every file operation.
    filesystem: Arc<SandboxedFileSystem>,
    /// Upload and download handling.
    transfer: Arc<FileTransferEndpointService>,
    /// Message router.
    router: Arc<MessageRouter>,
    /// Credential check for both listeners.
    auth: Arc<dyn TokenValidator>,
    /// Live RPC connections.
    connections: Arc<RpcConnections>,
    /// Bound addresses, set once started.
    rpc_addr: Option<SocketAddr>,
    transfer_addr: Option<SocketAddr>,
    /// Listener tasks.
    tasks: TaskTracker,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator.
    ///
    /// The configuration is validated and the storage root is created if missing.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let root = &config.transfer.storage_root_path;
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create storage root: {}", root.display()))?;

        let filesystem = Arc::new(
            SandboxedFileSystem::local(root)
                .with_context(|| format!("Failed to open storage root: {}", root.display()))?,
        );
        info!(root = %filesystem.root().display(), "Storage root ready");

        let transfer = Arc::new(FileTransferEndpointService::new(
            Arc::clone(&filesystem),
            &config.transfer,
        ));
        let files = Arc::new(FileSystemRpcHandler::new(Arc::clone(&filesystem)));
        let router = Arc::new(MessageRouter::new(files, Arc::clone(&transfer)));

        let auth: Arc<dyn TokenValidator> =
            Arc::new(StaticTokenValidator::new(config.security.auth_tokens.clone()));
        let connections = Arc::new(RpcConnections::new(Duration::from_secs(
            config.network.rpc_timeout_secs,
        )));

        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            filesystem,
            transfer,
            router,
            auth,
            connections,
            rpc_addr: None,
            transfer_addr: None,
            tasks: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Binds both listeners and starts serving.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.bind_listeners().await {
            *self.state.write().await = OrchestratorState::Stopped;
            self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started");
        Ok(())
    }

    async fn bind_listeners(&mut self) -> Result<()> {
        let network = &self.config.network;
        let rpc_listen: SocketAddr = network
            .rpc_listen
            .parse()
            .with_context(|| format!("Invalid RPC listen address: {}", network.rpc_listen))?;
        let transfer_listen: SocketAddr = network.transfer_listen.parse().with_context(|| {
            format!("Invalid transfer listen address: {}", network.transfer_listen)
        })?;
        let keepalive = (network.keepalive_interval_secs > 0)
            .then(|| Duration::from_secs(network.keepalive_interval_secs));

        let rpc = RpcServer::bind(
            rpc_listen,
            Arc::clone(&self.router),
            Arc::clone(&self.auth),
            Arc::clone(&self.connections),
            keepalive,
        )
        .await
        .with_context(|| format!("Failed to bind RPC listener on {rpc_listen}"))?;

        let transfer = TransferServer::bind(
            transfer_listen,
            Arc::clone(&self.transfer),
            Arc::clone(&self.auth),
        )
        .await
        .with_context(|| format!("Failed to bind transfer listener on {transfer_listen}"))?;

        let rpc_addr = rpc.local_addr()?;
        let transfer_addr = transfer.local_addr()?;
        self.rpc_addr = Some(rpc_addr);
        self.transfer_addr = Some(transfer_addr);

        self.tasks.spawn(rpc.run(self.shutdown_token.child_token()));
        self.tasks
            .spawn(transfer.run(self.shutdown_token.child_token()));

        info!(%rpc_addr, "RPC listener bound");
        info!(%transfer_addr, "Transfer listener bound");
        self.emit_event(OrchestratorEvent::ListenerBound {
            listener: Listener::Rpc,
            addr: rpc_addr,
        });
        self.emit_event(OrchestratorEvent::ListenerBound {
            listener: Listener::Transfer,
            addr: transfer_addr,
        });
        Ok(())
    }

    /// Stops both listeners and waits for open connections to finish.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Running {
                debug!(state = ?*state, "Stop requested while not running");
                return Ok(());
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");

        // Signal shutdown to all tasks
        self.shutdown_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Address of the RPC listener, once started.
    pub fn rpc_addr(&self) -> Option<SocketAddr> {
        self.rpc_addr
    }

    /// Address of the transfer listener, once started.
    pub fn transfer_addr(&self) -> Option<SocketAddr> {
        self.transfer_addr
    }

    /// Returns the sandboxed filesystem.
    pub fn filesystem(&self) -> &Arc<SandboxedFileSystem> {
        &self.filesystem
    }

    /// Returns the message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// Returns the live RPC connections.
    pub fn connections(&self) -> &Arc<RpcConnections> {
        &self.connections
    }

    /// Returns the number of active RPC connections.
    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().to_path_buf();
        config.transfer.storage_root_path = temp_dir.path().join("storage");
        config.network.rpc_listen = "127.0.0.1:0".to_string();
        config.network.transfer_listen = "127.0.0.1:0".to_string();
        config.security.auth_tokens = vec!["test-token".to_string()];
        config
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(temp_dir.path().join("storage").is_dir());
        assert!(orchestrator.rpc_addr().is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.security.auth_tokens.clear();

        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let mut orchestrator = DaemonOrchestrator::new(config).unwrap();
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert_ne!(orchestrator.rpc_addr().unwrap().port(), 0);
        assert_ne!(orchestrator.transfer_addr().unwrap().port(), 0);
        assert_eq!(orchestrator.connection_count(), 0);

        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.shutdown_token().is_cancelled());

        let mut bound = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, OrchestratorEvent::ListenerBound { .. }) {
                bound += 1;
            }
        }
        assert_eq!(bound, 2);
    }

    #[tokio::test]
    async fn test_stop_when_not_running() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);

        let orchestrator = DaemonOrchestrator::new(config).unwrap();
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = create_test_config(&temp_dir);
        config.network.rpc_listen = occupied.local_addr().unwrap().to_string();

        let mut orchestrator = DaemonOrchestrator::new(config).unwrap();
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }
}
