//! Node orchestrator for wiring together all components.
//!
//! [`NodeOrchestrator`] builds every subsystem from a [`Config`] (cipher,
//! identity, permission store, services, RPC router, transport and HTTP
//! server) and owns the lifecycle of the two listeners.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::{DeviceIdentity, PayloadCipher};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fs::LocalFileSystem;
use crate::http::HttpServer;
use crate::identity;
use crate::pairing::PeerTable;
use crate::permissions::{JsonPermissionStore, PermissionCache};
use crate::router::RpcRouter;
use crate::services::{ServiceContext, Services};
use crate::transport::{
    self, MessageCallback, ScanOptions, TransportClient, TransportContext, TransportServer,
};

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    StateChanged(NodeState),
    TransportListening(SocketAddr),
    HttpListening(SocketAddr),
    ScanFinished { found: usize },
    Error { message: String },
}

/// Owns and coordinates every subsystem of one node.
pub struct NodeOrchestrator {
    config: Config,
    identity: DeviceIdentity,
    cipher: PayloadCipher,
    permissions: Arc<PermissionCache>,
    services: Services,
    router: RpcRouter,
    transport: Arc<TransportContext>,
    http: HttpServer,
    state: Arc<RwLock<NodeState>>,
    transport_task: Mutex<Option<(SocketAddr, JoinHandle<()>)>>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<NodeEvent>,
}

impl NodeOrchestrator {
    /// Build every component. Nothing is bound until [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let cipher = config.cipher()?;

        let identity = identity::load_or_generate(
            &config.identity_path(),
            &cipher,
            &config.node.display_name,
            config.network.transport_port,
        )
        .context("Failed to load device identity")?;
        info!(device_id = %identity.id, name = %identity.display_name, "Node identity");

        let store = JsonPermissionStore::new(config.permissions_path());
        store.load().context("Failed to load permission store")?;
        let permissions = Arc::new(PermissionCache::new(Arc::new(store)));

        let services = Services::new(ServiceContext {
            identity: identity.clone(),
            http_port: config.network.http_port,
            root_paths: config.file.root_paths.clone(),
            bookmarks: config.file.bookmarks.clone(),
            traverse_batch_size: config.file.traverse_batch_size,
            permissions: permissions.clone(),
            fs: Arc::new(LocalFileSystem::new()),
        });
        let router = RpcRouter::new(
            services.clone(),
            cipher.clone(),
            config.network.max_chunk_size,
        );

        let transport = Arc::new(
            TransportContext::new(identity.clone(), cipher.clone(), Arc::new(PeerTable::new()))
                .with_blocked_devices(config.security.blocked_devices.iter().cloned()),
        );
        let http = HttpServer::new(
            SocketAddr::new(config.network.bind_address, config.network.http_port),
            services.clone(),
            cipher.clone(),
        );

        let (event_tx, _) = broadcast::channel(256);

        Ok(Self {
            config,
            identity,
            cipher,
            permissions,
            services,
            router,
            transport,
            http,
            state: Arc::new(RwLock::new(NodeState::Stopped)),
            transport_task: Mutex::new(None),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cipher(&self) -> &PayloadCipher {
        &self.cipher
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.transport.peers
    }

    pub fn permissions(&self) -> &Arc<PermissionCache> {
        &self.permissions
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn router(&self) -> &RpcRouter {
        &self.router
    }

    pub async fn state(&self) -> NodeState {
        *self.state.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }

    /// Observed by every task the orchestrator starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn transport_addr(&self) -> Option<SocketAddr> {
        self.transport_task.lock().await.as_ref().map(|(addr, _)| *addr)
    }

    pub async fn http_addr(&self) -> Option<SocketAddr> {
        self.http.local_addr().await
    }

    /// Bind the transport listener and the HTTP server.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != NodeState::Stopped {
                anyhow::bail!("Node is already running");
            }
            *state = NodeState::Starting;
        }
        self.emit_event(NodeEvent::StateChanged(NodeState::Starting));
        info!("Starting node...");

        if self.shutdown_token.is_cancelled() {
            self.shutdown_token = CancellationToken::new();
        }

        if let Err(e) = self.start_listeners().await {
            warn!("Node failed to start: {:#}", e);
            self.shutdown_token.cancel();
            if let Some((_, task)) = self.transport_task.lock().await.take() {
                let _ = task.await;
            }
            self.http.stop().await;
            *self.state.write().await = NodeState::Stopped;
            self.emit_event(NodeEvent::Error {
                message: format!("{:#}", e),
            });
            self.emit_event(NodeEvent::StateChanged(NodeState::Stopped));
            return Err(e);
        }

        *self.state.write().await = NodeState::Running;
        self.emit_event(NodeEvent::StateChanged(NodeState::Running));
        info!("Node started");
        Ok(())
    }

    async fn start_listeners(&self) -> Result<()> {
        let network = &self.config.network;
        let transport_bind = SocketAddr::new(network.bind_address, network.transport_port);
        let server = TransportServer::bind(transport_bind, self.transport.clone(), self.router.clone())
            .await
            .with_context(|| format!("Failed to bind transport on {}", transport_bind))?;
        let transport_addr = server.local_addr()?;
        let task = tokio::spawn(server.run(self.shutdown_token.child_token()));
        *self.transport_task.lock().await = Some((transport_addr, task));
        self.emit_event(NodeEvent::TransportListening(transport_addr));

        let http_addr = self
            .http
            .start()
            .await
            .with_context(|| format!("Failed to bind HTTP server on port {}", network.http_port))?;
        self.emit_event(NodeEvent::HttpListening(http_addr));
        Ok(())
    }

    /// Stop both listeners and every open connection.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == NodeState::Stopped {
                return Ok(());
            }
            if *state == NodeState::ShuttingDown {
                anyhow::bail!("Node is already shutting down");
            }
            *state = NodeState::ShuttingDown;
        }
        self.emit_event(NodeEvent::StateChanged(NodeState::ShuttingDown));
        info!("Stopping node...");

        self.shutdown_token.cancel();
        if let Some((addr, task)) = self.transport_task.lock().await.take() {
            debug!(%addr, "Waiting for transport server");
            let _ = task.await;
        }
        self.http.stop().await;

        *self.state.write().await = NodeState::Stopped;
        self.emit_event(NodeEvent::StateChanged(NodeState::Stopped));
        info!("Node stopped");
        Ok(())
    }

    /// Open an outbound connection to a peer.
    pub async fn connect(
        &self,
        addr: SocketAddr,
        on_message: MessageCallback,
    ) -> Result<TransportClient> {
        TransportClient::connect(addr, self.transport.clone(), on_message)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))
    }

    /// Reconnect to a peer already known by id. The attempt shows up in the
    /// peer table as `Loading` and ends `Connected` or `Failed`.
    pub async fn reconnect(
        &self,
        device_id: &str,
        addr: SocketAddr,
        on_message: MessageCallback,
    ) -> Result<TransportClient> {
        TransportClient::reconnect(addr, device_id, self.transport.clone(), on_message)
            .await
            .with_context(|| format!("Failed to reconnect to {} at {}", device_id, addr))
    }

    /// Scan `addresses`, or the local /24 when empty, for peers listening on
    /// `port` (the configured transport port by default).
    pub async fn scan(&self, addresses: Vec<IpAddr>, port: Option<u16>) -> Result<Vec<DeviceIdentity>> {
        let addresses = if addresses.is_empty() {
            let local = transport::local_ipv4().context("Failed to determine local address")?;
            transport::candidate_addresses(local)
        } else {
            addresses
        };

        let network = &self.config.network;
        let options = ScanOptions {
            port: port.unwrap_or(network.transport_port),
            timeout: Duration::from_millis(network.scan_timeout_ms),
            concurrency: network.scan_concurrency,
        };
        info!(candidates = addresses.len(), port = options.port, "Scanning for peers");

        let found = transport::scan(
            addresses,
            self.transport.clone(),
            options,
            self.shutdown_token.child_token(),
        )
        .await;
        self.emit_event(NodeEvent::ScanFinished { found: found.len() });
        Ok(found)
    }

    fn emit_event(&self, event: NodeEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpListener};

    use tempfile::TempDir;

    use super::*;
    use crate::pairing::ConnectionState;

    /// Two distinct ports that were free a moment ago.
    fn free_ports() -> (u16, u16) {
        let a = TcpListener::bind("127.0.0.1:0").unwrap();
        let b = TcpListener::bind("127.0.0.1:0").unwrap();
        (a.local_addr().unwrap().port(), b.local_addr().unwrap().port())
    }

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.node.data_dir = temp_dir.path().to_path_buf();
        config.node.display_name = "orchestrator-test".to_string();
        config.network.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let (transport_port, http_port) = free_ports();
        config.network.transport_port = transport_port;
        config.network.http_port = http_port;
        config.network.scan_timeout_ms = 500;
        config.file.root_paths = vec![temp_dir.path().to_path_buf()];
        config.security.secret = Some("orchestrator-secret".to_string());
        config
    }

    #[test]
    fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = NodeOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        assert_eq!(orchestrator.identity().display_name, "orchestrator-test");
        assert!(temp_dir.path().join("identity.bin").exists());
    }

    #[test]
    fn test_identity_survives_restart() {
        let temp_dir = TempDir::new().unwrap();
        let config = create_test_config(&temp_dir);
        let first = NodeOrchestrator::new(config.clone()).unwrap().identity().id.clone();
        let second = NodeOrchestrator::new(config).unwrap().identity().id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        config.security.secret = None;
        assert!(NodeOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = NodeOrchestrator::new(create_test_config(&temp_dir)).unwrap();
        let mut events = orchestrator.subscribe();
        assert_eq!(orchestrator.state().await, NodeState::Stopped);

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, NodeState::Running);
        assert!(orchestrator.transport_addr().await.is_some());
        assert!(orchestrator.http_addr().await.is_some());
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, NodeState::Stopped);
        assert!(orchestrator.http_addr().await.is_none());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                NodeState::Starting,
                NodeState::Running,
                NodeState::ShuttingDown,
                NodeState::Stopped
            ]
        );

        // Restartable after a stop.
        orchestrator.start().await.unwrap();
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_when_port_taken() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = create_test_config(&temp_dir);
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        config.network.http_port = blocker.local_addr().unwrap().port();

        let mut orchestrator = NodeOrchestrator::new(config).unwrap();
        assert!(orchestrator.start().await.is_err());
        assert_eq!(orchestrator.state().await, NodeState::Stopped);
        assert!(orchestrator.transport_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_two_nodes_pair_and_scan() {
        let temp_a = TempDir::new().unwrap();
        let temp_b = TempDir::new().unwrap();
        let mut a = NodeOrchestrator::new(create_test_config(&temp_a)).unwrap();
        let b = NodeOrchestrator::new(create_test_config(&temp_b)).unwrap();
        a.start().await.unwrap();

        let a_port = a.transport_addr().await.unwrap().port();
        let found = b
            .scan(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)], Some(a_port))
            .await
            .unwrap();
        assert_eq!(found, vec![a.identity().clone()]);

        let client = b
            .connect(a.transport_addr().await.unwrap(), Arc::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(
            b.peers().state(&a.identity().id),
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            a.peers().state(&b.identity().id),
            Some(ConnectionState::Connected)
        );

        client.disconnect().await;
        assert_eq!(
            b.peers().state(&a.identity().id),
            Some(ConnectionState::Disconnected)
        );

        let again = b
            .reconnect(&a.identity().id, a.transport_addr().await.unwrap(), Arc::new(|_| {}))
            .await
            .unwrap();
        let history = b.peers().history(&a.identity().id);
        assert_eq!(
            history[history.len() - 3..],
            [
                ConnectionState::Disconnected,
                ConnectionState::Loading,
                ConnectionState::Connected
            ]
        );

        again.disconnect().await;
        a.stop().await.unwrap();
    }
}
