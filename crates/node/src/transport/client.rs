//! Dialing side of the transport.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use protocol::{
    commands, params, ChunkProgress, DeviceIdentity, Envelope, Payload, ProtocolError,
    Reassembler, RpcReply, RpcRequest, RpcValue,
};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{spawn_writer, EnvelopeReader, TransportContext};
use crate::pairing::{ConnectionState, PeerHandle, PeerTable};

/// Invoked for every received envelope that is not a reply to one of our
/// own calls.
pub type MessageCallback = Arc<dyn Fn(Envelope) + Send + Sync>;

type ReplySender = mpsc::UnboundedSender<RpcReply<RpcValue>>;

/// Budget for connect plus handshake when no tighter one is given.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct PendingReplies {
    waiting: Mutex<HashMap<String, ReplySender>>,
    chunks: Reassembler,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, ReplySender>> {
        self.waiting.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route a reply envelope to its waiting caller. Returns the envelope
    /// back if nobody is waiting for it.
    fn deliver(&self, envelope: Envelope, context: &TransportContext) -> Option<Envelope> {
        let Some(reply_key) = envelope.reply_key().map(str::to_string) else {
            return Some(envelope);
        };
        let Some(sender) = self.lock().get(&reply_key).cloned() else {
            return Some(envelope);
        };

        let body = match self.chunks.accept(&envelope) {
            Ok(ChunkProgress::Partial { .. }) => return None,
            Ok(ChunkProgress::Complete(body)) => body,
            Err(e) => {
                debug!(%reply_key, "Dropping reply: {}", e);
                self.lock().remove(&reply_key);
                return None;
            }
        };

        match Payload::decode(&body, &context.cipher) {
            Ok(Payload::Reply(reply)) => {
                let _ = sender.send(reply);
            }
            Ok(other) => debug!(%reply_key, kind = other.kind(), "Unexpected reply payload"),
            Err(e) => debug!(%reply_key, "Undecodable reply: {}", e),
        }

        // Streaming replies say `done=false` until their last message.
        if envelope.param(params::DONE) != Some("false") {
            self.lock().remove(&reply_key);
        }
        None
    }
}

/// An outbound connection to one peer.
pub struct TransportClient {
    remote: SocketAddr,
    peer: DeviceIdentity,
    context: Arc<TransportContext>,
    handle: PeerHandle,
    pending: Arc<PendingReplies>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportClient")
            .field("remote", &self.remote)
            .field("peer", &self.peer.id)
            .finish_non_exhaustive()
    }
}

/// A socket that completed the handshake exchange, before the peer table
/// has been updated.
struct Opened {
    remote: SocketAddr,
    reader: EnvelopeReader<OwnedReadHalf>,
    handle: PeerHandle,
    writer: JoinHandle<()>,
    reply: Envelope,
    peer: DeviceIdentity,
}

impl TransportClient {
    /// Connect, handshake and start the receive loop.
    ///
    /// Fails with [`ProtocolError::Rejected`] if the peer refuses us.
    pub async fn connect(
        addr: SocketAddr,
        context: Arc<TransportContext>,
        on_message: MessageCallback,
    ) -> Result<Self, ProtocolError> {
        Self::dial(addr, None, context, on_message, HANDSHAKE_TIMEOUT).await
    }

    /// Connect to a peer we already know by id. The attempt is tracked in
    /// the peer table: the record moves to `Loading` before dialing and to
    /// `Failed` if the socket breaks or the handshake times out.
    pub async fn reconnect(
        addr: SocketAddr,
        device_id: &str,
        context: Arc<TransportContext>,
        on_message: MessageCallback,
    ) -> Result<Self, ProtocolError> {
        Self::dial(addr, Some(device_id), context, on_message, HANDSHAKE_TIMEOUT).await
    }

    pub(crate) async fn dial(
        addr: SocketAddr,
        expected: Option<&str>,
        context: Arc<TransportContext>,
        on_message: MessageCallback,
        timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let peers = &context.peers;
        if let Some(id) = expected {
            if peers.state(id) != Some(ConnectionState::Connected) {
                if let Err(e) = peers.transition(id, ConnectionState::Loading) {
                    debug!(device_id = id, "Attempt not tracked: {}", e);
                }
            }
        }

        let opened = match tokio::time::timeout(timeout, open(addr, &context)).await {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                if let Some(id) = expected {
                    mark_failed(peers, id, &e);
                }
                return Err(e);
            }
            Err(_) => {
                let e = ProtocolError::Timeout(format!("handshake with {}", addr));
                if let Some(id) = expected {
                    mark_failed(peers, id, &e);
                }
                return Err(e);
            }
        };
        let Opened {
            remote,
            reader,
            handle,
            writer,
            reply,
            peer,
        } = opened;

        if let Some(id) = expected.filter(|id| *id != peer.id) {
            let e = ProtocolError::Protocol(format!("{} answered as {}", addr, peer.id));
            mark_failed(peers, id, &e);
        }

        if reply.command() == commands::CONNECT_REJECTED {
            let reason = reply.param(params::REASON).unwrap_or("no reason given");
            info!(device_id = %peer.id, %remote, reason, "Handshake rejected");
            record_refusal(peers, &peer.id);
            return Err(ProtocolError::Rejected {
                device_id: peer.id,
                reason: reason.to_string(),
            });
        }

        admit(peers, peer.clone(), remote, handle.clone())
            .map_err(|e| ProtocolError::Protocol(e.to_string()))?;
        info!(device_id = %peer.id, name = %peer.display_name, %remote, "Connected to peer");

        let pending = Arc::new(PendingReplies::default());
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(receive_loop(
            reader,
            ReceiveState {
                remote,
                peer_id: peer.id.clone(),
                context: context.clone(),
                pending: pending.clone(),
                on_message,
                cancel: cancel.clone(),
            },
        ));

        Ok(Self {
            remote,
            peer,
            context,
            handle,
            pending,
            cancel,
            reader,
            writer,
        })
    }

    /// Identity the peer presented in the handshake.
    pub fn peer(&self) -> &DeviceIdentity {
        &self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Queue one envelope on the connection.
    pub async fn send(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.handle
            .send(envelope)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed(format!("{} is gone", self.remote)))
    }

    /// Issue a request and wait for its single reply.
    pub async fn call(
        &self,
        request: RpcRequest,
        token: &str,
    ) -> Result<RpcReply<RpcValue>, ProtocolError> {
        let mut replies = self.stream(request, token).await?;
        replies.recv().await.ok_or_else(|| {
            ProtocolError::ConnectionClosed("connection closed before reply".to_string())
        })
    }

    /// Issue a request whose replies arrive as a stream, as `Path.traverse`
    /// does. The receiver ends after the final reply.
    pub async fn stream(
        &self,
        request: RpcRequest,
        token: &str,
    ) -> Result<mpsc::UnboundedReceiver<RpcReply<RpcValue>>, ProtocolError> {
        let reply_key = uuid::Uuid::new_v4().to_string();
        let envelope = Envelope::new(commands::RPC)
            .with_target(&self.peer.id)
            .with_param(params::REPLY_KEY, &reply_key)
            .with_param(params::TOKEN, token)
            .with_body(Payload::Request(request).encode(&self.context.cipher)?);

        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(reply_key.clone(), tx);
        if let Err(e) = self.send(envelope).await {
            self.pending.lock().remove(&reply_key);
            return Err(e);
        }
        Ok(rx)
    }

    /// Close the connection and wait for both loops to finish.
    pub async fn disconnect(self) {
        self.cancel.cancel();
        let _ = self.reader.await;
        drop(self.handle);
        let _ = self.writer.await;
        debug!(remote = %self.remote, "Disconnected");
    }
}

/// Dial `addr` and exchange handshakes.
async fn open(addr: SocketAddr, context: &TransportContext) -> Result<Opened, ProtocolError> {
    let stream = TcpStream::connect(addr).await?;
    let remote = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();
    let (handle, writer) = spawn_writer(write_half);

    handle
        .send(context.handshake()?)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed("writer stopped".to_string()))?;

    let mut reader = EnvelopeReader::new(read_half);
    let reply = reader.next().await?.ok_or_else(|| {
        ProtocolError::ConnectionClosed("closed during handshake".to_string())
    })?;
    let peer = match reply.command() {
        commands::CONNECT | commands::CONNECT_REJECTED => context.open_identity(&reply)?,
        other => {
            return Err(ProtocolError::Protocol(format!(
                "unexpected handshake reply: {}",
                other
            )))
        }
    };

    Ok(Opened {
        remote,
        reader,
        handle,
        writer,
        reply,
        peer,
    })
}

/// Close out a tracked attempt that never produced a usable connection.
fn mark_failed(peers: &PeerTable, device_id: &str, cause: &ProtocolError) {
    if peers.state(device_id) != Some(ConnectionState::Loading) {
        return;
    }
    warn!(device_id, "Connection attempt failed: {}", cause);
    if let Err(e) = peers.transition(device_id, ConnectionState::Failed) {
        debug!(device_id, "Failure not recorded: {}", e);
    }
}

/// Record an explicit refusal. A peer already connected on another address
/// keeps its state.
fn record_refusal(peers: &PeerTable, device_id: &str) {
    let recorded = match peers.state(device_id) {
        Some(ConnectionState::Connected) => {
            debug!(device_id, "Refused on a new address, keeping existing connection");
            return;
        }
        Some(ConnectionState::Loading) => peers.transition(device_id, ConnectionState::Rejected),
        _ => peers
            .transition(device_id, ConnectionState::Loading)
            .and_then(|_| peers.transition(device_id, ConnectionState::Rejected)),
    };
    if let Err(e) = recorded {
        debug!(device_id, "Refusal not recorded: {}", e);
    }
}

/// Record a handshaked peer as connected, passing through `Loading` unless
/// it already is connected on another address.
fn admit(
    peers: &PeerTable,
    identity: DeviceIdentity,
    address: SocketAddr,
    handle: PeerHandle,
) -> Result<(), crate::pairing::PairingError> {
    let id = identity.id.clone();
    match peers.state(&id) {
        Some(ConnectionState::Connected) => {
            return peers.record_identity(identity, address, handle);
        }
        Some(ConnectionState::Loading) => {}
        _ => {
            peers.transition(&id, ConnectionState::Loading)?;
        }
    }
    peers.record_identity(identity, address, handle)?;
    peers.transition(&id, ConnectionState::Connected)?;
    Ok(())
}

struct ReceiveState {
    remote: SocketAddr,
    peer_id: String,
    context: Arc<TransportContext>,
    pending: Arc<PendingReplies>,
    on_message: MessageCallback,
    cancel: CancellationToken,
}

async fn receive_loop(mut reader: EnvelopeReader<OwnedReadHalf>, state: ReceiveState) {
    loop {
        let next = tokio::select! {
            _ = state.cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Ok(Some(envelope)) => {
                if let Some(envelope) = state.pending.deliver(envelope, &state.context) {
                    (state.on_message)(envelope);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(remote = %state.remote, "Receive loop stopped: {}", e);
                break;
            }
        }
    }

    // Callers still waiting see their channel close.
    state.pending.lock().clear();

    let peers = &state.context.peers;
    if let Ok(0) = peers.remove_address(&state.peer_id, &state.remote) {
        if peers.state(&state.peer_id) == Some(ConnectionState::Connected) {
            if let Err(e) = peers.transition(&state.peer_id, ConnectionState::Disconnected) {
                debug!(device_id = %state.peer_id, "Disconnect not recorded: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use protocol::PayloadCipher;
    use tempfile::TempDir;

    use super::*;
    use crate::permissions::{Action, PermissionRule};
    use crate::router::RpcRouter;
    use crate::services::test_support::{path_str, services, TOKEN};
    use crate::transport::TransportServer;

    const SECRET: &str = "client-test-secret";

    fn context(name: &str) -> Arc<TransportContext> {
        Arc::new(TransportContext::new(
            DeviceIdentity::generate(name, 0),
            PayloadCipher::from_secret(SECRET),
            Arc::new(PeerTable::new()),
        ))
    }

    async fn serve(
        context: Arc<TransportContext>,
        root: &std::path::Path,
        rules: Vec<PermissionRule>,
    ) -> (SocketAddr, CancellationToken) {
        let router = RpcRouter::new(services(root, rules), context.cipher.clone(), 4096);
        let server = TransportServer::bind("127.0.0.1:0".parse().unwrap(), context, router)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (addr, cancel)
    }

    fn ignore() -> MessageCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn test_connect_records_both_sides() {
        let temp = TempDir::new().unwrap();
        let server_ctx = context("server");
        let client_ctx = context("client");
        let (addr, cancel) = serve(server_ctx.clone(), temp.path(), vec![]).await;

        let client = TransportClient::connect(addr, client_ctx.clone(), ignore())
            .await
            .unwrap();
        assert_eq!(client.peer(), &server_ctx.identity);
        assert_eq!(
            client_ctx.peers.state(&server_ctx.identity.id),
            Some(ConnectionState::Connected)
        );
        assert_eq!(
            server_ctx.peers.identity(&client_ctx.identity.id),
            Some(client_ctx.identity.clone())
        );

        client.disconnect().await;
        assert_eq!(
            client_ctx.peers.state(&server_ctx.identity.id),
            Some(ConnectionState::Disconnected)
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_rejected_connect() {
        let temp = TempDir::new().unwrap();
        let client_ctx = context("client");
        let server_ctx = Arc::new(
            TransportContext::new(
                DeviceIdentity::generate("server", 0),
                PayloadCipher::from_secret(SECRET),
                Arc::new(PeerTable::new()),
            )
            .with_blocked_devices([client_ctx.identity.id.clone()]),
        );
        let (addr, cancel) = serve(server_ctx.clone(), temp.path(), vec![]).await;

        let err = TransportClient::connect(addr, client_ctx.clone(), ignore())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ProtocolError::Rejected { ref device_id, .. } if device_id == &server_ctx.identity.id));
        assert_eq!(
            client_ctx.peers.state(&server_ctx.identity.id),
            Some(ConnectionState::Rejected)
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_refusal_keeps_existing_connection() {
        let temp = TempDir::new().unwrap();
        let client_ctx = context("client");
        let server_ctx = Arc::new(
            TransportContext::new(
                DeviceIdentity::generate("server", 0),
                PayloadCipher::from_secret(SECRET),
                Arc::new(PeerTable::new()),
            )
            .with_blocked_devices([client_ctx.identity.id.clone()]),
        );
        let server_id = server_ctx.identity.id.clone();
        client_ctx.peers.transition(&server_id, ConnectionState::Loading).unwrap();
        client_ctx.peers.transition(&server_id, ConnectionState::Connected).unwrap();
        let (addr, cancel) = serve(server_ctx, temp.path(), vec![]).await;

        let err = TransportClient::connect(addr, client_ctx.clone(), ignore())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Rejected { .. }));
        assert_eq!(client_ctx.peers.state(&server_id), Some(ConnectionState::Connected));
        assert_eq!(
            client_ctx.peers.history(&server_id),
            vec![ConnectionState::New, ConnectionState::Loading, ConnectionState::Connected]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_broken_handshake_marks_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Read whatever the client sends, then hang up without replying.
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let _ = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await;
        });

        let client_ctx = context("client");
        client_ctx.peers.discover("known-peer").unwrap();
        let err = TransportClient::reconnect(addr, "known-peer", client_ctx.clone(), ignore())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed(_)), "{}", err);
        assert_eq!(
            client_ctx.peers.history("known-peer"),
            vec![ConnectionState::New, ConnectionState::Loading, ConnectionState::Failed]
        );
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_as_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (hold_tx, hold_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            // Accept and keep the socket open without ever answering.
            let (_socket, _) = listener.accept().await.unwrap();
            let _ = hold_rx.await;
        });

        let client_ctx = context("client");
        let err = TransportClient::dial(
            addr,
            Some("quiet-peer"),
            client_ctx.clone(),
            ignore(),
            Duration::from_millis(200),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)), "{}", err);
        assert_eq!(client_ctx.peers.state("quiet-peer"), Some(ConnectionState::Failed));
        drop(hold_tx);
    }

    #[tokio::test]
    async fn test_call_and_chunked_reply() {
        let temp = TempDir::new().unwrap();
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 251) as u8).collect();
        std::fs::write(temp.path().join("blob"), &data).unwrap();
        let rule = PermissionRule::new(1, 1, path_str(temp.path()))
            .recursive()
            .grant(Action::Read);

        let (addr, cancel) = serve(context("server"), temp.path(), vec![rule]).await;
        let client = TransportClient::connect(addr, context("client"), ignore())
            .await
            .unwrap();

        let reply = client
            .call(
                RpcRequest::ReadBytes {
                    path: path_str(&temp.path().join("blob")),
                    offset: 0,
                    length: data.len() as u64,
                },
                TOKEN,
            )
            .await
            .unwrap();
        assert_eq!(reply, RpcReply::Success(RpcValue::Bytes(data)));

        let denied = client
            .call(RpcRequest::GetList { path: "/etc".into() }, TOKEN)
            .await
            .unwrap();
        assert!(!denied.is_success());

        client.disconnect().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stream_ends_after_done() {
        let temp = TempDir::new().unwrap();
        for i in 0..9 {
            std::fs::write(temp.path().join(format!("{}.txt", i)), b"x").unwrap();
        }
        let rule = PermissionRule::new(1, 1, path_str(temp.path()))
            .recursive()
            .grant(Action::Read);
        let (addr, cancel) = serve(context("server"), temp.path(), vec![rule]).await;
        let client = TransportClient::connect(addr, context("client"), ignore())
            .await
            .unwrap();

        let mut replies = client
            .stream(RpcRequest::Traverse { path: path_str(temp.path()) }, TOKEN)
            .await
            .unwrap();
        let mut entries = 0;
        let mut finished = false;
        while let Some(reply) =
            tokio::time::timeout(Duration::from_secs(5), replies.recv()).await.unwrap()
        {
            match reply.into_result().unwrap() {
                RpcValue::Traverse(batch) => entries += batch.entry_count(),
                RpcValue::Done => finished = true,
                other => panic!("unexpected value {:?}", other),
            }
        }
        assert!(finished);
        assert_eq!(entries, 9);

        client.disconnect().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unsolicited_messages_reach_callback() {
        let temp = TempDir::new().unwrap();
        let server_ctx = context("server");
        let client_ctx = context("client");
        let (addr, cancel) = serve(server_ctx.clone(), temp.path(), vec![]).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: MessageCallback = Arc::new(move |envelope| {
            let _ = tx.send(envelope);
        });
        let client = TransportClient::connect(addr, client_ctx.clone(), callback)
            .await
            .unwrap();

        let handle = server_ctx.peers.handle(&client_ctx.identity.id).unwrap();
        handle
            .send(Envelope::new("/notice").with_param("k", "v"))
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.command(), "/notice");

        client.disconnect().await;
        cancel.cancel();
    }
}
