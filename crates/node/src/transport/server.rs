//! Listening side of the transport.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use protocol::{commands, Envelope, ProtocolError};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{spawn_writer, EnvelopeReader, TransportContext};
use crate::pairing::{ConnectionState, PeerHandle};
use crate::router::RpcRouter;

/// Accepts peer connections and serves their RPC requests.
pub struct TransportServer {
    listener: TcpListener,
    context: Arc<TransportContext>,
    router: RpcRouter,
}

impl TransportServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(
        addr: SocketAddr,
        context: Arc<TransportContext>,
        router: RpcRouter,
    ) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            context,
            router,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires. Each connection gets its own
    /// task which also stops on cancellation.
    pub async fn run(self, cancel: CancellationToken) {
        let local = self.listener.local_addr().ok();
        info!(?local, "Transport server listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    let connection = Connection {
                        remote,
                        context: self.context.clone(),
                        router: self.router.clone(),
                        cancel: cancel.child_token(),
                    };
                    tokio::spawn(connection.run(stream));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                }
            }
        }
        info!(?local, "Transport server stopped");
    }
}

/// Outcome of an incoming handshake.
enum Handshake {
    Accepted(String),
    Refused,
}

struct Connection {
    remote: SocketAddr,
    context: Arc<TransportContext>,
    router: RpcRouter,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self, stream: TcpStream) {
        debug!(remote = %self.remote, "Connection accepted");
        let (read_half, write_half) = stream.into_split();
        let (handle, writer) = spawn_writer(write_half);
        let mut reader = EnvelopeReader::new(read_half);
        let mut peer_id: Option<String> = None;

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = reader.next() => next,
            };

            let envelope = match next {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    warn!(remote = %self.remote, "Dropping connection: {}", e);
                    break;
                }
            };

            match envelope.command() {
                commands::CONNECT => match self.handshake(&envelope, &handle).await {
                    Ok(Handshake::Accepted(id)) => peer_id = Some(id),
                    Ok(Handshake::Refused) => break,
                    Err(e) => {
                        warn!(remote = %self.remote, "Handshake failed: {}", e);
                        break;
                    }
                },
                commands::RPC => {
                    let Some(sender_id) = peer_id.clone() else {
                        warn!(remote = %self.remote, "RPC before handshake, ignoring");
                        continue;
                    };
                    let router = self.router.clone();
                    let out = handle.clone();
                    tokio::spawn(async move {
                        if let Err(e) = router.route(&envelope, &sender_id, &out).await {
                            warn!(%sender_id, "RPC failed: {}", e);
                        }
                    });
                }
                other => debug!(remote = %self.remote, command = other, "Ignoring command"),
            }
        }

        if let Some(id) = peer_id {
            self.teardown(&id);
        }
        drop(handle);
        let _ = writer.await;
        debug!(remote = %self.remote, "Connection closed");
    }

    async fn handshake(
        &self,
        envelope: &Envelope,
        handle: &PeerHandle,
    ) -> Result<Handshake, ProtocolError> {
        let context = &self.context;
        let identity = match context.open_identity(envelope) {
            Ok(identity) => identity,
            Err(e) => {
                debug!(remote = %self.remote, "Unreadable handshake: {}", e);
                self.reply(handle, context.rejection("unreadable handshake")?)
                    .await?;
                return Ok(Handshake::Refused);
            }
        };
        let id = identity.id.clone();
        let peers = &context.peers;

        let refusal = if id == context.identity.id {
            Some("handshake from own device id")
        } else if context.blocked_devices.contains(&id) {
            Some("device is blocked")
        } else {
            None
        };

        // A second connection from an already connected peer just adds an
        // address.
        if refusal.is_none() && peers.state(&id) == Some(ConnectionState::Connected) {
            peers
                .record_identity(identity, self.remote, handle.clone())
                .map_err(|e| ProtocolError::Protocol(e.to_string()))?;
            self.reply(handle, context.handshake()?).await?;
            return Ok(Handshake::Accepted(id));
        }

        if let Err(e) = peers.transition(&id, ConnectionState::Loading) {
            debug!(device_id = %id, "Handshake while busy: {}", e);
            self.reply(handle, context.rejection("handshake already in progress")?)
                .await?;
            return Ok(Handshake::Refused);
        }

        if let Some(reason) = refusal {
            info!(device_id = %id, remote = %self.remote, reason, "Refusing peer");
            peers
                .transition(&id, ConnectionState::Rejected)
                .map_err(|e| ProtocolError::Protocol(e.to_string()))?;
            self.reply(handle, context.rejection(reason)?).await?;
            return Ok(Handshake::Refused);
        }

        info!(device_id = %id, name = %identity.display_name, remote = %self.remote, "Peer connected");
        if let Err(e) = peers
            .record_identity(identity, self.remote, handle.clone())
            .and_then(|_| peers.transition(&id, ConnectionState::Connected))
        {
            if let Err(failed) = peers.transition(&id, ConnectionState::Failed) {
                debug!(device_id = %id, "Failure not recorded: {}", failed);
            }
            return Err(ProtocolError::Protocol(e.to_string()));
        }
        self.reply(handle, context.handshake()?).await?;
        Ok(Handshake::Accepted(id))
    }

    async fn reply(&self, handle: &PeerHandle, envelope: Envelope) -> Result<(), ProtocolError> {
        handle
            .send(envelope)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("writer stopped".to_string()))
    }

    fn teardown(&self, device_id: &str) {
        let peers = &self.context.peers;
        match peers.remove_address(device_id, &self.remote) {
            Ok(0) if peers.state(device_id) == Some(ConnectionState::Connected) => {
                if let Err(e) = peers.transition(device_id, ConnectionState::Disconnected) {
                    debug!(device_id, "Teardown transition failed: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!(device_id, "Teardown failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use protocol::{params, DeviceIdentity, FrameCodec, PayloadCipher};
    use tempfile::TempDir;

    use super::*;
    use crate::pairing::PeerTable;
    use crate::services::test_support::services;
    use crate::transport::write_envelope;

    const SECRET: &str = "server-test-secret";

    async fn start(blocked: Vec<String>) -> (SocketAddr, Arc<TransportContext>, CancellationToken, TempDir) {
        let temp = TempDir::new().unwrap();
        let cipher = PayloadCipher::from_secret(SECRET);
        let context = Arc::new(
            TransportContext::new(
                DeviceIdentity::generate("server", 0),
                cipher.clone(),
                Arc::new(PeerTable::new()),
            )
            .with_blocked_devices(blocked),
        );
        let router = RpcRouter::new(services(temp.path(), vec![]), cipher, 1024 * 1024);
        let server = TransportServer::bind("127.0.0.1:0".parse().unwrap(), context.clone(), router)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (addr, context, cancel, temp)
    }

    type RawPeer = (Envelope, tokio::net::tcp::OwnedWriteHalf, EnvelopeReader<tokio::net::tcp::OwnedReadHalf>);

    /// Handshake over a bare socket. The halves are returned so the caller
    /// decides when the connection closes.
    async fn raw_handshake(addr: SocketAddr, identity: &DeviceIdentity, secret: &str) -> RawPeer {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let context = TransportContext::new(
            identity.clone(),
            PayloadCipher::from_secret(secret),
            Arc::new(PeerTable::new()),
        );
        write_envelope(&mut write_half, &FrameCodec::new(), &context.handshake().unwrap())
            .await
            .unwrap();

        let mut reader = EnvelopeReader::new(read_half);
        let reply = tokio::time::timeout(Duration::from_secs(5), reader.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        (reply, write_half, reader)
    }

    #[tokio::test]
    async fn test_handshake_accepted() {
        let (addr, context, cancel, _temp) = start(vec![]).await;
        let peer = DeviceIdentity::generate("phone", 1);

        let (reply, _writer, _reader) = raw_handshake(addr, &peer, SECRET).await;
        assert_eq!(reply.command(), commands::CONNECT);
        assert_eq!(context.open_identity(&reply).unwrap(), context.identity);

        assert_eq!(context.peers.state(&peer.id), Some(ConnectionState::Connected));
        assert_eq!(context.peers.identity(&peer.id), Some(peer.clone()));
        assert_eq!(
            context.peers.history(&peer.id),
            vec![ConnectionState::New, ConnectionState::Loading, ConnectionState::Connected]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_blocked_device_rejected() {
        let peer = DeviceIdentity::generate("intruder", 1);
        let (addr, context, cancel, _temp) = start(vec![peer.id.clone()]).await;

        let (reply, _writer, _reader) = raw_handshake(addr, &peer, SECRET).await;
        assert_eq!(reply.command(), commands::CONNECT_REJECTED);
        assert_eq!(reply.param(params::REASON), Some("device is blocked"));
        assert_eq!(context.peers.state(&peer.id), Some(ConnectionState::Rejected));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected_without_record() {
        let (addr, context, cancel, _temp) = start(vec![]).await;
        let peer = DeviceIdentity::generate("stranger", 1);

        let (reply, _writer, _reader) = raw_handshake(addr, &peer, "some-other-secret").await;
        assert_eq!(reply.command(), commands::CONNECT_REJECTED);
        assert!(context.peers.is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_disconnect_moves_peer_to_disconnected() {
        let (addr, context, cancel, _temp) = start(vec![]).await;
        let peer = DeviceIdentity::generate("tablet", 1);

        let (_, writer, reader) = raw_handshake(addr, &peer, SECRET).await;
        assert_eq!(context.peers.state(&peer.id), Some(ConnectionState::Connected));
        drop(writer);
        drop(reader);
        for _ in 0..50 {
            if context.peers.state(&peer.id) == Some(ConnectionState::Disconnected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(context.peers.state(&peer.id), Some(ConnectionState::Disconnected));
        cancel.cancel();
    }
}
