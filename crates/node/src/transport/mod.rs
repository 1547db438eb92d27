//! TCP transport: framed envelope IO, the listening server, the dialing
//! client and the subnet scanner.
//!
//! Every connection is split into a read half owned by its handler loop and
//! a write half owned by a writer task fed through a [`PeerHandle`], so sends
//! from concurrent RPC handlers never interleave inside a frame.

mod client;
mod scanner;
mod server;

use std::collections::HashSet;
use std::sync::Arc;

use protocol::{
    commands, params, DeviceIdentity, Envelope, FrameBuffer, FrameCodec, PayloadCipher,
    ProtocolError, SealedIdentity,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::pairing::{PeerHandle, PeerTable};

pub use client::{MessageCallback, TransportClient};
pub use scanner::{candidate_addresses, local_ipv4, scan, ScanOptions};
pub use server::TransportServer;

/// Envelopes queued per connection before senders wait.
const WRITER_QUEUE_DEPTH: usize = 64;

/// Size of each socket read.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// State shared by every connection of one node.
pub struct TransportContext {
    pub identity: DeviceIdentity,
    pub cipher: PayloadCipher,
    pub peers: Arc<PeerTable>,
    pub blocked_devices: HashSet<String>,
}

impl TransportContext {
    pub fn new(identity: DeviceIdentity, cipher: PayloadCipher, peers: Arc<PeerTable>) -> Self {
        Self {
            identity,
            cipher,
            peers,
            blocked_devices: HashSet::new(),
        }
    }

    pub fn with_blocked_devices(mut self, blocked: impl IntoIterator<Item = String>) -> Self {
        self.blocked_devices = blocked.into_iter().collect();
        self
    }

    /// Our identity, sealed for a handshake body.
    fn sealed_identity(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(SealedIdentity::seal(&self.identity, &self.cipher)?.0)
    }

    fn handshake(&self) -> Result<Envelope, ProtocolError> {
        Ok(Envelope::new(commands::CONNECT).with_body(self.sealed_identity()?))
    }

    fn rejection(&self, reason: &str) -> Result<Envelope, ProtocolError> {
        Ok(Envelope::new(commands::CONNECT_REJECTED)
            .with_param(params::REASON, reason)
            .with_body(self.sealed_identity()?))
    }

    fn open_identity(&self, envelope: &Envelope) -> Result<DeviceIdentity, ProtocolError> {
        SealedIdentity(envelope.body.clone()).open(&self.cipher)
    }
}

/// Reads whole envelopes from a byte stream, independent of how the bytes
/// were split across reads.
pub struct EnvelopeReader<R> {
    inner: R,
    frames: FrameBuffer,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            frames: FrameBuffer::new(FrameCodec::new()),
            buf: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Next envelope, or `None` on a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<Envelope>, ProtocolError> {
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Envelope::from_frame(&frame).map(Some);
            }

            let n = self.inner.read(&mut self.buf).await?;
            if n == 0 {
                if self.frames.buffered() > 0 {
                    return Err(ProtocolError::ConnectionClosed(format!(
                        "stream ended inside a frame ({} bytes buffered)",
                        self.frames.buffered()
                    )));
                }
                return Ok(None);
            }
            self.frames.extend(&self.buf[..n]);
        }
    }
}

/// Encode and write one envelope.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    codec: &FrameCodec,
    envelope: &Envelope,
) -> Result<(), ProtocolError> {
    let bytes = codec.encode(&envelope.to_frame()?)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Spawn the task that owns `writer`. Dropping every clone of the returned
/// handle ends the task and shuts the write half down.
pub fn spawn_writer<W>(mut writer: W) -> (PeerHandle, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Envelope>(WRITER_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        let codec = FrameCodec::new();
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = write_envelope(&mut writer, &codec, &envelope).await {
                tracing::debug!(command = envelope.command(), "Write failed: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
    (tx, task)
}
