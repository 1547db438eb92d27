//! Dispatch of `/rpc` envelopes to the services.
//!
//! A request envelope carries `replyKey` and `token` params and an encrypted
//! [`Payload::Request`] body. The router decodes it once, calls the matching
//! service and writes the reply (encrypted, chunked if needed) to the
//! connection's outbound channel. Business failures become
//! `RpcReply::Failure`; only undecodable requests surface as [`RouterError`].

use protocol::chunking;
use protocol::{
    params, Envelope, Payload, PayloadCipher, ProtocolError, RpcReply, RpcRequest, RpcValue,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::services::Services;

/// Errors that abort handling of one request.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("connection writer closed")]
    ChannelClosed,
}

/// Routes RPC requests for one node.
#[derive(Clone)]
pub struct RpcRouter {
    services: Services,
    cipher: PayloadCipher,
    max_chunk_size: usize,
}

impl RpcRouter {
    pub fn new(services: Services, cipher: PayloadCipher, max_chunk_size: usize) -> Self {
        Self {
            services,
            cipher,
            max_chunk_size,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Handle one `/rpc` envelope from `sender_id`, writing replies to `out`.
    pub async fn route(
        &self,
        envelope: &Envelope,
        sender_id: &str,
        out: &mpsc::Sender<Envelope>,
    ) -> Result<(), RouterError> {
        let reply_key = envelope.require_param(params::REPLY_KEY)?.to_string();
        // A missing token is evaluated like any unbound token: blocked.
        let token = envelope.param(params::TOKEN).unwrap_or_default();

        let request = match Payload::decode(&envelope.body, &self.cipher)? {
            Payload::Request(request) => request,
            other => {
                return Err(RouterError::InvalidRequest(format!(
                    "expected a request payload, got {}",
                    other.kind()
                )))
            }
        };
        debug!(method = request.method(), %reply_key, sender_id, "Routing RPC");

        let reply_to = ReplyTarget {
            command: request.reply_command(),
            reply_key: &reply_key,
            sender_id,
            out,
        };

        if let RpcRequest::Traverse { path } = &request {
            return self.stream_traverse(token, path, reply_to).await;
        }

        let reply = self.dispatch(token, request);
        if let RpcReply::Failure(message) = &reply {
            debug!(%reply_key, "RPC failed: {}", message);
        }
        self.send_reply(&reply_to, reply, None).await
    }

    /// Execute a non-streaming request.
    pub fn dispatch(&self, token: &str, request: RpcRequest) -> RpcReply<RpcValue> {
        let services = &self.services;
        match request {
            RpcRequest::DeviceInfo => RpcReply::Success(RpcValue::Device(services.device.info())),
            RpcRequest::GetRootPaths => {
                RpcReply::Success(RpcValue::Entries(services.path.get_root_paths(token)))
            }
            RpcRequest::GetList { path } => {
                services.path.get_list(token, &path).map(RpcValue::Entries).into()
            }
            RpcRequest::Traverse { .. } => {
                RpcReply::failure("Path.traverse is a streaming call")
            }
            RpcRequest::Rename { from, to } => {
                services.file.rename(token, &from, &to).map(|_| RpcValue::Done).into()
            }
            RpcRequest::CreateFolder { path } => services
                .file
                .create_folder(token, &path)
                .map(|_| RpcValue::Done)
                .into(),
            RpcRequest::CreateFile { path } => services
                .file
                .create_file(token, &path)
                .map(|_| RpcValue::Done)
                .into(),
            RpcRequest::Delete { path } => {
                services.file.delete(token, &path).map(|_| RpcValue::Done).into()
            }
            RpcRequest::ReadBytes {
                path,
                offset,
                length,
            } => services
                .file
                .read_bytes(token, &path, offset, length)
                .map(RpcValue::Bytes)
                .into(),
            RpcRequest::WriteBytes { path, offset, data } => services
                .file
                .write_bytes(token, &path, offset, &data)
                .map(RpcValue::Written)
                .into(),
            RpcRequest::GetBookmarks => {
                RpcReply::Success(RpcValue::Bookmarks(services.bookmark.get_bookmarks(token)))
            }
        }
    }

    async fn stream_traverse(
        &self,
        token: &str,
        path: &str,
        reply_to: ReplyTarget<'_>,
    ) -> Result<(), RouterError> {
        let mut batches = match self.services.path.traverse(token, path) {
            Ok(rx) => rx,
            Err(e) => {
                return self
                    .send_reply(&reply_to, RpcReply::failure(e), Some(true))
                    .await
            }
        };

        let mut sent = 0usize;
        while let Some(batch) = batches.recv().await {
            sent += 1;
            self.send_reply(&reply_to, RpcReply::Success(RpcValue::Traverse(batch)), Some(false))
                .await?;
        }
        debug!(reply_key = reply_to.reply_key, batches = sent, "Traverse complete");
        self.send_reply(&reply_to, RpcReply::Success(RpcValue::Done), Some(true))
            .await
    }

    async fn send_reply(
        &self,
        to: &ReplyTarget<'_>,
        reply: RpcReply<RpcValue>,
        done: Option<bool>,
    ) -> Result<(), RouterError> {
        let body = Payload::Reply(reply).encode(&self.cipher)?;
        let envelopes = chunking::split(to.command, to.reply_key, &body, self.max_chunk_size)?;
        if envelopes.len() > 1 {
            debug!(reply_key = to.reply_key, chunks = envelopes.len(), "Chunking reply");
        }

        for mut envelope in envelopes {
            envelope = envelope.with_target(to.sender_id);
            if let Some(done) = done {
                envelope = envelope.with_param(params::DONE, done);
            }
            if to.out.send(envelope).await.is_err() {
                warn!(reply_key = to.reply_key, "Connection closed before reply was sent");
                return Err(RouterError::ChannelClosed);
            }
        }
        Ok(())
    }
}

struct ReplyTarget<'a> {
    command: &'static str,
    reply_key: &'a str,
    sender_id: &'a str,
    out: &'a mpsc::Sender<Envelope>,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use protocol::{commands, ChunkProgress, Reassembler};
    use tempfile::TempDir;

    use super::*;
    use crate::permissions::{Action, PermissionRule};
    use crate::services::test_support::{path_str, services, TOKEN};

    fn cipher() -> PayloadCipher {
        PayloadCipher::from_secret("router-secret")
    }

    fn router(root: &std::path::Path, max_chunk: usize) -> RpcRouter {
        let rule = PermissionRule::new(1, 1, path_str(root))
            .recursive()
            .grant(Action::Read)
            .grant(Action::Write);
        RpcRouter::new(services(root, vec![rule]), cipher(), max_chunk)
    }

    fn request(request: RpcRequest, token: &str) -> Envelope {
        Envelope::new(commands::RPC)
            .with_param(params::REPLY_KEY, "r-1")
            .with_param(params::TOKEN, token)
            .with_body(Payload::Request(request).encode(&cipher()).unwrap())
    }

    /// Drain `rx`, reassembling every reply.
    async fn replies(mut rx: mpsc::Receiver<Envelope>) -> Vec<(Envelope, RpcReply<RpcValue>)> {
        let reassembler = Reassembler::new();
        let mut out = Vec::new();
        while let Some(envelope) = rx.recv().await {
            if let ChunkProgress::Complete(body) = reassembler.accept(&envelope).unwrap() {
                match Payload::decode(&body, &cipher()).unwrap() {
                    Payload::Reply(reply) => out.push((envelope, reply)),
                    other => panic!("unexpected payload {:?}", other),
                }
            }
        }
        out
    }

    #[tokio::test]
    async fn test_get_list_uses_reply_list_command() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), b"a").unwrap();
        let router = router(temp.path(), 1024 * 1024);

        let (tx, rx) = mpsc::channel(16);
        let envelope = request(RpcRequest::GetList { path: path_str(temp.path()) }, TOKEN);
        router.route(&envelope, "peer-1", &tx).await.unwrap();
        drop(tx);

        let replies = replies(rx).await;
        assert_eq!(replies.len(), 1);
        let (reply_envelope, reply) = &replies[0];
        assert_eq!(reply_envelope.command(), commands::REPLY_LIST);
        assert_eq!(reply_envelope.reply_key(), Some("r-1"));
        assert!(reply_envelope.is_for("peer-1"));
        match reply {
            RpcReply::Success(RpcValue::Entries(entries)) => assert_eq!(entries[0].name, "a.txt"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_permission_failure_is_a_reply_not_an_error() {
        let temp = TempDir::new().unwrap();
        let router = router(temp.path(), 1024 * 1024);

        let (tx, rx) = mpsc::channel(16);
        let envelope = request(RpcRequest::Delete { path: path_str(temp.path()) }, TOKEN);
        router.route(&envelope, "peer", &tx).await.unwrap();
        drop(tx);

        let replies = replies(rx).await;
        assert_eq!(replies[0].0.command(), commands::REPLY_RPC);
        match &replies[0].1 {
            RpcReply::Failure(message) => assert!(message.contains("permission denied: remove")),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(temp.path().exists());
    }

    #[tokio::test]
    async fn test_large_reply_is_chunked() {
        let temp = TempDir::new().unwrap();
        let big: Vec<u8> = (0..50_000).map(|i| (i % 256) as u8).collect();
        fs::write(temp.path().join("big.bin"), &big).unwrap();
        let router = router(temp.path(), 4096);

        let (tx, mut rx) = mpsc::channel(64);
        let envelope = request(
            RpcRequest::ReadBytes {
                path: path_str(&temp.path().join("big.bin")),
                offset: 0,
                length: 50_000,
            },
            TOKEN,
        );
        router.route(&envelope, "peer", &tx).await.unwrap();
        drop(tx);

        let mut chunks = Vec::new();
        while let Some(envelope) = rx.recv().await {
            chunks.push(envelope);
        }
        assert!(chunks.len() > 10);
        assert!(chunks.iter().all(|c| c.body.len() <= 4096));

        let reassembler = Reassembler::new();
        let mut body = None;
        for chunk in &chunks {
            if let ChunkProgress::Complete(bytes) = reassembler.accept(chunk).unwrap() {
                body = Some(bytes);
            }
        }
        match Payload::decode(&body.unwrap(), &cipher()).unwrap() {
            Payload::Reply(RpcReply::Success(RpcValue::Bytes(bytes))) => assert_eq!(bytes, big),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_traverse_streams_until_done() {
        let temp = TempDir::new().unwrap();
        for i in 0..10 {
            fs::write(temp.path().join(format!("f{}", i)), b"x").unwrap();
        }
        let router = router(temp.path(), 1024 * 1024);

        let (tx, rx) = mpsc::channel(64);
        let envelope = request(RpcRequest::Traverse { path: path_str(temp.path()) }, TOKEN);
        router.route(&envelope, "peer", &tx).await.unwrap();
        drop(tx);

        let replies = replies(rx).await;
        let (last, last_reply) = replies.last().unwrap();
        assert_eq!(last.param(params::DONE), Some("true"));
        assert_eq!(last_reply, &RpcReply::Success(RpcValue::Done));

        let batches: Vec<_> = replies[..replies.len() - 1]
            .iter()
            .map(|(envelope, reply)| {
                assert_eq!(envelope.command(), commands::REPLY_TRAVERSE);
                assert_eq!(envelope.param(params::DONE), Some("false"));
                match reply {
                    RpcReply::Success(RpcValue::Traverse(batch)) => batch.entry_count(),
                    other => panic!("unexpected reply {:?}", other),
                }
            })
            .collect();
        assert_eq!(batches.iter().sum::<usize>(), 10);
    }

    #[tokio::test]
    async fn test_traverse_denied_sends_single_failure() {
        let temp = TempDir::new().unwrap();
        let router = router(temp.path(), 1024 * 1024);

        let (tx, rx) = mpsc::channel(8);
        let envelope = request(RpcRequest::Traverse { path: path_str(temp.path()) }, "nobody");
        router.route(&envelope, "peer", &tx).await.unwrap();
        drop(tx);

        let replies = replies(rx).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0.param(params::DONE), Some("true"));
        assert!(!replies[0].1.is_success());
    }

    #[tokio::test]
    async fn test_undecodable_body_is_an_error() {
        let temp = TempDir::new().unwrap();
        let router = router(temp.path(), 1024);
        let (tx, _rx) = mpsc::channel(8);

        let envelope = Envelope::new(commands::RPC)
            .with_param(params::REPLY_KEY, "r")
            .with_body(b"definitely not encrypted".to_vec());
        let err = router.route(&envelope, "peer", &tx).await.unwrap_err();
        assert!(matches!(err, RouterError::Protocol(ProtocolError::Decryption(_))));

        let missing_key = Envelope::new(commands::RPC);
        assert!(router.route(&missing_key, "peer", &tx).await.is_err());
    }

    #[test]
    fn test_dispatch_write_then_read() {
        let temp = TempDir::new().unwrap();
        let router = router(temp.path(), 1024);
        let file = path_str(&temp.path().join("note.txt"));

        let written = router.dispatch(
            TOKEN,
            RpcRequest::WriteBytes {
                path: file.clone(),
                offset: 0,
                data: b"note".to_vec(),
            },
        );
        assert_eq!(written, RpcReply::Success(RpcValue::Written(4)));

        let read = router.dispatch(
            TOKEN,
            RpcRequest::ReadBytes {
                path: file,
                offset: 1,
                length: 2,
            },
        );
        assert_eq!(read, RpcReply::Success(RpcValue::Bytes(b"ot".to_vec())));
    }
}
