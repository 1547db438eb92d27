//! Wire envelope carried in every transport frame.
//!
//! An [`Envelope`] is a routing header (`command` plus target device ids), a
//! string map of routing parameters and an opaque body. The body is usually an
//! encrypted [`Payload`](crate::rpc::Payload); the envelope itself is never
//! encrypted so that routing keys stay readable to every hop.
//!
//! Envelopes are serialized with MessagePack using field names, so the wire
//! form is `{header: {command, targetIds}, params, body}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::framing::Frame;

/// Current protocol version, announced during device info exchange.
pub const PROTOCOL_VERSION: u8 = 1;

/// Command verbs. Dispatch is by exact string match.
pub mod commands {
    /// Handshake; body is the sender's sealed identity.
    pub const CONNECT: &str = "connect";
    /// Handshake refusal; carries a `reason` param.
    pub const CONNECT_REJECTED: &str = "connect_rejected";
    /// RPC request; body is an encrypted `Payload::Request`.
    pub const RPC: &str = "/rpc";
    /// Reply to `Path.getList`.
    pub const REPLY_LIST: &str = "/reply_list";
    /// Reply to `Path.getRootPaths`.
    pub const REPLY_ROOT_PATHS: &str = "/reply_root_paths";
    /// Reply to `Bookmark.getBookmarks`.
    pub const REPLY_BOOKMARK: &str = "/replyBookmark";
    /// One batch of a `Path.traverse` stream.
    pub const REPLY_TRAVERSE: &str = "/reply_traverse";
    /// Reply to any other RPC.
    pub const REPLY_RPC: &str = "/reply_rpc";
}

/// Well-known parameter keys.
pub mod params {
    pub const REPLY_KEY: &str = "replyKey";
    pub const CHUNK_INDEX: &str = "chunkIndex";
    pub const CHUNK_COUNT: &str = "chunkCount";
    pub const CHECKSUM: &str = "checksum";
    pub const TOKEN: &str = "token";
    pub const REASON: &str = "reason";
    pub const DONE: &str = "done";
}

/// Routing header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    /// Verb selecting the receiving handler.
    pub command: String,
    /// Device ids this message is addressed to. Empty means "whoever reads it".
    #[serde(default)]
    pub target_ids: Vec<String>,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default, with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl Envelope {
    /// Empty envelope for `command`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            header: Header {
                command: command.into(),
                target_ids: Vec::new(),
            },
            params: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_target(mut self, device_id: impl Into<String>) -> Self {
        self.header.target_ids.push(device_id.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn command(&self) -> &str {
        &self.header.command
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Like [`Envelope::param`], but a missing key is a protocol violation.
    pub fn require_param(&self, key: &str) -> Result<&str> {
        self.param(key).ok_or_else(|| {
            ProtocolError::Protocol(format!(
                "command {} is missing param {}",
                self.command(),
                key
            ))
        })
    }

    /// Correlation key of a request or reply.
    pub fn reply_key(&self) -> Option<&str> {
        self.param(params::REPLY_KEY)
    }

    /// Whether this message is addressed to `device_id`.
    pub fn is_for(&self, device_id: &str) -> bool {
        self.header.target_ids.is_empty() || self.header.target_ids.iter().any(|t| t == device_id)
    }

    /// Serialize the envelope to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = rmp_serde::from_slice(bytes)?;
        if envelope.header.command.is_empty() {
            return Err(ProtocolError::Protocol("envelope has no command".to_string()));
        }
        Ok(envelope)
    }

    pub fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(self.to_msgpack()?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        Self::from_msgpack(&frame.payload)
    }
}
