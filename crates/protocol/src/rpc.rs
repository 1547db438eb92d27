//! RPC request/reply types and the tagged payload registry.
//!
//! Every structured value that crosses a process boundary is one variant of
//! [`Payload`]. There is exactly one encode path ([`Payload::encode`]) and one
//! decode path ([`Payload::decode`]); receivers decode once and match.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::PayloadCipher;
use crate::device::DeviceIdentity;
use crate::error::Result;
use crate::messages::commands;

// ============================================================================
// Domain values
// ============================================================================

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// One item of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    /// Absolute path of the entry.
    pub path: String,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Last modification, Unix seconds.
    pub modified: Option<u64>,
}

impl FileEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A named shortcut to a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub name: String,
    pub path: String,
}

/// One increment of a recursive traversal: directory path to its entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraverseBatch {
    pub directories: BTreeMap<String, Vec<FileEntry>>,
}

impl TraverseBatch {
    /// Total number of entries across all directories in the batch.
    pub fn entry_count(&self) -> usize {
        self.directories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
    }
}

/// A feature a device exposes to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    /// Port serving the capability, when it is not the transport port.
    pub port: Option<u16>,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
        }
    }

    pub fn on_port(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port: Some(port),
        }
    }
}

/// Answer to `Device.info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    pub protocol_version: u8,
    pub capabilities: Vec<Capability>,
}

impl DeviceInfo {
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

// ============================================================================
// Requests and replies
// ============================================================================

/// All RPC calls, grouped by service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args")]
pub enum RpcRequest {
    // Device
    DeviceInfo,

    // Path
    GetRootPaths,
    GetList { path: String },
    Traverse { path: String },

    // File
    Rename { from: String, to: String },
    CreateFolder { path: String },
    CreateFile { path: String },
    Delete { path: String },
    ReadBytes { path: String, offset: u64, length: u64 },
    WriteBytes {
        path: String,
        offset: u64,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    // Bookmark
    GetBookmarks,
}

impl RpcRequest {
    /// `Service.method` name, for logging.
    pub fn method(&self) -> &'static str {
        match self {
            Self::DeviceInfo => "Device.info",
            Self::GetRootPaths => "Path.getRootPaths",
            Self::GetList { .. } => "Path.getList",
            Self::Traverse { .. } => "Path.traverse",
            Self::Rename { .. } => "File.rename",
            Self::CreateFolder { .. } => "File.createFolder",
            Self::CreateFile { .. } => "File.createFile",
            Self::Delete { .. } => "File.delete",
            Self::ReadBytes { .. } => "File.readBytes",
            Self::WriteBytes { .. } => "File.writeBytes",
            Self::GetBookmarks => "Bookmark.getBookmarks",
        }
    }

    /// Command verb the reply to this request travels under.
    pub fn reply_command(&self) -> &'static str {
        match self {
            Self::GetList { .. } => commands::REPLY_LIST,
            Self::GetRootPaths => commands::REPLY_ROOT_PATHS,
            Self::GetBookmarks => commands::REPLY_BOOKMARK,
            Self::Traverse { .. } => commands::REPLY_TRAVERSE,
            _ => commands::REPLY_RPC,
        }
    }
}

/// Successful RPC results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum RpcValue {
    Device(DeviceInfo),
    Entries(Vec<FileEntry>),
    Traverse(TraverseBatch),
    Bookmarks(Vec<Bookmark>),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Number of bytes written.
    Written(u64),
    Done,
}

/// Success/failure envelope around every RPC result.
///
/// Business failures travel as `Failure`; only transport and decoding faults
/// surface as errors on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result")]
pub enum RpcReply<T> {
    Success(T),
    Failure(String),
}

impl<T> RpcReply<T> {
    pub fn failure(message: impl ToString) -> Self {
        Self::Failure(message.to_string())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self) -> std::result::Result<T, String> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure(message) => Err(message),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> RpcReply<U> {
        match self {
            Self::Success(value) => RpcReply::Success(f(value)),
            Self::Failure(message) => RpcReply::Failure(message),
        }
    }
}

impl<T, E: std::fmt::Display> From<std::result::Result<T, E>> for RpcReply<T> {
    fn from(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(e) => Self::Failure(e.to_string()),
        }
    }
}

// ============================================================================
// Payload registry
// ============================================================================

/// Every structured payload carried in an envelope body or HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    /// Handshake body and `/ping` answer.
    Identity(DeviceIdentity),
    Request(RpcRequest),
    Reply(RpcReply<RpcValue>),
}

impl Payload {
    /// MessagePack-encode and encrypt.
    pub fn encode(&self, cipher: &PayloadCipher) -> Result<Vec<u8>> {
        cipher.seal(self)
    }

    /// Decrypt and decode.
    pub fn decode(bytes: &[u8], cipher: &PayloadCipher) -> Result<Self> {
        cipher.open(bytes)
    }

    /// Plain MessagePack form, used as the pre-chunking representation.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identity(_) => "identity",
            Self::Request(_) => "request",
            Self::Reply(_) => "reply",
        }
    }
}
