//! # FSBridge Protocol Library
//!
//! Wire-level building blocks shared by every FSBridge node.
//!
//! ## Overview
//!
//! - **Payload Cipher**: AES-256-CBC with a random IV prefix, key derived from an injected secret
//! - **Frame Codec**: length-prefixed framing with optional LZ4 compression
//! - **Envelope**: routing header, string params and opaque body
//! - **Chunking**: splitting oversized replies and verified reassembly
//! - **Device Identity**: the stable id a node presents during the handshake
//! - **RPC Payloads**: requests, replies and the single tagged [`Payload`] registry
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Payload (RPC, identity)        │  MessagePack, AES-256-CBC
//! ├─────────────────────────────────────────┤
//! │        Envelope + chunk params          │  MessagePack
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │                 TCP                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{commands, params, Envelope, FrameCodec, Payload, PayloadCipher, RpcRequest};
//!
//! let cipher = PayloadCipher::from_secret("shared secret");
//! let body = Payload::Request(RpcRequest::GetRootPaths).encode(&cipher).unwrap();
//!
//! let envelope = Envelope::new(commands::RPC)
//!     .with_param(params::REPLY_KEY, "r-1")
//!     .with_param(params::TOKEN, "token-abc")
//!     .with_body(body);
//!
//! let codec = FrameCodec::new();
//! let wire = codec.encode(&envelope.to_frame().unwrap()).unwrap();
//! let (frame, _) = codec.decode(&wire).unwrap();
//! assert_eq!(Envelope::from_frame(&frame).unwrap(), envelope);
//! ```

pub mod chunking;
pub mod crypto;
pub mod device;
pub mod error;
pub mod framing;
pub mod messages;
pub mod rpc;

pub use chunking::{checksum, split, ChunkProgress, Reassembler};
pub use crypto::{PayloadCipher, BLOCK_SIZE, IV_LENGTH, KEY_LENGTH};
pub use device::{DeviceIdentity, PlatformKind, SealedIdentity};
pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameBuffer, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE,
    FRAME_MAGIC, MAX_FRAME_SIZE,
};
pub use messages::{commands, params, Envelope, Header, PROTOCOL_VERSION};
pub use rpc::{
    Bookmark, Capability, DeviceInfo, EntryKind, FileEntry, Payload, RpcReply, RpcRequest,
    RpcValue, TraverseBatch,
};
