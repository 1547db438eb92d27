//! # FSBridge Node Library
//!
//! A node exposes its local filesystem to paired devices on the same LAN.
//!
//! ## Overview
//!
//! - **Discovery and Pairing**: subnet scanning and a sealed identity handshake
//! - **Transport**: framed TCP connections carrying RPC envelopes and chunked replies
//! - **Permissions**: fail-closed token → role → rule evaluation
//! - **Services**: Device, Path, File and Bookmark RPC namespaces
//! - **HTTP Streaming**: encrypted listings, SSE traversal and ranged file downloads
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Node Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │   Transport  │  │    HTTP      │  │   Peer Table         │   │
//! │  │   Server     │  │    Server    │  │   (pairing states)   │   │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────────────────┘   │
//! │         │                 │                                     │
//! │  ┌──────▼───────┐         │                                     │
//! │  │  RPC Router  │         │                                     │
//! │  └──────┬───────┘         │                                     │
//! │  ┌──────▼─────────────────▼────────────────────────────────┐    │
//! │  │      Services  ──►  Permission Cache  ──►  FileSystem   │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use node::{Config, NodeOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!
//!     let mut orchestrator = NodeOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`identity`]: Persisted device identity
//! - [`pairing`]: Peer table and connection state machine
//! - [`permissions`]: Roles, rules and access checks
//! - [`fs`]: Filesystem abstraction
//! - [`services`]: RPC service implementations
//! - [`router`]: RPC dispatch and reply chunking
//! - [`transport`]: TCP server, client and subnet scanner
//! - [`http`]: HTTP streaming server
//! - [`orchestrator`]: Node lifecycle coordinator

pub mod config;
pub mod fs;
pub mod http;
pub mod identity;
pub mod orchestrator;
pub mod pairing;
pub mod permissions;
pub mod router;
pub mod services;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;

pub use fs::{FileSystemAdapter, FsError, LocalFileSystem};

pub use http::{HttpError, HttpServer};

pub use pairing::{ConnectionState, PairingError, PeerHandle, PeerRecord, PeerTable};

pub use permissions::{
    Access, Action, JsonPermissionStore, PermissionCache, PermissionRule, PermissionStore, Role,
    TokenBinding,
};

pub use router::{RouterError, RpcRouter};

pub use services::{ServiceContext, ServiceError, Services};

pub use transport::{scan, MessageCallback, ScanOptions, TransportClient, TransportContext, TransportServer};

pub use orchestrator::{NodeEvent, NodeOrchestrator, NodeState};
