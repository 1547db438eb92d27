//! Device identity exchanged during the handshake.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::PayloadCipher;
use crate::error::Result;

/// Operating system family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PlatformKind {
    Linux,
    MacOs,
    Windows,
    Android,
    Ios,
    #[default]
    Other,
}

impl PlatformKind {
    /// Platform this binary was compiled for.
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Self::Linux,
            "macos" => Self::MacOs,
            "windows" => Self::Windows,
            "android" => Self::Android,
            "ios" => Self::Ios,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The stable identity of a device.
///
/// `id` is generated once from randomness and never regenerated; persistence
/// lives in the node crate. Live connection handles for the device's
/// addresses are runtime state and are tracked by the peer table, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub display_name: String,
    pub platform: PlatformKind,
    /// Transport port the device listens on.
    pub port: u16,
}

impl DeviceIdentity {
    /// Create a brand-new identity with a random id.
    pub fn generate(display_name: impl Into<String>, port: u16) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            platform: PlatformKind::current(),
            port,
        }
    }

    /// First eight characters of the id, for log lines.
    pub fn short_id(&self) -> &str {
        let end = self
            .id
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.id.len());
        &self.id[..end]
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}, port {})",
            self.display_name,
            self.short_id(),
            self.platform,
            self.port
        )
    }
}

/// A [`DeviceIdentity`] encrypted for embedding in other payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedIdentity(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl SealedIdentity {
    pub fn seal(identity: &DeviceIdentity, cipher: &PayloadCipher) -> Result<Self> {
        Ok(Self(cipher.seal(identity)?))
    }

    pub fn open(&self, cipher: &PayloadCipher) -> Result<DeviceIdentity> {
        cipher.open(&self.0)
    }
}
