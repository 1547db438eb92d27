//! Persistence of this node's [`DeviceIdentity`].
//!
//! The identity is stored sealed with the payload cipher at
//! `<data_dir>/identity.bin`. The id is generated once; later runs only refresh
//! the display name and port from configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use protocol::{DeviceIdentity, PayloadCipher, SealedIdentity};
use tracing::info;

/// Load the identity at `path`, creating it on first run.
///
/// A file that exists but cannot be decrypted is an error; the id is never
/// silently regenerated.
pub fn load_or_generate(
    path: &Path,
    cipher: &PayloadCipher,
    display_name: &str,
    port: u16,
) -> Result<DeviceIdentity> {
    if !path.exists() {
        let identity = DeviceIdentity::generate(display_name, port);
        save(path, &identity, cipher)?;
        info!(
            device_id = %identity.id,
            "Generated new device identity and saved to {:?}", path
        );
        return Ok(identity);
    }

    let mut identity = load(path, cipher)?;
    if identity.display_name != display_name || identity.port != port {
        identity.display_name = display_name.to_string();
        identity.port = port;
        save(path, &identity, cipher)?;
        info!(device_id = %identity.id, "Updated stored identity details");
    }
    Ok(identity)
}

/// Read and decrypt an existing identity file.
pub fn load(path: &Path, cipher: &PayloadCipher) -> Result<DeviceIdentity> {
    let bytes = fs::read(path)
        .with_context(|| format!("Failed to read identity file: {}", path.display()))?;
    SealedIdentity(bytes).open(cipher).with_context(|| {
        format!(
            "Failed to decrypt identity file {} (wrong secret?)",
            path.display()
        )
    })
}

/// Seal and atomically write `identity` to `path`.
pub fn save(path: &Path, identity: &DeviceIdentity, cipher: &PayloadCipher) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let sealed = SealedIdentity::seal(identity, cipher).context("Failed to seal identity")?;
    let temp_path = path.with_extension("bin.tmp");
    fs::write(&temp_path, &sealed.0)
        .with_context(|| format!("Failed to write identity file: {}", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "Failed to rename {} to {}",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}
