//! Bounded-concurrency network scan for peers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use protocol::DeviceIdentity;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{MessageCallback, TransportClient, TransportContext};

/// Scan tuning.
#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    pub port: u16,
    /// Budget for connect plus handshake, per address.
    pub timeout: Duration,
    /// Addresses tried at once.
    pub concurrency: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            port: crate::config::DEFAULT_TRANSPORT_PORT,
            timeout: Duration::from_millis(1000),
            concurrency: 100,
        }
    }
}

/// Try every address and return the peers that completed a handshake.
///
/// Order is unspecified. Unreachable addresses are left out silently. When
/// `cancel` fires, outstanding attempts are aborted and the peers found so far are
/// returned.
pub async fn scan(
    addresses: Vec<IpAddr>,
    context: Arc<TransportContext>,
    options: ScanOptions,
    cancel: CancellationToken,
) -> Vec<DeviceIdentity> {
    let total = addresses.len();
    let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut attempts = JoinSet::new();

    for ip in addresses {
        let permits = permits.clone();
        let context = context.clone();
        attempts.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            knock(SocketAddr::new(ip, options.port), context, options.timeout).await
        });
    }

    let mut found = Vec::new();
    loop {
        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(found = found.len(), "Scan cancelled");
                attempts.abort_all();
                break;
            }
            joined = attempts.join_next() => joined,
        };
        match joined {
            Some(Ok(Some(identity))) => found.push(identity),
            Some(Ok(None)) => {}
            Some(Err(e)) => debug!("Scan task failed: {}", e),
            None => break,
        }
    }

    info!(tried = total, found = found.len(), "Scan finished");
    found
}

async fn knock(
    addr: SocketAddr,
    context: Arc<TransportContext>,
    timeout: Duration,
) -> Option<DeviceIdentity> {
    let ignore: MessageCallback = Arc::new(|_| {});
    match TransportClient::dial(addr, None, context, ignore, timeout).await {
        Ok(client) => {
            let identity = client.peer().clone();
            client.disconnect().await;
            Some(identity)
        }
        Err(e) => {
            debug!(%addr, "No peer: {}", e);
            None
        }
    }
}

/// Hosts of the /24 around `local`, excluding `local` itself and the network
/// and broadcast addresses.
pub fn candidate_addresses(local: Ipv4Addr) -> Vec<IpAddr> {
    let [a, b, c, _] = local.octets();
    (1..=254u8)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| *ip != local)
        .map(IpAddr::V4)
        .collect()
}

/// The primary IPv4 address of this machine.
pub fn local_ipv4() -> anyhow::Result<Ipv4Addr> {
    match local_ip_address::local_ip()? {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(ip) => Err(anyhow::anyhow!("no IPv4 address, primary is {}", ip)),
    }
}
