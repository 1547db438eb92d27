//! Per-peer connection lifecycle.
//!
//! Every remote device id owns one [`PeerRecord`] whose [`ConnectionState`]
//! only moves along the legal edges:
//!
//! ```text
//! New ──► Loading ──┬──► Connected ──┐
//!            ▲      ├──► Failed    ──┼──► Disconnected
//!            │      └──► Rejected  ──┘         │
//!            └──────── (fresh attempt) ◄───────┘
//! ```
//!
//! A handshake always passes through `Loading`; there is no `New -> Connected`
//! shortcut. `Rejected` means the peer explicitly refused, `Failed` covers
//! timeouts and broken sockets.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard};

use protocol::{DeviceIdentity, Envelope};
use thiserror::Error;
use tokio::sync::mpsc;

/// Live connection handle: the sending side of a connection's writer task.
pub type PeerHandle = mpsc::Sender<Envelope>;

/// Connection state of one remote device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Loading,
    Connected,
    Failed,
    Rejected,
    Disconnected,
}

impl ConnectionState {
    /// Whether `self -> to` is a legal edge.
    pub fn can_transition_to(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (New, Loading)
                | (Loading, Connected)
                | (Loading, Failed)
                | (Loading, Rejected)
                | (Connected, Disconnected)
                | (Failed, Disconnected)
                | (Rejected, Disconnected)
                | (Connected, Loading)
                | (Failed, Loading)
                | (Rejected, Loading)
                | (Disconnected, Loading)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Failed | ConnectionState::Rejected
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pairing errors.
#[derive(Debug, Error, PartialEq)]
pub enum PairingError {
    #[error("illegal transition for {device_id}: {from} -> {to}")]
    IllegalTransition {
        device_id: String,
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("peer table lock poisoned")]
    LockPoisoned,
}

/// Everything known about one remote device.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub state: ConnectionState,
    /// Populated by a successful handshake.
    pub identity: Option<DeviceIdentity>,
    /// Remote address to live connection handle.
    pub addresses: HashMap<SocketAddr, PeerHandle>,
    /// Every state the record has been in, starting with `New`.
    pub history: Vec<ConnectionState>,
}

impl PeerRecord {
    fn new() -> Self {
        Self {
            state: ConnectionState::New,
            identity: None,
            addresses: HashMap::new(),
            history: vec![ConnectionState::New],
        }
    }
}

/// Thread-safe table of peers keyed by device id.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, PeerRecord>>, PairingError> {
        self.peers.lock().map_err(|_| PairingError::LockPoisoned)
    }

    /// Create a `New` record for `device_id` unless one exists. Returns the
    /// current state.
    pub fn discover(&self, device_id: &str) -> Result<ConnectionState, PairingError> {
        let mut peers = self.lock()?;
        Ok(peers
            .entry(device_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(device_id, "Discovered peer");
                PeerRecord::new()
            })
            .state)
    }

    /// Move `device_id` to `to`, discovering it first if needed.
    ///
    /// Returns the previous state.
    pub fn transition(
        &self,
        device_id: &str,
        to: ConnectionState,
    ) -> Result<ConnectionState, PairingError> {
        let mut peers = self.lock()?;
        let record = peers
            .entry(device_id.to_string())
            .or_insert_with(PeerRecord::new);

        let from = record.state;
        if !from.can_transition_to(to) {
            tracing::warn!(device_id, %from, %to, "Rejected illegal pairing transition");
            return Err(PairingError::IllegalTransition {
                device_id: device_id.to_string(),
                from,
                to,
            });
        }

        record.state = to;
        record.history.push(to);
        tracing::info!(device_id, %from, %to, "Pairing state changed");
        Ok(from)
    }

    /// Store the handshaked identity and associate it with a connection.
    pub fn record_identity(
        &self,
        identity: DeviceIdentity,
        address: SocketAddr,
        handle: PeerHandle,
    ) -> Result<(), PairingError> {
        let mut peers = self.lock()?;
        let record = peers
            .get_mut(&identity.id)
            .ok_or_else(|| PairingError::UnknownPeer(identity.id.clone()))?;
        record.addresses.insert(address, handle);
        record.identity = Some(identity);
        Ok(())
    }

    /// Drop the connection at `address`. Returns how many remain for the peer.
    pub fn remove_address(
        &self,
        device_id: &str,
        address: &SocketAddr,
    ) -> Result<usize, PairingError> {
        let mut peers = self.lock()?;
        let record = peers
            .get_mut(device_id)
            .ok_or_else(|| PairingError::UnknownPeer(device_id.to_string()))?;
        record.addresses.remove(address);
        Ok(record.addresses.len())
    }

    pub fn state(&self, device_id: &str) -> Option<ConnectionState> {
        self.lock().ok()?.get(device_id).map(|r| r.state)
    }

    pub fn identity(&self, device_id: &str) -> Option<DeviceIdentity> {
        self.lock().ok()?.get(device_id)?.identity.clone()
    }

    /// Any live handle for the peer.
    pub fn handle(&self, device_id: &str) -> Option<PeerHandle> {
        self.lock()
            .ok()?
            .get(device_id)?
            .addresses
            .values()
            .find(|h| !h.is_closed())
            .cloned()
    }

    pub fn history(&self, device_id: &str) -> Vec<ConnectionState> {
        self.lock()
            .ok()
            .and_then(|peers| peers.get(device_id).map(|r| r.history.clone()))
            .unwrap_or_default()
    }

    pub fn record(&self, device_id: &str) -> Option<PeerRecord> {
        self.lock().ok()?.get(device_id).cloned()
    }

    /// Identities of all peers currently `Connected`.
    pub fn connected(&self) -> Vec<DeviceIdentity> {
        self.lock()
            .map(|peers| {
                peers
                    .values()
                    .filter(|r| r.state == ConnectionState::Connected)
                    .filter_map(|r| r.identity.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 6] = [New, Loading, Connected, Failed, Rejected, Disconnected];

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 20], port))
    }

    #[test]
    fn test_new_cannot_jump_to_connected() {
        let table = PeerTable::new();
        table.discover("peer").unwrap();

        let err = table.transition("peer", Connected).unwrap_err();
        assert_eq!(
            err,
            PairingError::IllegalTransition {
                device_id: "peer".into(),
                from: New,
                to: Connected
            }
        );
        assert_eq!(table.state("peer"), Some(New));
        assert_eq!(table.history("peer"), vec![New]);
    }

    #[test]
    fn test_successful_handshake_path() {
        let table = PeerTable::new();
        assert_eq!(table.transition("peer", Loading).unwrap(), New);
        assert_eq!(table.transition("peer", Connected).unwrap(), Loading);
        assert_eq!(table.history("peer"), vec![New, Loading, Connected]);
    }

    #[test]
    fn test_terminal_states_allow_teardown_and_retry() {
        for terminal in [Connected, Failed, Rejected] {
            let table = PeerTable::new();
            table.transition("p", Loading).unwrap();
            table.transition("p", terminal).unwrap();
            table.transition("p", Disconnected).unwrap();
            table.transition("p", Loading).unwrap();
            table.transition("p", terminal).unwrap();
            table.transition("p", Loading).unwrap();
        }
    }

    #[test]
    fn test_edge_table() {
        let legal = [
            (New, Loading),
            (Loading, Connected),
            (Loading, Failed),
            (Loading, Rejected),
            (Connected, Disconnected),
            (Failed, Disconnected),
            (Rejected, Disconnected),
            (Connected, Loading),
            (Failed, Loading),
            (Rejected, Loading),
            (Disconnected, Loading),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_history_never_skips_loading() {
        let table = PeerTable::new();
        // Hammer the table with every possible transition, legal or not.
        for _ in 0..3 {
            for to in ALL {
                let _ = table.transition("p", to);
            }
        }
        let history = table.history("p");
        for pair in history.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
            if pair[1] == Connected {
                assert_eq!(pair[0], Loading);
            }
        }
    }

    #[tokio::test]
    async fn test_identity_and_addresses() {
        let table = PeerTable::new();
        let identity = DeviceIdentity::generate("phone", 52020);
        let (tx, _rx) = mpsc::channel(4);

        table.transition(&identity.id, Loading).unwrap();
        table
            .record_identity(identity.clone(), addr(4000), tx)
            .unwrap();
        table.transition(&identity.id, Connected).unwrap();

        assert_eq!(table.identity(&identity.id), Some(identity.clone()));
        assert!(table.handle(&identity.id).is_some());
        assert_eq!(table.connected(), vec![identity.clone()]);
        assert_eq!(table.remove_address(&identity.id, &addr(4000)).unwrap(), 0);
        assert!(table.handle(&identity.id).is_none());
    }

    #[test]
    fn test_record_identity_requires_discovery() {
        let table = PeerTable::new();
        let (tx, _rx) = mpsc::channel(1);
        let identity = DeviceIdentity::generate("ghost", 1);
        let err = table.record_identity(identity, addr(1), tx).unwrap_err();
        assert!(matches!(err, PairingError::UnknownPeer(_)));
    }

    #[test]
    fn test_concurrent_transitions_stay_legal() {
        use std::sync::Arc;

        let table = Arc::new(PeerTable::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let to = ALL[(i + 1) % ALL.len()];
                        let _ = table.transition("shared", Loading);
                        let _ = table.transition("shared", to);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let history = table.history("shared");
        assert_eq!(history[0], New);
        assert!(history.windows(2).all(|w| w[0].can_transition_to(w[1])));
    }
}
