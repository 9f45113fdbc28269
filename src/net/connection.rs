//! Connection identity, lifecycle tracking and the connected-peer registry.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count live connections and let shutdown wait for them to drain
//! - Keep one outbound queue per connection so frames can be pushed to a peer

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::PushError;
use crate::observability::metrics;

/// Frames that may wait for one connection before pushes report it backlogged.
const OUTBOUND_QUEUE_CAPACITY: usize = 32;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A connected client as reported by the admin API.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub connection_id: u64,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug)]
struct PeerEntry {
    info: PeerInfo,
    outbound: mpsc::Sender<Vec<u8>>,
}

/// Tracks active connections for graceful shutdown and server push.
///
/// The live count is published on a watch channel so drain waits are
/// notified instead of polling.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active: Arc<watch::Sender<u64>>,
    peers: Arc<DashMap<ConnectionId, PeerEntry>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active: Arc::new(tx),
            peers: Arc::new(DashMap::new()),
        }
    }

    /// Record a new connection from `peer`.
    ///
    /// The guard unregisters it on drop. Frames pushed with
    /// [`send_to`](Self::send_to) arrive on the returned receiver.
    pub fn track(&self, peer: SocketAddr) -> (ConnectionGuard, mpsc::Receiver<Vec<u8>>) {
        let id = ConnectionId::new();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let info = PeerInfo {
            connection_id: id.as_u64(),
            peer,
            connected_at: Utc::now(),
        };
        self.peers.insert(
            id,
            PeerEntry {
                info: info.clone(),
                outbound,
            },
        );

        let mut count = 0;
        self.active.send_modify(|n| {
            *n += 1;
            count = *n;
        });
        metrics::record_active_connections(count);

        let guard = ConnectionGuard {
            active: Arc::clone(&self.active),
            peers: Arc::clone(&self.peers),
            id,
            info,
        };
        (guard, rx)
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Connected peers, oldest connection first.
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<_> = self.peers.iter().map(|e| e.info.clone()).collect();
        peers.sort_by_key(|p| p.connection_id);
        peers
    }

    /// Queue `payload` for delivery to `peer` as a pushed frame.
    pub fn send_to(&self, peer: SocketAddr, payload: Vec<u8>) -> Result<(), PushError> {
        let outbound = self
            .peers
            .iter()
            .find(|e| e.info.peer == peer)
            .map(|e| e.outbound.clone())
            .ok_or(PushError::NotConnected(peer))?;

        outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Backlogged(peer),
            mpsc::error::TrySendError::Closed(_) => PushError::NotConnected(peer),
        })
    }

    /// Wait until no connection is alive.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<watch::Sender<u64>>,
    peers: Arc<DashMap<ConnectionId, PeerEntry>>,
    id: ConnectionId,
    info: PeerInfo,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn info(&self) -> &PeerInfo {
        &self.info
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.peers.remove(&self.id);
        let mut count = 0;
        self.active.send_modify(|n| {
            *n = n.saturating_sub(1);
            count = *n;
        });
        metrics::record_active_connections(count);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let (guard1, _rx1) = tracker.track(addr(4001));
        assert_eq!(tracker.active_count(), 1);

        let (guard2, _rx2) = tracker.track(addr(4002));
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(guard1.id(), guard2.id());

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);

        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn peers_registered_until_guard_drops() {
        let tracker = ConnectionTracker::new();
        let (first, _rx1) = tracker.track(addr(4001));
        let (_second, _rx2) = tracker.track(addr(4002));

        let peers: Vec<_> = tracker.peers().into_iter().map(|p| p.peer).collect();
        assert_eq!(peers, vec![addr(4001), addr(4002)]);
        assert!(tracker.peers().iter().any(|p| p.peer == addr(4001)));
        assert_eq!(first.info().peer, addr(4001));

        drop(first);
        assert!(tracker.peers().iter().all(|p| p.peer != addr(4001)));
        assert_eq!(tracker.peers().len(), 1);
    }

    #[tokio::test]
    async fn send_to_reaches_only_the_named_peer() {
        let tracker = ConnectionTracker::new();
        let (_a, mut rx_a) = tracker.track(addr(4001));
        let (_b, mut rx_b) = tracker.track(addr(4002));

        tracker.send_to(addr(4002), b"hello".to_vec()).unwrap();
        assert_eq!(rx_b.recv().await.unwrap(), b"hello".to_vec());
        assert!(rx_a.try_recv().is_err());

        assert_eq!(
            tracker.send_to(addr(4999), vec![]),
            Err(PushError::NotConnected(addr(4999)))
        );
    }

    #[test]
    fn send_to_reports_full_queue() {
        let tracker = ConnectionTracker::new();
        let (_guard, _rx) = tracker.track(addr(4001));
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            tracker.send_to(addr(4001), vec![1]).unwrap();
        }
        assert_eq!(
            tracker.send_to(addr(4001), vec![1]),
            Err(PushError::Backlogged(addr(4001)))
        );
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_last_guard() {
        let tracker = ConnectionTracker::new();
        let (guard, _rx) = tracker.track(addr(4001));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("tracker should become idle")
            .unwrap();
    }
}
