//! The node's two long-lived activities: the inbound sync server and
//! the periodic outbound sync worker.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::node::{LocalNode, RemoteNode};
use crate::rpc::error::RpcError;
use crate::rpc::server::{RpcTcpServer, ServerHandle};
use crate::types::{PeerInfo, ResultHash};

/// Cooperative stop flag shared between the main thread and the
/// workers. Waiters wake early when the flag is raised.
pub struct StopSignal {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        StopSignal {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        *stopped = true;
        drop(stopped);
        self.cv.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Sleep up to `timeout`; returns true when the signal fired.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cv
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            stopped = guard;
        }
        true
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|p| p.into_inner());
        while !*stopped {
            stopped = self.cv.wait(stopped).unwrap_or_else(|p| p.into_inner());
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The inbound half: an [`RpcTcpServer`] running on its own thread,
/// dispatching into the local node.
pub struct SyncServer {
    handle: ServerHandle,
    thread: JoinHandle<()>,
    port: u16,
}

impl SyncServer {
    pub fn start(node: Arc<LocalNode>, host: &str, port: u16) -> Result<Self> {
        let server = RpcTcpServer::bind(host, port, node)?;
        let port = server.local_port()?;
        let handle = server.handle();
        let thread = std::thread::Builder::new()
            .name("sync-server".to_string())
            .spawn(move || {
                if let Err(e) = server.serve() {
                    error!("Sync server failed: {:#}", e);
                }
            })
            .map_err(|e| anyhow!("Failed to spawn sync server thread: {}", e))?;
        Ok(SyncServer {
            handle,
            thread,
            port,
        })
    }

    /// The actually bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(self) {
        info!("Shutting down sync server...");
        self.handle.shutdown();
        let _ = self.thread.join();
    }
}

/// Settings driving the outbound sync worker.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Seconds between sync rounds.
    pub frequency: Duration,
    /// How many of the best-ranked peers each round visits.
    pub fanout: usize,
    /// This node's externally reachable identity.
    pub self_peer: PeerInfo,
    /// Whether to announce `self_peer` on each outbound conversation.
    pub discoverable: bool,
}

/// The outbound half: a periodic worker pulling missing results and
/// peers from the best-ranked neighbors.
pub struct SyncWorker {
    stop: Arc<StopSignal>,
    thread: JoinHandle<()>,
}

impl SyncWorker {
    pub fn start(node: Arc<LocalNode>, settings: SyncSettings) -> Result<Self> {
        let stop = Arc::new(StopSignal::new());
        let worker_stop = stop.clone();
        let thread = std::thread::Builder::new()
            .name("sync-worker".to_string())
            .spawn(move || {
                info!("Started sync worker");
                // the stop signal is observed between ticks; an
                // in-flight round is never interrupted
                while !worker_stop.wait_for(settings.frequency) {
                    run_sync_round(&node, &settings);
                }
                info!("Sync worker done");
            })
            .map_err(|e| anyhow!("Failed to spawn sync worker thread: {}", e))?;
        Ok(SyncWorker { stop, thread })
    }

    pub fn stop(self) {
        info!("Shutting down sync worker...");
        self.stop.signal();
        let _ = self.thread.join();
    }
}

#[derive(Debug, Error)]
enum SyncFailure {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

/// One pass over the top-ranked peers. Every visited peer gets its
/// rank updated exactly once.
pub fn run_sync_round(node: &LocalNode, settings: &SyncSettings) {
    let peers = match node.peers_snapshot() {
        Ok(peers) => peers,
        Err(e) => {
            error!("Failed to snapshot peers: {:#}", e);
            return;
        }
    };
    let hashes = match node.hashes_snapshot() {
        Ok(hashes) => hashes,
        Err(e) => {
            error!("Failed to snapshot result hashes: {:#}", e);
            return;
        }
    };

    for mut peer in peers.into_iter().take(settings.fanout) {
        info!("Syncing from {}", peer.address);
        let outcome = sync_with_peer(node, &peer, &hashes, settings);
        if let Err(failure) = &outcome {
            warn!("Sync with {} failed: {}", peer.address, failure);
        }
        peer.rank = next_rank(peer.rank, &outcome);
        if let Err(e) = node.update_peer_rank(&peer) {
            error!("Failed to persist rank for {}: {:#}", peer.address, e);
        }
    }
}

fn sync_with_peer(
    node: &LocalNode,
    peer: &PeerInfo,
    hashes: &HashSet<ResultHash>,
    settings: &SyncSettings,
) -> Result<f64, SyncFailure> {
    let mut remote = RemoteNode::new(peer)?;
    if settings.discoverable {
        remote.handshake(&settings.self_peer)?;
    }
    let results = remote.results_not_in(hashes)?;
    node.sync_results_from(&results)?;
    let peers = remote.peers_for_sync()?;
    node.sync_peers_from(&peers)?;
    Ok(remote.last_download_speed_mb_s())
}

/// The rank rule: reward throughput, penalize protocol failures a
/// little and unreachable peers a lot, ignore local failures.
fn next_rank(rank: i64, outcome: &Result<f64, SyncFailure>) -> i64 {
    match outcome {
        Ok(speed) => rank.saturating_sub(*speed as i64),
        Err(SyncFailure::Rpc(RpcError::Protocol { .. })) => rank.saturating_add(100),
        Err(SyncFailure::Rpc(RpcError::Connection { .. })) => rank.saturating_add(1000),
        Err(SyncFailure::Local(_)) => rank,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_rank_rewards_throughput() {
        assert_eq!(next_rank(50, &Ok(10.0)), 40);
    }

    #[test]
    fn test_next_rank_protocol_penalty() {
        let outcome = Err(SyncFailure::Rpc(RpcError::protocol(101, "bad frame")));
        assert_eq!(next_rank(50, &outcome), 150);
    }

    #[test]
    fn test_next_rank_connection_penalty() {
        let outcome = Err(SyncFailure::Rpc(RpcError::connection("peer", "refused")));
        assert_eq!(next_rank(50, &outcome), 1050);
    }

    #[test]
    fn test_next_rank_local_failure_leaves_rank() {
        let outcome = Err(SyncFailure::Local(anyhow!("disk full")));
        assert_eq!(next_rank(50, &outcome), 50);
    }

    #[test]
    fn test_next_rank_saturates() {
        let outcome = Err(SyncFailure::Rpc(RpcError::connection("peer", "refused")));
        assert_eq!(next_rank(i64::MAX, &outcome), i64::MAX);
        assert_eq!(next_rank(i64::MIN, &Ok(10.0)), i64::MIN);
    }

    #[test]
    fn test_stop_signal_wakes_waiter() {
        let signal = Arc::new(StopSignal::new());
        let waiter_signal = signal.clone();
        let waiter = std::thread::spawn(move || waiter_signal.wait_for(Duration::from_secs(30)));

        std::thread::sleep(Duration::from_millis(50));
        signal.signal();
        assert!(waiter.join().unwrap());
        assert!(signal.is_signaled());
    }

    #[test]
    fn test_stop_signal_times_out() {
        let signal = StopSignal::new();
        assert!(!signal.wait_for(Duration::from_millis(20)));
    }
}
