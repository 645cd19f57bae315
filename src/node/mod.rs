//! The local node: the result store and peer directory behind one
//! lock, plus the table of remotely-callable functions.

pub mod remote;
pub mod sync;

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use rmpv::Value;
use tracing::debug;

use crate::config::NodeConfig;
use crate::db::{PeerDirectory, ResultStore};
use crate::rpc::codec;
use crate::rpc::server::{DispatchOutcome, Dispatcher};
use crate::seeker::{ResultCache, Seeker};
use crate::types::{PeerInfo, ResultHash, SearchResult};

pub use remote::RemoteNode;

/// Function code for pulling results absent from the caller's store.
pub const FUN_GET_RESULTS_FOR_SYNC: u64 = 101;
/// Function code for pulling the peer directory snapshot.
pub const FUN_GET_PEERS_FOR_SYNC: u64 = 102;
/// Function code for announcing the caller as a sync candidate.
pub const FUN_HANDSHAKE: u64 = 103;

/// The mutable node state, reachable only through the node lock.
pub struct NodeState {
    pub store: ResultStore,
    pub directory: PeerDirectory,
}

/// A running node's local half: persistence plus the query federator.
pub struct LocalNode {
    state: Mutex<NodeState>,
    seeker: Seeker,
}

impl LocalNode {
    /// Open both databases at their configured paths and build the
    /// federator from the configured engines.
    pub fn open(config: &NodeConfig) -> Result<Self> {
        let store = ResultStore::open(&config.searches_database_path)?;
        let directory = PeerDirectory::open(&config.peer_database_path, &config.known_peers)?;
        let seeker = Seeker::from_config(
            &config.search_engines,
            config.minimum_search_results_threshold,
        );
        Ok(Self::new(store, directory, seeker))
    }

    /// Assemble a node from already-open parts.
    pub fn new(store: ResultStore, directory: PeerDirectory, seeker: Seeker) -> Self {
        LocalNode {
            state: Mutex::new(NodeState { store, directory }),
            seeker,
        }
    }

    /// The node lock. Held briefly around store/directory operations;
    /// never across outbound network I/O.
    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------
    // UI-facing operations
    // ------------------------------------------------------------------

    /// Federated search: cache hits, engine fallback, write-back.
    pub fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.seeker.search(self, query, &[])
    }

    /// Federated search restricted to the given content types.
    pub fn search_filtered(
        &self,
        query: &str,
        filter_content_types: &[String],
    ) -> Result<Vec<SearchResult>> {
        self.seeker.search(self, query, filter_content_types)
    }

    /// Insert a result authored locally (e.g. a link submitted through
    /// the UI). Fails loudly if persistence fails.
    pub fn insert_new_result(
        &self,
        title: &str,
        url: &str,
        description: &str,
        content_type: &str,
    ) -> Result<()> {
        let result = SearchResult::with_content_type(title, url, description, content_type);
        self.state().store.insert_many(&[result])?;
        Ok(())
    }

    /// Bump a result's score; unknown hashes are a no-op.
    pub fn bump_score(&self, hash: &ResultHash, delta: i64) -> Result<()> {
        self.state().store.bump_score(hash, delta)
    }

    // ------------------------------------------------------------------
    // Remotely-callable operations
    // ------------------------------------------------------------------

    /// Record the calling peer as a sync candidate (insert-if-absent).
    pub fn handshake(&self, peer: PeerInfo) -> Result<()> {
        debug!("Handshake from {}", peer.address);
        self.state().directory.sync_from(&[peer])?;
        Ok(())
    }

    /// Every stored result whose fingerprint is not in the given set.
    pub fn results_not_in(&self, hashes: &HashSet<ResultHash>) -> Result<Vec<SearchResult>> {
        let results = self.state().store.all()?;
        Ok(results
            .into_iter()
            .filter(|r| !hashes.contains(&r.hash))
            .collect())
    }

    /// Snapshot of the peer directory, rank ascending.
    pub fn peers_for_sync(&self) -> Result<Vec<PeerInfo>> {
        self.state().directory.all()
    }

    // ------------------------------------------------------------------
    // Sync-worker support
    // ------------------------------------------------------------------

    pub fn peers_snapshot(&self) -> Result<Vec<PeerInfo>> {
        self.state().directory.all()
    }

    pub fn hashes_snapshot(&self) -> Result<HashSet<ResultHash>> {
        self.state().store.hashes()
    }

    pub fn sync_results_from(&self, results: &[SearchResult]) -> Result<usize> {
        self.state().store.sync_from(results)
    }

    pub fn sync_peers_from(&self, peers: &[PeerInfo]) -> Result<usize> {
        self.state().directory.sync_from(peers)
    }

    pub fn update_peer_rank(&self, peer: &PeerInfo) -> Result<()> {
        self.state().directory.update_rank(peer)
    }
}

impl ResultCache for LocalNode {
    fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.state().store.search(query)
    }

    fn sync_from(&self, results: &[SearchResult]) -> Result<usize> {
        self.state().store.sync_from(results)
    }
}

impl Dispatcher for LocalNode {
    fn dispatch(&self, fun_code: u64, args: Vec<Value>) -> DispatchOutcome {
        let outcome = match fun_code {
            FUN_HANDSHAKE => self.dispatch_handshake(args),
            FUN_GET_RESULTS_FOR_SYNC => self.dispatch_results_not_in(args),
            FUN_GET_PEERS_FOR_SYNC => self.dispatch_peers_for_sync(args),
            _ => return DispatchOutcome::UnknownFunction,
        };
        match outcome {
            Ok(value) => DispatchOutcome::Value(value),
            Err(e) => DispatchOutcome::Failed(format!("{e:#}")),
        }
    }
}

impl LocalNode {
    fn dispatch_handshake(&self, args: Vec<Value>) -> Result<Value> {
        if args.len() != 1 {
            return Err(anyhow!("handshake expects 1 argument, got {}", args.len()));
        }
        let peer = codec::value_to_peer(&args[0])?;
        self.handshake(peer)?;
        Ok(Value::Nil)
    }

    fn dispatch_results_not_in(&self, args: Vec<Value>) -> Result<Value> {
        if args.len() != 1 {
            return Err(anyhow!(
                "results_not_in expects 1 argument, got {}",
                args.len()
            ));
        }
        let hashes = codec::value_to_hashes(&args[0])?;
        let results = self.results_not_in(&hashes)?;
        debug!("Answering sync request with {} results", results.len());
        Ok(codec::results_to_value(&results)?)
    }

    fn dispatch_peers_for_sync(&self, args: Vec<Value>) -> Result<Value> {
        if !args.is_empty() {
            return Err(anyhow!(
                "peers_for_sync expects no arguments, got {}",
                args.len()
            ));
        }
        let peers = self.peers_for_sync()?;
        Ok(codec::peers_to_value(&peers)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node() -> LocalNode {
        let store = ResultStore::open_in_memory().unwrap();
        let directory = PeerDirectory::open_in_memory(&[]).unwrap();
        LocalNode::new(store, directory, Seeker::new(vec![], 0))
    }

    #[test]
    fn test_results_not_in_filters_known_hashes() {
        let node = test_node();
        node.insert_new_result("one", "http://one/", "d", "text/html")
            .unwrap();
        node.insert_new_result("two", "http://two/", "d", "text/html")
            .unwrap();

        let all = node.results_not_in(&HashSet::new()).unwrap();
        assert_eq!(all.len(), 2);

        let known: HashSet<ResultHash> = [all[0].hash].into_iter().collect();
        let missing = node.results_not_in(&known).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].hash, all[1].hash);
    }

    #[test]
    fn test_handshake_registers_peer_once() {
        let node = test_node();
        let peer = PeerInfo::new("tcp://caller:4222");
        node.handshake(peer.clone()).unwrap();
        node.handshake(peer).unwrap();
        assert_eq!(node.peers_for_sync().unwrap().len(), 1);
    }

    #[test]
    fn test_dispatch_peers_for_sync() {
        let node = test_node();
        node.handshake(PeerInfo::new("tcp://caller:4222")).unwrap();

        match node.dispatch(FUN_GET_PEERS_FOR_SYNC, vec![]) {
            DispatchOutcome::Value(value) => {
                let peers = codec::value_to_peers(&value).unwrap();
                assert_eq!(peers.len(), 1);
                assert_eq!(peers[0].address, "tcp://caller:4222");
            }
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn test_dispatch_unknown_function() {
        let node = test_node();
        assert!(matches!(
            node.dispatch(999, vec![]),
            DispatchOutcome::UnknownFunction
        ));
    }

    #[test]
    fn test_dispatch_arity_mismatch_fails() {
        let node = test_node();
        assert!(matches!(
            node.dispatch(FUN_GET_PEERS_FOR_SYNC, vec![Value::Nil]),
            DispatchOutcome::Failed(_)
        ));
        assert!(matches!(
            node.dispatch(FUN_HANDSHAKE, vec![]),
            DispatchOutcome::Failed(_)
        ));
    }

    #[test]
    fn test_dispatch_handshake_round_trip() {
        let node = test_node();
        let peer = PeerInfo::new("tcp://caller:4222");
        let value = codec::peer_to_value(&peer).unwrap();
        assert!(matches!(
            node.dispatch(FUN_HANDSHAKE, vec![value]),
            DispatchOutcome::Value(Value::Nil)
        ));
        assert_eq!(node.peers_for_sync().unwrap().len(), 1);
    }
}
