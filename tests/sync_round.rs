//! Two-node sync scenarios over real localhost sockets.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use packhound::{
    run_sync_round, LocalNode, PeerDirectory, PeerInfo, RemoteNode, ResultStore, SearchResult,
    Seeker, SyncServer, SyncSettings,
};

fn node_with(results: &[SearchResult], peers: &[PeerInfo]) -> Arc<LocalNode> {
    let store = ResultStore::open_in_memory().unwrap();
    store.insert_many(results).unwrap();
    let directory = PeerDirectory::open_in_memory(peers).unwrap();
    Arc::new(LocalNode::new(store, directory, Seeker::new(vec![], 0)))
}

fn settings(discoverable: bool) -> SyncSettings {
    SyncSettings {
        frequency: Duration::from_secs(3600),
        fanout: 7,
        self_peer: PeerInfo::new("tcp://127.0.0.1:39999"),
        discoverable,
    }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[test]
fn sync_round_pulls_missing_results() {
    let r1 = SearchResult::new("one", "http://one/", "first");
    let r2 = SearchResult::new("two", "http://two/", "second");

    // node B holds {r1, r2} and serves sync requests
    let node_b = node_with(&[r1.clone(), r2.clone()], &[]);
    let server = SyncServer::start(node_b.clone(), "127.0.0.1", 0).unwrap();

    // node A holds {r1} and knows B
    let peer_b = PeerInfo::new(&format!("tcp://127.0.0.1:{}", server.port()));
    let node_a = node_with(&[r1.clone()], &[peer_b]);

    run_sync_round(&node_a, &settings(false));

    // A converged on B's corpus
    let hashes_a = node_a.hashes_snapshot().unwrap();
    assert_eq!(hashes_a.len(), 2);
    assert!(hashes_a.contains(&r1.hash));
    assert!(hashes_a.contains(&r2.hash));

    // B is unchanged
    assert_eq!(node_b.hashes_snapshot().unwrap().len(), 2);
    assert!(node_b.peers_for_sync().unwrap().is_empty());

    // B's rank was updated (throughput reward, no penalty)
    let peers_a = node_a.peers_snapshot().unwrap();
    assert_eq!(peers_a.len(), 1);
    assert!(peers_a[0].rank <= 0);

    server.stop();
}

#[test]
fn sync_round_announces_discoverable_node() {
    let node_b = node_with(&[], &[]);
    let server = SyncServer::start(node_b.clone(), "127.0.0.1", 0).unwrap();

    let peer_b = PeerInfo::new(&format!("tcp://127.0.0.1:{}", server.port()));
    let node_a = node_with(&[], &[peer_b]);

    run_sync_round(&node_a, &settings(true));

    // the handshake registered A's self peer in B's directory
    let peers_b = node_b.peers_for_sync().unwrap();
    assert_eq!(peers_b.len(), 1);
    assert_eq!(peers_b[0].address, "tcp://127.0.0.1:39999");

    server.stop();
}

#[test]
fn sync_round_pulls_remote_peers() {
    let known_to_b = PeerInfo::new("tcp://10.9.8.7:4222");
    let node_b = node_with(&[], &[known_to_b.clone()]);
    let server = SyncServer::start(node_b, "127.0.0.1", 0).unwrap();

    let peer_b = PeerInfo::new(&format!("tcp://127.0.0.1:{}", server.port()));
    let node_a = node_with(&[], &[peer_b]);

    run_sync_round(&node_a, &settings(false));

    let addresses: Vec<String> = node_a
        .peers_snapshot()
        .unwrap()
        .into_iter()
        .map(|p| p.address)
        .collect();
    assert!(addresses.contains(&known_to_b.address));

    server.stop();
}

#[test]
fn unreachable_peer_is_penalized_and_store_untouched() {
    let mut peer = PeerInfo::new(&format!("tcp://127.0.0.1:{}", free_port()));
    peer.rank = 50;
    let node_a = node_with(&[], &[peer]);

    run_sync_round(&node_a, &settings(false));

    let peers = node_a.peers_snapshot().unwrap();
    assert_eq!(peers[0].rank, 1050);
    assert!(node_a.hashes_snapshot().unwrap().is_empty());
}

#[test]
fn inconsistent_results_do_not_cross_the_wire_boundary() {
    // node B serves a result that was tampered with after hashing
    let mut bad = SearchResult::new("good", "http://good/", "d");
    bad.title = "evil".to_string();

    let store = ResultStore::open_in_memory().unwrap();
    let directory = PeerDirectory::open_in_memory(&[]).unwrap();
    let node_b = Arc::new(LocalNode::new(store, directory, Seeker::new(vec![], 0)));
    // bypass the store's own consistency check by syncing A from a
    // hand-built response instead: the merge rule itself must drop it
    assert_eq!(node_b.sync_results_from(&[bad]).unwrap(), 0);
    assert!(node_b.hashes_snapshot().unwrap().is_empty());
}

#[test]
fn remote_node_round_trip_against_live_server() {
    let r1 = SearchResult::new("one", "http://one/", "first");
    let node_b = node_with(&[r1.clone()], &[PeerInfo::new("tcp://seed:1")]);
    let server = SyncServer::start(node_b, "127.0.0.1", 0).unwrap();

    let peer_b = PeerInfo::new(&format!("tcp://127.0.0.1:{}", server.port()));
    let mut remote = RemoteNode::new(&peer_b).unwrap();

    let results = remote.results_not_in(&Default::default()).unwrap();
    assert_eq!(results, vec![r1.clone()]);

    // results the caller already has are filtered out
    let known = [r1.hash].into_iter().collect();
    assert!(remote.results_not_in(&known).unwrap().is_empty());

    let peers = remote.peers_for_sync().unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, "tcp://seed:1");

    server.stop();
}
