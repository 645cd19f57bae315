//! Typed client view of another node.

use std::collections::HashSet;

use anyhow::Result;

use crate::node::{FUN_GET_PEERS_FOR_SYNC, FUN_GET_RESULTS_FOR_SYNC, FUN_HANDSHAKE};
use crate::rpc::client::{ProxyEndpoint, RpcClient};
use crate::rpc::codec;
use crate::rpc::error::RpcError;
use crate::types::{PeerInfo, ResultHash, SearchResult};

/// A remote node, addressed by its [`PeerInfo`]. Every method call is
/// one fresh connection carrying one framed request.
pub struct RemoteNode {
    client: RpcClient,
}

impl RemoteNode {
    /// Build a client for the peer, through its proxy if it has one.
    /// Fails only on a malformed address.
    pub fn new(peer: &PeerInfo) -> Result<Self> {
        let (host, port) = peer.host_port()?;
        let client = if peer.has_proxy() {
            let (proxy_host, proxy_port) = peer.proxy_host_port()?;
            RpcClient::with_proxy(
                &host,
                port,
                ProxyEndpoint {
                    proxy_type: peer.proxy_type,
                    host: proxy_host,
                    port: proxy_port,
                },
            )
        } else {
            RpcClient::new(&host, port)
        };
        Ok(RemoteNode { client })
    }

    /// Announce `self_peer` so the remote node records it as a sync
    /// candidate.
    pub fn handshake(&mut self, self_peer: &PeerInfo) -> Result<(), RpcError> {
        let peer_value = codec::peer_to_value(self_peer)?;
        self.client.call_remote(FUN_HANDSHAKE, vec![peer_value])?;
        Ok(())
    }

    /// Pull every result the remote node has that is missing from the
    /// given fingerprint set.
    pub fn results_not_in(
        &mut self,
        hashes: &HashSet<ResultHash>,
    ) -> Result<Vec<SearchResult>, RpcError> {
        let payload = self
            .client
            .call_remote(FUN_GET_RESULTS_FOR_SYNC, vec![codec::hashes_to_value(hashes)])?;
        codec::value_to_results(&payload)
    }

    /// Pull the remote node's peer directory snapshot.
    pub fn peers_for_sync(&mut self) -> Result<Vec<PeerInfo>, RpcError> {
        let payload = self.client.call_remote(FUN_GET_PEERS_FOR_SYNC, vec![])?;
        codec::value_to_peers(&payload)
    }

    /// Download throughput observed on the last call, in MB/s.
    pub fn last_download_speed_mb_s(&self) -> f64 {
        self.client.last_download_speed_mb_s()
    }
}
