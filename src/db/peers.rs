//! The peer directory.
//!
//! A persistent set of peers keyed by address, ordered by rank
//! ascending (lower rank wins). Peers are never deleted; a flaky peer
//! just sinks to the bottom of the ordering as its rank grows.

use std::collections::HashSet;

use anyhow::{anyhow, Result};
use rusqlite::Connection;
use tracing::warn;

use crate::db::open_connection;
use crate::types::{PeerInfo, ProxyType};

/// Directory of known peers.
pub struct PeerDirectory {
    conn: Connection,
}

impl PeerDirectory {
    /// Open (or create) the directory at the given path and seed it
    /// with the configured known peers.
    pub fn open(path: &str, known_peers: &[PeerInfo]) -> Result<Self> {
        let conn = open_connection(Some(path), "peer directory")?;
        Self::from_conn(conn, known_peers)
    }

    /// Open an in-memory directory, mainly for tests.
    pub fn open_in_memory(known_peers: &[PeerInfo]) -> Result<Self> {
        let conn = open_connection(None, "peer directory")?;
        Self::from_conn(conn, known_peers)
    }

    fn from_conn(conn: Connection, known_peers: &[PeerInfo]) -> Result<Self> {
        let directory = PeerDirectory { conn };
        directory.initialize()?;
        directory.sync_from(known_peers)?;
        Ok(directory)
    }

    fn initialize(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS peers (
                    address TEXT PRIMARY KEY,
                    rank INTEGER,
                    proxy_type TEXT,
                    proxy_addr TEXT
                )",
                [],
            )
            .map_err(|e| anyhow!("Failed to create peers table: {}", e))?;
        Ok(())
    }

    /// Every known peer, sorted by rank ascending.
    pub fn all(&self) -> Result<Vec<PeerInfo>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT address, rank, proxy_type, proxy_addr
                 FROM peers ORDER BY rank ASC",
            )
            .map_err(|e| anyhow!("Failed to prepare peer query: {}", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| anyhow!("Failed to query peers: {}", e))?;

        let mut peers = Vec::new();
        for row in rows {
            let (address, rank, proxy_type, proxy_address) =
                row.map_err(|e| anyhow!("Failed to read peer row: {}", e))?;
            let proxy_type = match ProxyType::parse(&proxy_type) {
                Some(pt) => pt,
                None => {
                    warn!("Peer '{}' has unknown proxy type '{}'", address, proxy_type);
                    ProxyType::None
                }
            };
            peers.push(PeerInfo {
                address,
                rank,
                proxy_type,
                proxy_address,
            });
        }
        Ok(peers)
    }

    /// The set of known addresses.
    pub fn addresses(&self) -> Result<HashSet<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT address FROM peers")
            .map_err(|e| anyhow!("Failed to prepare address query: {}", e))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| anyhow!("Failed to query addresses: {}", e))?;

        let mut addresses = HashSet::new();
        for row in rows {
            addresses.insert(row.map_err(|e| anyhow!("Failed to read address row: {}", e))?);
        }
        Ok(addresses)
    }

    /// Insert-if-absent by address. Ranks of existing entries are left
    /// untouched.
    pub fn sync_from(&self, peers: &[PeerInfo]) -> Result<usize> {
        if peers.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| anyhow!("Failed to begin transaction: {}", e))?;
        let mut inserted = 0;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR IGNORE INTO peers (address, rank, proxy_type, proxy_addr)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| anyhow!("Failed to prepare peer insert: {}", e))?;
            for peer in peers {
                inserted += stmt
                    .execute(rusqlite::params![
                        peer.address,
                        peer.rank,
                        peer.proxy_type.as_str(),
                        peer.proxy_address,
                    ])
                    .map_err(|e| anyhow!("Failed to insert peer: {}", e))?;
            }
        }
        tx.commit()
            .map_err(|e| anyhow!("Failed to commit peer inserts: {}", e))?;
        Ok(inserted)
    }

    /// Write back a measured rank for an existing entry, keyed by
    /// address.
    pub fn update_rank(&self, peer: &PeerInfo) -> Result<()> {
        self.conn
            .execute(
                "UPDATE peers SET rank = ?1 WHERE address = ?2",
                rusqlite::params![peer.rank, peer.address],
            )
            .map_err(|e| anyhow!("Failed to update peer rank: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_from_known_peers() {
        let seed = vec![
            PeerInfo::new("tcp://a:1000"),
            PeerInfo::new("tcp://b:1000"),
        ];
        let directory = PeerDirectory::open_in_memory(&seed).unwrap();
        assert_eq!(directory.all().unwrap().len(), 2);
    }

    #[test]
    fn test_all_sorted_by_rank_ascending() {
        let mut slow = PeerInfo::new("tcp://slow:1000");
        slow.rank = 500;
        let fast = PeerInfo::new("tcp://fast:1000");
        let directory = PeerDirectory::open_in_memory(&[slow, fast]).unwrap();

        let peers = directory.all().unwrap();
        assert_eq!(peers[0].address, "tcp://fast:1000");
        assert_eq!(peers[1].address, "tcp://slow:1000");
    }

    #[test]
    fn test_sync_from_does_not_overwrite_rank() {
        let directory = PeerDirectory::open_in_memory(&[PeerInfo::new("tcp://a:1000")]).unwrap();

        let mut reranked = PeerInfo::new("tcp://a:1000");
        reranked.rank = 999;
        assert_eq!(directory.sync_from(&[reranked]).unwrap(), 0);
        assert_eq!(directory.all().unwrap()[0].rank, 0);
    }

    #[test]
    fn test_update_rank() {
        let directory = PeerDirectory::open_in_memory(&[PeerInfo::new("tcp://a:1000")]).unwrap();

        let mut peer = directory.all().unwrap().remove(0);
        peer.rank = 40;
        directory.update_rank(&peer).unwrap();
        assert_eq!(directory.all().unwrap()[0].rank, 40);
    }

    #[test]
    fn test_addresses() {
        let directory = PeerDirectory::open_in_memory(&[
            PeerInfo::new("tcp://a:1000"),
            PeerInfo::new("tcp://b:1000"),
        ])
        .unwrap();
        let addresses = directory.addresses().unwrap();
        assert!(addresses.contains("tcp://a:1000"));
        assert!(addresses.contains("tcp://b:1000"));
    }

    #[test]
    fn test_proxied_peer_round_trip() {
        let peer = PeerInfo::with_proxy("tcp://hidden:1000", ProxyType::Socks5, "tcp://proxy:9050");
        let directory = PeerDirectory::open_in_memory(&[peer]).unwrap();

        let stored = directory.all().unwrap().remove(0);
        assert_eq!(stored.proxy_type, ProxyType::Socks5);
        assert_eq!(stored.proxy_address, "tcp://proxy:9050");
    }
}
