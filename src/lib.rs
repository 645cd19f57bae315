#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Packhound - a peer-to-peer web-search node
//!
//! Each node keeps a local SQLite cache of search results, answers
//! queries from that cache (falling back to HTML-scraping engines when
//! the cache is thin), and periodically gossips with other nodes to
//! converge on a shared corpus of results and a shared peer directory.
//!
//! # Architecture
//!
//! - **[`types`]**: the two domain records, `SearchResult`
//!   (content-addressed by a Merkle-style SHA-256 fingerprint) and
//!   `PeerInfo` (rank-ordered, lower is better).
//!
//! - **[`db`]**: persistence. `ResultStore` is the content-addressed
//!   result cache; `PeerDirectory` the rank-ordered peer set. Both are
//!   SQLite files reached only through the node-level lock.
//!
//! - **[`rpc`]**: the wire layer. One zlib-compressed MessagePack
//!   message per connection in each direction, no length prefix, no
//!   keep-alive: a peer half-closes once its message is sent. The
//!   server side runs a non-blocking accept loop feeding a small
//!   worker pool.
//!
//! - **[`seeker`]**: the search federator. Local cache hits first;
//!   when they are too few, configured engines are scraped and the
//!   union is written back to the cache.
//!
//! - **[`node`]**: `LocalNode` composes store, directory and federator
//!   behind one mutex and exposes the three remotely-callable
//!   functions (handshake, pull-missing-results, pull-peers).
//!   `node::sync` runs the inbound server thread and the periodic
//!   outbound sync worker that maintains peer ranks.
//!
//! - **[`config`]**: the INI configuration file surface, with
//!   environment-variable overrides for the `[general]` options.
//!
//! # Consistency model
//!
//! The result corpus is eventually consistent. Results are only ever
//! added, never deleted; an inconsistent result (stored fingerprint
//! not matching the recomputed one) is silently dropped at every sync
//! boundary, so a corrupted or forged record cannot propagate.

pub mod config;
pub mod db;
pub mod node;
pub mod rpc;
pub mod seeker;
pub mod types;

pub use config::{EngineConfig, NodeConfig};
pub use db::{PeerDirectory, ResultStore};
pub use node::sync::{run_sync_round, StopSignal, SyncServer, SyncSettings, SyncWorker};
pub use node::{LocalNode, RemoteNode};
pub use seeker::{SearchProvider, Seeker};
pub use types::{PeerInfo, ProxyType, ResultHash, SearchResult};
