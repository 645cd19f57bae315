//! Peer-to-peer RPC: wire codec, one-shot client, and the inbound
//! server.

pub mod client;
pub mod codec;
pub mod error;
pub mod server;

pub use client::{ProxyEndpoint, RpcClient};
pub use error::RpcError;
pub use server::{DispatchOutcome, Dispatcher, RpcTcpServer, ServerHandle};
