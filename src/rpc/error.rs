//! Typed errors for the RPC layer.
//!
//! The sync worker pattern-matches on these to decide the rank penalty
//! for a peer: a protocol failure is cheap (+100), an unreachable peer
//! is expensive (+1000).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// Framing, decompression, tag mismatch, unknown function, wrong
    /// argument shape, or an ERROR response from the remote side.
    /// `fun_code` is 0 when the failure happened before a function code
    /// was known.
    #[error("Protocol error in function {fun_code}: {message}")]
    Protocol { fun_code: u64, message: String },

    /// TCP connect failure, proxy failure, or timeout before any byte
    /// was received.
    #[error("Failed connecting to {host}: {message}")]
    Connection { host: String, message: String },
}

impl RpcError {
    pub fn protocol(fun_code: u64, message: impl Into<String>) -> Self {
        RpcError::Protocol {
            fun_code,
            message: message.into(),
        }
    }

    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        RpcError::Connection {
            host: host.into(),
            message: message.into(),
        }
    }
}
