//! One-shot RPC client.
//!
//! Each call opens a fresh connection (optionally through the peer's
//! SOCKS4/SOCKS5/HTTP proxy), sends one framed request, half-closes,
//! and reads the response until a short read, EOF, or timeout. The
//! client also meters the download throughput of its last call, which
//! the sync worker feeds into peer ranking.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use rmpv::Value;
use tracing::debug;

use crate::rpc::codec::{self, OP_CALL, OP_ERROR, OP_RETURN, RECV_CHUNK_LEN};
use crate::rpc::error::RpcError;
use crate::types::ProxyType;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxy endpoint for reaching a peer.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    pub proxy_type: ProxyType,
    pub host: String,
    pub port: u16,
}

/// RPC client bound to one remote endpoint.
pub struct RpcClient {
    host: String,
    port: u16,
    proxy: Option<ProxyEndpoint>,
    last_download_speed: f64,
}

impl RpcClient {
    /// Client for a direct connection.
    pub fn new(host: &str, port: u16) -> Self {
        RpcClient {
            host: host.to_string(),
            port,
            proxy: None,
            last_download_speed: 0.0,
        }
    }

    /// Client that connects through a proxy.
    pub fn with_proxy(host: &str, port: u16, proxy: ProxyEndpoint) -> Self {
        RpcClient {
            host: host.to_string(),
            port,
            proxy: Some(proxy),
            last_download_speed: 0.0,
        }
    }

    /// Approximate download throughput of the last completed call, in
    /// MB/s. Zero when the last response fit in a single chunk.
    pub fn last_download_speed_mb_s(&self) -> f64 {
        self.last_download_speed
    }

    /// Perform one remote call: connect, send `(CALL, fun_code, args)`,
    /// read and decode the response.
    pub fn call_remote(&mut self, fun_code: u64, args: Vec<Value>) -> Result<Value, RpcError> {
        let request = codec::encode_message(OP_CALL, fun_code, Value::Array(args))?;

        let mut stream = self
            .connect()
            .map_err(|e| RpcError::connection(&self.host, e.to_string()))?;
        stream
            .write_all(&request)
            .map_err(|e| RpcError::connection(&self.host, e.to_string()))?;
        // half-close so the remote read loop sees EOF
        stream
            .shutdown(Shutdown::Write)
            .map_err(|e| RpcError::connection(&self.host, e.to_string()))?;

        let buffer = self.read_response(&mut stream)?;
        debug!("Received {} compressed bytes from {}", buffer.len(), self.host);

        let (op_code, response_fun, payload) = codec::decode_message(&buffer)?;
        match op_code {
            OP_RETURN => Ok(payload),
            OP_ERROR => Err(RpcError::protocol(
                response_fun,
                payload.as_str().unwrap_or("unspecified remote error"),
            )),
            other => Err(RpcError::protocol(
                response_fun,
                format!("Unexpected op code {other} in response"),
            )),
        }
    }

    /// Chunked close-on-complete read, metering throughput from the
    /// first byte to the last.
    fn read_response(&mut self, stream: &mut TcpStream) -> Result<Vec<u8>, RpcError> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; RECV_CHUNK_LEN];
        let mut first_chunk_len = 0usize;
        let mut started: Option<Instant> = None;

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if started.is_none() {
                        started = Some(Instant::now());
                        first_chunk_len = n;
                    }
                    buffer.extend_from_slice(&chunk[..n]);
                    if n < RECV_CHUNK_LEN {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if buffer.is_empty() {
                        return Err(RpcError::connection(
                            &self.host,
                            "Timed out before any byte was received",
                        ));
                    }
                    // timeout with data buffered: treat as complete
                    break;
                }
                Err(e) => return Err(RpcError::connection(&self.host, e.to_string())),
            }
        }

        if buffer.is_empty() {
            return Err(RpcError::connection(
                &self.host,
                "Connection closed before any byte was received",
            ));
        }

        if let Some(started) = started {
            let elapsed_ms = (started.elapsed().as_secs_f64() * 1000.0).max(1.0);
            let metered = buffer.len().saturating_sub(first_chunk_len) as f64;
            self.last_download_speed = metered / (1024.0 * 1024.0) / (elapsed_ms / 1000.0);
        }

        Ok(buffer)
    }

    fn connect(&self) -> std::io::Result<TcpStream> {
        let stream = match &self.proxy {
            None => tcp_connect(&self.host, self.port)?,
            Some(proxy) => {
                let mut stream = tcp_connect(&proxy.host, proxy.port)?;
                stream.set_read_timeout(Some(IO_TIMEOUT))?;
                stream.set_write_timeout(Some(IO_TIMEOUT))?;
                match proxy.proxy_type {
                    ProxyType::Socks5 => socks5_connect(&mut stream, &self.host, self.port)?,
                    ProxyType::Socks4 => socks4_connect(&mut stream, &self.host, self.port)?,
                    ProxyType::Http => http_connect(&mut stream, &self.host, self.port)?,
                    // a peer with proxy type "none" is just direct
                    ProxyType::None => {}
                }
                stream
            }
        };
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;
        Ok(stream)
    }
}

fn tcp_connect(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("'{host}' resolved to no addresses"),
        )
    }))
}

fn proxy_err(message: String) -> std::io::Error {
    std::io::Error::other(message)
}

/// Minimal SOCKS5 CONNECT with no authentication (RFC 1928). The
/// destination is always sent as a domain name so resolution happens on
/// the proxy side.
fn socks5_connect(stream: &mut TcpStream, host: &str, port: u16) -> std::io::Result<()> {
    stream.write_all(&[0x05, 0x01, 0x00])?;
    let mut method = [0u8; 2];
    stream.read_exact(&mut method)?;
    if method != [0x05, 0x00] {
        return Err(proxy_err("SOCKS5 proxy refused the no-auth method".into()));
    }

    let host_bytes = host.as_bytes();
    if host_bytes.len() > 255 {
        return Err(proxy_err("SOCKS5 destination hostname too long".into()));
    }
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host_bytes.len() as u8];
    request.extend_from_slice(host_bytes);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request)?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head)?;
    if head[1] != 0x00 {
        return Err(proxy_err(format!(
            "SOCKS5 connect failed with reply code {}",
            head[1]
        )));
    }
    // drain the bound address trailing the reply
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize
        }
        other => return Err(proxy_err(format!("SOCKS5 reply with address type {other}"))),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound)?;
    Ok(())
}

/// SOCKS4a CONNECT: the 0.0.0.1 placeholder address defers hostname
/// resolution to the proxy.
fn socks4_connect(stream: &mut TcpStream, host: &str, port: u16) -> std::io::Result<()> {
    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    request.push(0x00); // empty user id
    request.extend_from_slice(host.as_bytes());
    request.push(0x00);
    stream.write_all(&request)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply)?;
    if reply[1] != 0x5A {
        return Err(proxy_err(format!(
            "SOCKS4 connect failed with reply code {:#04x}",
            reply[1]
        )));
    }
    Ok(())
}

/// HTTP CONNECT tunnel.
fn http_connect(stream: &mut TcpStream, host: &str, port: u16) -> std::io::Result<()> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes())?;

    let mut response = Vec::new();
    let mut byte = [0u8; 1];
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() > 8 * 1024 {
            return Err(proxy_err("HTTP proxy response headers too large".into()));
        }
        stream.read_exact(&mut byte)?;
        response.push(byte[0]);
    }
    let status_line = String::from_utf8_lossy(&response);
    let status_line = status_line.lines().next().unwrap_or("");
    if !status_line.contains(" 200") {
        return Err(proxy_err(format!(
            "HTTP proxy refused the tunnel: {status_line}"
        )));
    }
    Ok(())
}
