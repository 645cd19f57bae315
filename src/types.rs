//! Domain records shared across the node: search results and peers.

use anyhow::{anyhow, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// The 32-byte fingerprint identifying a search result.
pub type ResultHash = [u8; 32];

/// Default MIME type for results scraped from the web.
pub const DEFAULT_CONTENT_TYPE: &str = "text/html";

/// A single cached search result.
///
/// Results are content-addressed: the fingerprint is a Merkle-style
/// digest over the record's fields, so two results are equal iff their
/// hashes are equal. Results are never deleted; only their score moves.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(serialize_with = "serialize_hash")]
    pub hash: ResultHash,
    pub title: String,
    pub url: String,
    pub description: String,
    pub content_type: String,
    pub score: i64,
}

impl SearchResult {
    /// Build a new result with the default content type and score 0,
    /// computing its fingerprint.
    pub fn new(title: &str, url: &str, description: &str) -> Self {
        Self::with_content_type(title, url, description, DEFAULT_CONTENT_TYPE)
    }

    /// Build a new result with an explicit content type, computing its
    /// fingerprint.
    pub fn with_content_type(
        title: &str,
        url: &str,
        description: &str,
        content_type: &str,
    ) -> Self {
        let mut result = SearchResult {
            hash: [0u8; 32],
            title: title.to_string(),
            url: url.to_string(),
            description: description.to_string(),
            content_type: content_type.to_string(),
            score: 0,
        };
        result.hash = result.compute_hash();
        result
    }

    /// Reassemble a result from stored or received fields. The hash is
    /// taken as-is; callers that care must check [`is_consistent`].
    ///
    /// [`is_consistent`]: SearchResult::is_consistent
    pub fn from_parts(
        hash: ResultHash,
        title: String,
        url: String,
        description: String,
        content_type: String,
        score: i64,
    ) -> Self {
        SearchResult {
            hash,
            title,
            url,
            description,
            content_type,
            score,
        }
    }

    /// Merkle-style fingerprint: SHA-256 over the concatenated SHA-256
    /// digests of url, title, description, content_type, in that order.
    pub fn compute_hash(&self) -> ResultHash {
        let mut outer = Sha256::new();
        for field in [&self.url, &self.title, &self.description, &self.content_type] {
            outer.update(Sha256::digest(field.as_bytes()));
        }
        outer.finalize().into()
    }

    /// A result is consistent iff its stored hash matches the
    /// recomputed fingerprint. Inconsistent results are dropped at
    /// every sync boundary.
    pub fn is_consistent(&self) -> bool {
        self.hash == self.compute_hash()
    }
}

impl PartialEq for SearchResult {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for SearchResult {}

impl std::hash::Hash for SearchResult {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

fn serialize_hash<S: serde::Serializer>(hash: &ResultHash, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hash_to_hex(hash))
}

/// Lowercase hex rendering of a fingerprint, for logs and the UI.
pub fn hash_to_hex(hash: &ResultHash) -> String {
    let mut out = String::with_capacity(64);
    for b in hash {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Proxy used to reach a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    None,
    Socks4,
    Socks5,
    Http,
}

impl ProxyType {
    /// Integer code carried on the wire. Direct connections are -1, the
    /// proxied variants keep the classic SOCKS library constants.
    pub fn wire_code(self) -> i64 {
        match self {
            ProxyType::None => -1,
            ProxyType::Socks4 => 1,
            ProxyType::Socks5 => 2,
            ProxyType::Http => 3,
        }
    }

    pub fn from_wire_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(ProxyType::None),
            1 => Some(ProxyType::Socks4),
            2 => Some(ProxyType::Socks5),
            3 => Some(ProxyType::Http),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProxyType::None => "none",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks5 => "socks5",
            ProxyType::Http => "http",
        }
    }

    /// Parse the lowercase name used in configuration files and the
    /// peers table.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "none" | "" => Some(ProxyType::None),
            "socks4" => Some(ProxyType::Socks4),
            "socks5" => Some(ProxyType::Socks5),
            "http" => Some(ProxyType::Http),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProxyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A known peer, keyed by its address. Lower rank means preferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    /// URL-shaped address, "scheme://host:port".
    pub address: String,
    pub rank: i64,
    pub proxy_type: ProxyType,
    /// Proxy address, or empty when `proxy_type` is `None`.
    pub proxy_address: String,
}

impl PeerInfo {
    pub fn new(address: &str) -> Self {
        PeerInfo {
            address: address.to_string(),
            rank: 0,
            proxy_type: ProxyType::None,
            proxy_address: String::new(),
        }
    }

    pub fn with_proxy(address: &str, proxy_type: ProxyType, proxy_address: &str) -> Self {
        PeerInfo {
            address: address.to_string(),
            rank: 0,
            proxy_type,
            proxy_address: proxy_address.to_string(),
        }
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy_type != ProxyType::None
    }

    /// Host and port of the peer itself.
    pub fn host_port(&self) -> Result<(String, u16)> {
        parse_host_port(&self.address)
    }

    /// Host and port of the peer's proxy.
    pub fn proxy_host_port(&self) -> Result<(String, u16)> {
        parse_host_port(&self.proxy_address)
    }
}

/// Split a "scheme://host:port" (scheme optional) address into host and
/// port.
pub fn parse_host_port(address: &str) -> Result<(String, u16)> {
    let rest = match address.find("://") {
        Some(idx) => &address[idx + 3..],
        None => address,
    };
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Address '{}' has no port", address))?;
    if host.is_empty() {
        return Err(anyhow!("Address '{}' has no host", address));
    }
    let port: u16 = port
        .parse()
        .map_err(|e| anyhow!("Address '{}' has an invalid port: {}", address, e))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_known_value() {
        let result = SearchResult::new(
            "Title",
            "http://www.google.com/",
            "The world worst search engine",
        );

        let mut outer = Sha256::new();
        outer.update(Sha256::digest(b"http://www.google.com/"));
        outer.update(Sha256::digest(b"Title"));
        outer.update(Sha256::digest(b"The world worst search engine"));
        outer.update(Sha256::digest(b"text/html"));
        let expected: ResultHash = outer.finalize().into();

        assert_eq!(result.hash, expected);
        assert!(result.is_consistent());
    }

    #[test]
    fn test_tampered_result_is_inconsistent() {
        let mut result = SearchResult::new("a", "http://a/", "d");
        result.title = "b".to_string();
        assert!(!result.is_consistent());
    }

    #[test]
    fn test_equality_is_hash_equality() {
        let a = SearchResult::new("t", "http://x/", "d");
        let mut b = a.clone();
        b.score = 42;
        assert_eq!(a, b);
    }

    #[test]
    fn test_proxy_type_codes() {
        for pt in [
            ProxyType::None,
            ProxyType::Socks4,
            ProxyType::Socks5,
            ProxyType::Http,
        ] {
            assert_eq!(ProxyType::from_wire_code(pt.wire_code()), Some(pt));
            assert_eq!(ProxyType::parse(pt.as_str()), Some(pt));
        }
        assert_eq!(ProxyType::from_wire_code(7), None);
    }

    #[test]
    fn test_parse_host_port() {
        assert_eq!(
            parse_host_port("tcp://127.0.0.1:4222").unwrap(),
            ("127.0.0.1".to_string(), 4222)
        );
        assert_eq!(
            parse_host_port("example.org:80").unwrap(),
            ("example.org".to_string(), 80)
        );
        assert!(parse_host_port("tcp://nohost").is_err());
        assert!(parse_host_port("tcp://host:notaport").is_err());
    }
}
