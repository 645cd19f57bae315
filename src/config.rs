//! Node configuration.
//!
//! The configuration file is INI-shaped: a `[general]` section, a
//! `[node]` section, and one section per named search engine and per
//! named known peer (the names are listed in `general.engines` and
//! `general.peers`). Every `[general]` option can be overridden by the
//! upper-cased environment variable of the same name.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use config::{Config, File, FileFormat};
use tracing::Level;

use crate::types::{PeerInfo, ProxyType};

/// Descriptor of one HTML-scraping search engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub name: String,
    /// URL prefix the query string is appended to.
    pub search_query_url: String,
    /// CSS selector for the per-result containers.
    pub result_container_selector: String,
    /// CSS selector for the result link inside a container.
    pub result_url_selector: String,
    /// CSS selector for the result title inside a container.
    pub result_title_selector: String,
    pub user_agent: String,
}

/// Typed view of the configuration file.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub searches_database_path: String,
    pub peer_database_path: String,
    /// Where the web UI collaborator binds; the node itself only logs
    /// it.
    pub web_service_http_host: String,
    pub web_service_http_port: u16,
    pub peer_to_peer_port: u16,
    /// Seconds between outbound sync rounds.
    pub peer_sync_frequency: u64,
    /// At or below this many local hits the federator consults the
    /// engines.
    pub minimum_search_results_threshold: usize,
    /// How many of the best-ranked peers each sync round visits.
    pub max_sync_fanout: usize,
    pub node_discoverable: bool,
    /// This node's externally reachable identity, announced on
    /// handshakes.
    pub self_peer: PeerInfo,
    pub known_peers: Vec<PeerInfo>,
    pub search_engines: Vec<EngineConfig>,
    pub log_level: Level,
}

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0";

/// The `[general]` options that honor environment overrides.
const GENERAL_KEYS: &[&str] = &[
    "searches_database_path",
    "peer_database_path",
    "web_service_http_host",
    "web_service_http_port",
    "peer_sync_frequency",
    "minimum_search_results_threshold",
    "max_sync_fanout",
    "log_level",
    "engines",
    "peers",
];

impl NodeConfig {
    /// Read and parse the configuration file, applying environment
    /// overrides on top of the `[general]` section.
    pub fn load(path: &str) -> Result<NodeConfig> {
        let settings = Config::builder()
            .add_source(File::new(path, FileFormat::Ini))
            .build()
            .map_err(|e| anyhow!("Failed to read config file '{}': {}", path, e))?;

        let mut sections: HashMap<String, HashMap<String, String>> = settings
            .try_deserialize()
            .map_err(|e| anyhow!("Malformed config file '{}': {}", path, e))?;

        if let Some(general) = sections.get_mut("general") {
            apply_env_overrides(general);
        }
        Self::from_sections(sections)
    }

    /// Build the typed configuration from already-parsed sections.
    pub fn from_sections(
        mut sections: HashMap<String, HashMap<String, String>>,
    ) -> Result<NodeConfig> {
        let general = sections
            .remove("general")
            .ok_or_else(|| anyhow!("Missing [general] section"))?;
        let node = sections
            .remove("node")
            .ok_or_else(|| anyhow!("Missing [node] section"))?;

        let searches_database_path = required(&general, "general", "searches_database_path")?;
        let peer_database_path = required(&general, "general", "peer_database_path")?;
        let web_service_http_host = general
            .get("web_service_http_host")
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let web_service_http_port = parsed_or(&general, "web_service_http_port", 8080u16)?;
        let peer_sync_frequency = parsed_or(&general, "peer_sync_frequency", 60u64)?;
        let minimum_search_results_threshold =
            parsed_or(&general, "minimum_search_results_threshold", 10usize)?;
        let max_sync_fanout = parsed_or(&general, "max_sync_fanout", 7usize)?;
        let log_level = parse_log_level(general.get("log_level").map(String::as_str))?;

        let peer_to_peer_port: u16 = required(&node, "node", "peer_to_peer_port")?
            .parse()
            .map_err(|e| anyhow!("Invalid node.peer_to_peer_port: {}", e))?;
        let node_discoverable = match node.get("discoverable").or_else(|| node.get("node_discoverable")) {
            Some(value) => parse_bool(value)
                .ok_or_else(|| anyhow!("Invalid node.discoverable value '{}'", value))?,
            None => false,
        };
        let self_address = node
            .get("node_address")
            .cloned()
            .unwrap_or_else(|| format!("tcp://127.0.0.1:{peer_to_peer_port}"));
        let self_proxy_type = parse_proxy_type(node.get("proxy_type"))?;
        let self_peer = PeerInfo::with_proxy(
            &self_address,
            self_proxy_type,
            node.get("proxy_address").map(String::as_str).unwrap_or(""),
        );

        let search_engines = named_sections(&general, "engines", &sections)?
            .into_iter()
            .map(|(name, section)| engine_from_section(&name, &section))
            .collect::<Result<Vec<_>>>()?;
        let known_peers = named_sections(&general, "peers", &sections)?
            .into_iter()
            .map(|(name, section)| peer_from_section(&name, &section))
            .collect::<Result<Vec<_>>>()?;

        Ok(NodeConfig {
            searches_database_path,
            peer_database_path,
            web_service_http_host,
            web_service_http_port,
            peer_to_peer_port,
            peer_sync_frequency,
            minimum_search_results_threshold,
            max_sync_fanout,
            node_discoverable,
            self_peer,
            known_peers,
            search_engines,
            log_level,
        })
    }
}

/// Layer environment variables over the `[general]` options: every
/// recognized key can be overridden by its upper-cased name.
pub fn apply_env_overrides(general: &mut HashMap<String, String>) {
    for key in GENERAL_KEYS {
        if let Ok(value) = std::env::var(key.to_ascii_uppercase()) {
            general.insert(key.to_string(), value);
        }
    }
}

fn required(section: &HashMap<String, String>, section_name: &str, key: &str) -> Result<String> {
    section
        .get(key)
        .cloned()
        .ok_or_else(|| anyhow!("Missing required option {}.{}", section_name, key))
}

fn parsed_or<T>(section: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match section.get(key) {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow!("Invalid general.{} value '{}': {}", key, value, e)),
        None => Ok(default),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn parse_log_level(value: Option<&str>) -> Result<Level> {
    match value.map(str::to_lowercase).as_deref() {
        None | Some("info") => Ok(Level::INFO),
        Some("debug") => Ok(Level::DEBUG),
        Some("trace") => Ok(Level::TRACE),
        Some("warning") | Some("warn") => Ok(Level::WARN),
        Some("error") => Ok(Level::ERROR),
        Some(other) => Err(anyhow!("Unknown log_level '{}'", other)),
    }
}

fn parse_proxy_type(value: Option<&String>) -> Result<ProxyType> {
    match value {
        None => Ok(ProxyType::None),
        Some(name) => {
            ProxyType::parse(name).ok_or_else(|| anyhow!("Unknown proxy_type '{}'", name))
        }
    }
}

/// Resolve a comma-separated list option (`engines` or `peers`) into
/// the named sections.
fn named_sections(
    general: &HashMap<String, String>,
    list_key: &str,
    sections: &HashMap<String, HashMap<String, String>>,
) -> Result<Vec<(String, HashMap<String, String>)>> {
    let Some(list) = general.get(list_key) else {
        return Ok(Vec::new());
    };

    let mut resolved = Vec::new();
    for name in list.split(',') {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let section = sections
            .get(name)
            .or_else(|| sections.get(&name.to_lowercase()))
            .ok_or_else(|| anyhow!("Missing section [{}] named in general.{}", name, list_key))?;
        resolved.push((name.to_string(), section.clone()));
    }
    Ok(resolved)
}

fn engine_from_section(name: &str, section: &HashMap<String, String>) -> Result<EngineConfig> {
    Ok(EngineConfig {
        name: section
            .get("name")
            .cloned()
            .unwrap_or_else(|| name.to_string()),
        search_query_url: required(section, name, "search_query_url")?,
        result_container_selector: required(section, name, "result_container_selector")?,
        result_url_selector: required(section, name, "result_url_selector")?,
        result_title_selector: required(section, name, "result_title_selector")?,
        user_agent: section
            .get("user_agent")
            .cloned()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
    })
}

fn peer_from_section(name: &str, section: &HashMap<String, String>) -> Result<PeerInfo> {
    let address = required(section, name, "address")?;
    let proxy_type = parse_proxy_type(section.get("proxy_type"))?;
    let proxy_address = section.get("proxy_address").cloned().unwrap_or_default();
    if proxy_type != ProxyType::None && proxy_address.is_empty() {
        return Err(anyhow!(
            "Peer [{}] has proxy_type '{}' but no proxy_address",
            name,
            proxy_type
        ));
    }
    Ok(PeerInfo::with_proxy(&address, proxy_type, &proxy_address))
}
