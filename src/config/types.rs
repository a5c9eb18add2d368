use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level proxy configuration.
///
/// Loaded from a TOML file, then overridden by `CRAWLERA_HEADLESS_*`
/// environment variables, then by CLI flags (highest precedence).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Verbose logging.
    pub debug: bool,

    pub bind_ip: IpAddr,
    pub bind_port: u16,

    /// Bind address of the proxy API (stats) endpoint. Inherits `bind_ip`
    /// when unset.
    pub proxy_api_ip: Option<IpAddr>,
    pub proxy_api_port: u16,

    /// Upstream credential. Required — startup fails when empty.
    pub api_key: String,

    pub crawlera_host: String,
    pub crawlera_port: u16,

    /// Skip TLS verification on connections the executors make.
    pub dont_verify_crawlera_cert: bool,

    /// Maximum concurrent in-flight requests. 0 disables the rate limiter.
    pub concurrent_connections: usize,

    /// Disable the session management layer entirely.
    pub no_auto_sessions: bool,

    /// Ad-block rule sources: URLs or filesystem paths. Empty disables the
    /// ad-block layer.
    pub adblock_lists: Vec<String>,

    /// Regexps matched against `host + '/' + path`; matching requests bypass
    /// the upstream.
    pub direct_access_hostpath_regexps: Vec<String>,
    /// Exceptions to the rules above — a matching request always goes
    /// upstream.
    pub direct_access_except_hostpath_regexps: Vec<String>,
    /// Optional secondary proxy (`host:port`) for direct-access traffic.
    pub direct_access_proxy: Option<String>,

    /// Root CA material for TLS interception. Built-in defaults are used
    /// when unset.
    pub tls_ca_certificate: Option<PathBuf>,
    pub tls_private_key: Option<PathBuf>,

    /// Upstream control headers. Keys are canonicalized into the
    /// `X-Crawlera-*` namespace after load.
    pub xheaders: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bind_port: 3128,
            proxy_api_ip: None,
            proxy_api_port: 3129,
            api_key: String::new(),
            crawlera_host: "proxy.zyte.com".to_string(),
            crawlera_port: 8011,
            dont_verify_crawlera_cert: false,
            concurrent_connections: 0,
            no_auto_sessions: false,
            adblock_lists: Vec::new(),
            direct_access_hostpath_regexps: Vec::new(),
            direct_access_except_hostpath_regexps: Vec::new(),
            direct_access_proxy: None,
            tls_ca_certificate: None,
            tls_private_key: None,
            xheaders: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn bind(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.bind_port)
    }

    pub fn api_bind(&self) -> SocketAddr {
        SocketAddr::new(self.proxy_api_ip.unwrap_or(self.bind_ip), self.proxy_api_port)
    }

    /// `host:port` of the upstream proxy.
    pub fn crawlera_addr(&self) -> String {
        format!("{}:{}", self.crawlera_host, self.crawlera_port)
    }
}
