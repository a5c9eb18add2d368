pub mod types;


pub use types::Config;

use anyhow::Result;
use clap::Parser;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const XHEADER_PREFIX: &str = "x-crawlera-";

/// Command-line flags. Every flag is optional; set flags override both the
/// config file and the environment.
#[derive(Parser, Debug, Default)]
#[command(
    name = "headless-proxy",
    about = "Local proxy for Zyte Smart Proxy Manager to be used with headless browsers"
)]
pub struct Cli {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run in debug mode.
    #[arg(short, long)]
    pub debug: bool,

    /// IP to bind to. Default is 127.0.0.1.
    #[arg(short, long)]
    pub bind_ip: Option<IpAddr>,

    /// Port to bind to. Default is 3128.
    #[arg(short = 'p', long)]
    pub bind_port: Option<u16>,

    /// IP to bind the proxy API to. Default is the bind-ip value.
    #[arg(short = 'm', long)]
    pub proxy_api_ip: Option<IpAddr>,

    /// Port to bind the proxy API to. Default is 3129.
    #[arg(short = 'w', long)]
    pub proxy_api_port: Option<u16>,

    /// API key of the upstream proxy.
    #[arg(short, long)]
    pub api_key: Option<String>,

    /// Hostname of the upstream proxy.
    #[arg(short = 'u', long)]
    pub crawlera_host: Option<String>,

    /// Port of the upstream proxy.
    #[arg(short = 'o', long)]
    pub crawlera_port: Option<u16>,

    /// Do not verify TLS certificates presented to the executors.
    #[arg(short = 'v', long)]
    pub dont_verify_crawlera_cert: bool,

    /// Number of concurrent connections. 0 disables the limiter.
    #[arg(short = 'n', long)]
    pub concurrent_connections: Option<usize>,

    /// Disable automatic session management.
    #[arg(short = 't', long)]
    pub no_auto_sessions: bool,

    /// Ad-block rule list (URL or path). May be given multiple times.
    #[arg(short = 'k', long = "adblock-list")]
    pub adblock_lists: Vec<String>,

    /// Host/path regexp granted direct access. May be given multiple times.
    #[arg(long = "direct-access-hostpath-regexp")]
    pub direct_access_hostpath_regexps: Vec<String>,

    /// Exception to the direct-access regexps. May be given multiple times.
    #[arg(long = "direct-access-except-hostpath-regexp")]
    pub direct_access_except_hostpath_regexps: Vec<String>,

    /// Secondary proxy (host:port) for direct-access traffic.
    #[arg(long)]
    pub direct_access_proxy: Option<String>,

    /// Path to the TLS CA certificate used for interception.
    #[arg(short = 'l', long)]
    pub tls_ca_certificate: Option<PathBuf>,

    /// Path to the TLS private key used for interception.
    #[arg(short = 'r', long)]
    pub tls_private_key: Option<PathBuf>,

    /// Upstream control header, `key=value`. May be given multiple times.
    #[arg(short = 'x', long = "xheader", value_parser = parse_key_value)]
    pub xheaders: Vec<(String, String)>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

impl Config {
    /// Load configuration: file (if given), then environment variables, then
    /// CLI flags, each layer overriding the previous one.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match cli.config {
            Some(ref path) => Self::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env_overrides();
        config.apply_cli(cli);

        let xheaders = std::mem::take(&mut config.xheaders);
        for (k, v) in xheaders {
            config.set_xheader(&k, v);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("cannot parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_DEBUG") {
            self.debug = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_BINDIP") {
            if let Ok(ip) = v.parse() {
                self.bind_ip = ip;
            }
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_BINDPORT") {
            if let Ok(p) = v.parse() {
                self.bind_port = p;
            }
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_PROXYAPIIP") {
            if let Ok(ip) = v.parse() {
                self.proxy_api_ip = Some(ip);
            }
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_PROXYAPIPORT") {
            if let Ok(p) = v.parse() {
                self.proxy_api_port = p;
            }
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_APIKEY") {
            self.api_key = v;
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_CHOST") {
            self.crawlera_host = v;
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_CPORT") {
            if let Ok(p) = v.parse() {
                self.crawlera_port = p;
            }
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_DONTVERIFY") {
            self.dont_verify_crawlera_cert = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                self.concurrent_connections = n;
            }
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_NOAUTOSESSIONS") {
            self.no_auto_sessions = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_ADBLOCKLISTS") {
            self.adblock_lists = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_TLSCACERTPATH") {
            self.tls_ca_certificate = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("CRAWLERA_HEADLESS_TLSPRIVATEKEYPATH") {
            self.tls_private_key = Some(PathBuf::from(v));
        }
    }

    fn apply_cli(&mut self, cli: &Cli) {
        self.debug = self.debug || cli.debug;
        self.dont_verify_crawlera_cert =
            self.dont_verify_crawlera_cert || cli.dont_verify_crawlera_cert;
        self.no_auto_sessions = self.no_auto_sessions || cli.no_auto_sessions;

        if let Some(ip) = cli.bind_ip {
            self.bind_ip = ip;
        }
        if let Some(port) = cli.bind_port {
            self.bind_port = port;
        }
        if let Some(ip) = cli.proxy_api_ip {
            self.proxy_api_ip = Some(ip);
        }
        if let Some(port) = cli.proxy_api_port {
            self.proxy_api_port = port;
        }
        if let Some(ref key) = cli.api_key {
            self.api_key = key.clone();
        }
        if let Some(ref host) = cli.crawlera_host {
            self.crawlera_host = host.clone();
        }
        if let Some(port) = cli.crawlera_port {
            self.crawlera_port = port;
        }
        if let Some(n) = cli.concurrent_connections {
            self.concurrent_connections = n;
        }
        if !cli.adblock_lists.is_empty() {
            self.adblock_lists = cli.adblock_lists.clone();
        }
        if !cli.direct_access_hostpath_regexps.is_empty() {
            self.direct_access_hostpath_regexps = cli.direct_access_hostpath_regexps.clone();
        }
        if !cli.direct_access_except_hostpath_regexps.is_empty() {
            self.direct_access_except_hostpath_regexps =
                cli.direct_access_except_hostpath_regexps.clone();
        }
        if let Some(ref proxy) = cli.direct_access_proxy {
            self.direct_access_proxy = Some(proxy.clone());
        }
        if let Some(ref path) = cli.tls_ca_certificate {
            self.tls_ca_certificate = Some(path.clone());
        }
        if let Some(ref path) = cli.tls_private_key {
            self.tls_private_key = Some(path.clone());
        }
        for (k, v) in &cli.xheaders {
            self.set_xheader(k, v.clone());
        }
    }

    /// Store an upstream control header under its canonical name.
    ///
    /// The key is lowercased, an optional `x-crawlera-` prefix is stripped,
    /// and the remainder is re-prefixed and title-cased per dash segment:
    /// `"PROFILE"` and `"x-Crawlera-profile"` both canonicalize to
    /// `"X-Crawlera-Profile"`.
    pub fn set_xheader(&mut self, key: &str, value: String) {
        self.xheaders.insert(canonical_xheader_key(key), value);
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.is_empty() {
            anyhow::bail!("API key is not set");
        }
        for pattern in self
            .direct_access_hostpath_regexps
            .iter()
            .chain(&self.direct_access_except_hostpath_regexps)
        {
            regex::Regex::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid direct access regexp '{}': {}", pattern, e))?;
        }
        Ok(())
    }
}

/// Canonical form of an upstream control header key.
pub fn canonical_xheader_key(key: &str) -> String {
    let key = key.to_ascii_lowercase();
    let suffix = key.strip_prefix(XHEADER_PREFIX).unwrap_or(&key);

    let mut canonical = String::with_capacity(XHEADER_PREFIX.len() + suffix.len());
    canonical.push_str("X-Crawlera-");
    for (i, segment) in suffix.split('-').enumerate() {
        if i > 0 {
            canonical.push('-');
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            canonical.extend(first.to_uppercase());
            canonical.push_str(chars.as_str());
        }
    }
    canonical
}
