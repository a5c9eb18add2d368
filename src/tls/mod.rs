use anyhow::{Context, Result};
use dashmap::DashMap;
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;

// Development CA pair baked into the binary, used when no CA material is
// configured. Clients must install the certificate to trust intercepted
// connections.
const DEFAULT_CA_CERT: &str = include_str!("default_ca/cert.pem");
const DEFAULT_CA_KEY: &str = include_str!("default_ca/key.pem");

/// Signs per-host leaf certificates with the configured root CA so that
/// CONNECT tunnels can be terminated locally.
///
/// Minted server configs are cached per host; the cache lives for the
/// process lifetime.
pub struct MitmAuthority {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_der: CertificateDer<'static>,
    configs: DashMap<String, Arc<ServerConfig>>,
}

impl MitmAuthority {
    /// Load CA material from the configured paths, falling back to the
    /// built-in pair.
    pub fn load(config: &Config) -> Result<Self> {
        let cert_pem = match config.tls_ca_certificate {
            Some(ref path) => std::fs::read_to_string(path)
                .with_context(|| format!("cannot read TLS CA certificate {}", path.display()))?,
            None => DEFAULT_CA_CERT.to_string(),
        };
        let key_pem = match config.tls_private_key {
            Some(ref path) => std::fs::read_to_string(path)
                .with_context(|| format!("cannot read TLS private key {}", path.display()))?,
            None => DEFAULT_CA_KEY.to_string(),
        };

        debug!(
            ca_cert = %hex::encode(Sha1::digest(cert_pem.trim().as_bytes())),
            private_key = %hex::encode(Sha1::digest(key_pem.trim().as_bytes())),
            "TLS checksums"
        );

        Self::from_pem(cert_pem.trim(), key_pem.trim())
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let ca_key = KeyPair::from_pem(key_pem).context("cannot parse TLS private key")?;
        // Re-sign the CA parameters with its own key: the resulting
        // certificate carries the same subject and public key, so leaves
        // chain correctly to the externally installed original.
        let ca_params = CertificateParams::from_ca_cert_pem(cert_pem)
            .context("cannot parse TLS CA certificate")?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .context("cannot rebuild TLS CA certificate")?;
        let ca_der = ca_cert.der().clone();

        Ok(Self {
            ca_cert,
            ca_key,
            ca_der,
            configs: DashMap::new(),
        })
    }

    /// A rustls server config presenting a leaf certificate for `host`.
    pub fn server_config(&self, host: &str) -> Result<Arc<ServerConfig>> {
        if let Some(config) = self.configs.get(host) {
            return Ok(config.clone());
        }

        let config = Arc::new(self.mint(host)?);
        self.configs.insert(host.to_string(), config.clone());
        Ok(config)
    }

    fn mint(&self, host: &str) -> Result<ServerConfig> {
        let key = KeyPair::generate().context("cannot generate leaf key")?;

        let mut params = CertificateParams::new(vec![host.to_string()])
            .with_context(|| format!("invalid certificate host {}", host))?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let leaf = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .with_context(|| format!("cannot sign leaf certificate for {}", host))?;

        let chain = vec![leaf.der().clone(), self.ca_der.clone()];
        let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der()));

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .context("cannot build TLS server config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}
