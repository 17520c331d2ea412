//! Configuration loading and validation.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::upstream::ExchangeMode;

/// Main configuration for the relaybox DNS proxy.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub listen: ListenConfig,

    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub cache: CacheSettings,

    #[serde(default)]
    pub ratelimit: RatelimitConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub dns64: Dns64Config,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub dnscrypt: Option<DnsCryptConfig>,

    #[serde(default)]
    pub edns: EdnsConfig,

    /// Refuse qtype ANY with NOTIMPLEMENTED.
    #[serde(default)]
    pub refuse_any: bool,

    /// Answer AAAA queries with an empty NOERROR instead of resolving.
    #[serde(default)]
    pub ipv6_disabled: bool,

    /// Upper bound on concurrently handled queries; 0 means unbounded.
    #[serde(default)]
    pub max_active_queries: usize,

    /// Forward PTR/SOA/NS queries for private space to the private
    /// upstream set.
    #[serde(default = "default_true")]
    pub use_private_rdns: bool,

    /// Subnets considered private in addition to the locally-served
    /// defaults.
    #[serde(default)]
    pub private_subnets: Vec<String>,

    /// Answers containing any of these addresses are rewritten to
    /// NXDOMAIN.
    #[serde(default)]
    pub bogus_nxdomain: Vec<String>,
}

/// Listener addresses per transport.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    #[serde(default)]
    pub udp: Vec<SocketAddr>,
    #[serde(default)]
    pub tcp: Vec<SocketAddr>,
    #[serde(default)]
    pub tls: Vec<SocketAddr>,
    #[serde(default)]
    pub https: Vec<SocketAddr>,
    #[serde(default)]
    pub quic: Vec<SocketAddr>,
    #[serde(default)]
    pub dnscrypt_udp: Vec<SocketAddr>,
    #[serde(default)]
    pub dnscrypt_tcp: Vec<SocketAddr>,
}

impl ListenConfig {
    pub fn is_empty(&self) -> bool {
        self.udp.is_empty()
            && self.tcp.is_empty()
            && self.tls.is_empty()
            && self.https.is_empty()
            && self.quic.is_empty()
            && self.dnscrypt_udp.is_empty()
            && self.dnscrypt_tcp.is_empty()
    }
}

/// Upstream servers and exchange behavior.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Upstream spec lines (`1.1.1.1`, `[/corp/]tls://10.0.0.1`, ...).
    #[serde(default)]
    pub servers: Vec<String>,

    /// Files with one spec line each; `#` and `!` start comments.
    #[serde(default)]
    pub server_files: Vec<PathBuf>,

    /// Consulted when the main servers fail with a retryable error.
    #[serde(default)]
    pub fallbacks: Vec<String>,

    /// Servers for private reverse-DNS resolution.
    #[serde(default)]
    pub private: Vec<String>,

    /// Plain resolvers (ip:port) used to resolve upstream hostnames.
    #[serde(default)]
    pub bootstrap: Vec<SocketAddr>,

    #[serde(default)]
    pub mode: ExchangeMode,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_ping_timeout_ms")]
    pub fastest_ping_timeout_ms: u64,

    /// Accept any upstream TLS certificate. Test setups only.
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Prefer HTTP/3 for DoH upstreams.
    #[serde(default)]
    pub http3: bool,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn fastest_ping_timeout(&self) -> Duration {
        Duration::from_millis(self.fastest_ping_timeout_ms)
    }
}

/// Cache behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Budget in serialized-message bytes.
    #[serde(default = "default_cache_size")]
    pub size_bytes: u64,

    #[serde(default)]
    pub min_ttl: u32,

    /// 0 means unbounded.
    #[serde(default)]
    pub max_ttl: u32,

    /// Serve expired entries while refreshing them in the background.
    #[serde(default)]
    pub optimistic: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            size_bytes: default_cache_size(),
            min_ttl: 0,
            max_ttl: 0,
            optimistic: false,
        }
    }
}

/// UDP ingress rate limiting.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RatelimitConfig {
    /// Sustained queries per second per subnet; 0 disables.
    #[serde(default)]
    pub qps: u32,

    #[serde(default = "default_v4_prefix")]
    pub v4_prefix: u8,

    #[serde(default = "default_v6_prefix")]
    pub v6_prefix: u8,

    /// Exact addresses exempt from limiting.
    #[serde(default)]
    pub whitelist: Vec<IpAddr>,
}

impl Default for RatelimitConfig {
    fn default() -> Self {
        Self {
            qps: 0,
            v4_prefix: default_v4_prefix(),
            v6_prefix: default_v6_prefix(),
            whitelist: Vec::new(),
        }
    }
}

/// Domain filter sources.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    /// Domain-list files of blocked names.
    #[serde(default)]
    pub blocklist_files: Vec<PathBuf>,

    /// Domains that must never be blocked.
    #[serde(default)]
    pub exclusion_files: Vec<PathBuf>,

    /// Domains whose answers are never cached.
    #[serde(default)]
    pub cache_exclusion_files: Vec<PathBuf>,
}

/// DNS64 synthesis.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dns64Config {
    #[serde(default)]
    pub enabled: bool,

    /// NAT64 prefixes; every entry must be an IPv6 /96.
    #[serde(default = "default_dns64_prefixes")]
    pub prefixes: Vec<String>,
}

impl Default for Dns64Config {
    fn default() -> Self {
        Self {
            enabled: false,
            prefixes: default_dns64_prefixes(),
        }
    }
}

/// TLS material for the DoT/DoH/DoQ listeners.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// DNSCrypt server identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DnsCryptConfig {
    /// e.g. `2.dnscrypt-cert.example.com`.
    pub provider_name: String,

    /// 32-byte hex X25519 resolver secret key.
    pub secret_key_file: PathBuf,

    /// 32-byte hex ed25519 seed used to sign certificates.
    pub signing_key_file: PathBuf,
}

/// EDNS Client Subnet behavior.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EdnsConfig {
    /// Attach ECS to outgoing queries.
    #[serde(default)]
    pub enabled: bool,

    /// Overrides the client address ECS is derived from.
    #[serde(default)]
    pub client_ip: Option<IpAddr>,
}

const fn default_true() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_ping_timeout_ms() -> u64 {
    1_000
}

const fn default_cache_size() -> u64 {
    64 * 1024
}

const fn default_v4_prefix() -> u8 {
    24
}

const fn default_v6_prefix() -> u8 {
    56
}

fn default_dns64_prefixes() -> Vec<String> {
    vec![crate::dns::dns64::WELL_KNOWN_PREFIX.to_string()]
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(ConfigError::Validation(msg).into());

        if self.listen.is_empty() {
            return fail("no listen addresses configured".into());
        }
        if self.upstream.servers.is_empty() && self.upstream.server_files.is_empty() {
            return fail("no upstream servers configured".into());
        }
        if self.upstream.timeout_secs == 0 {
            return fail("upstream.timeout_secs must be > 0".into());
        }

        let needs_tls = !self.listen.tls.is_empty()
            || !self.listen.https.is_empty()
            || !self.listen.quic.is_empty();
        if needs_tls && self.tls.is_none() {
            return fail("tls/https/quic listeners require the [tls] section".into());
        }

        let needs_dnscrypt =
            !self.listen.dnscrypt_udp.is_empty() || !self.listen.dnscrypt_tcp.is_empty();
        if needs_dnscrypt && self.dnscrypt.is_none() {
            return fail("dnscrypt listeners require the [dnscrypt] section".into());
        }

        if self.cache.max_ttl > 0 && self.cache.min_ttl > self.cache.max_ttl {
            return fail("cache.min_ttl must not exceed cache.max_ttl".into());
        }
        if self.ratelimit.v4_prefix > 32 {
            return fail("ratelimit.v4_prefix must be <= 32".into());
        }
        if self.ratelimit.v6_prefix > 128 {
            return fail("ratelimit.v6_prefix must be <= 128".into());
        }

        for prefix in &self.private_subnets {
            if crate::netutil::Prefix::parse(prefix).is_none() {
                return fail(format!("invalid private subnet {prefix:?}"));
            }
        }
        for addr in &self.bogus_nxdomain {
            if crate::netutil::Prefix::parse(addr).is_none() {
                return fail(format!("invalid bogus-nxdomain entry {addr:?}"));
            }
        }
        if self.dns64.enabled {
            for prefix in &self.dns64.prefixes {
                match crate::netutil::Prefix::parse(prefix) {
                    Some(p) if p.len() == 96 && !p.addr().is_ipv4() => {}
                    _ => return fail(format!("dns64 prefix {prefix:?} is not an IPv6 /96")),
                }
            }
        }

        Ok(())
    }
}
