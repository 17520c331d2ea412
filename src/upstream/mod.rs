//! Upstream DNS servers and the per-protocol exchange clients.
//!
//! An upstream is addressed by a URL-style spec (`udp://1.1.1.1`,
//! `tls://dns.example`, `https://dns.example/dns-query`, `quic://…`,
//! `sdns://…`) optionally restricted to domains with the
//! `[/a.com/b.com/]spec` prefix handled by the registry.

pub mod dnscrypt;
pub mod exchange;
pub mod https;
pub mod quic;
pub mod registry;
pub mod tls;
pub mod udp;

pub use exchange::{ExchangeMode, Exchanges, RttStats};
pub use registry::Registry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use url::Url;

use crate::bootstrap::Bootstrap;
use crate::error::{ConfigError, ExchangeError};

/// Default upstream port per scheme.
const PORT_PLAIN: u16 = 53;
const PORT_TLS: u16 = 853;
const PORT_HTTPS: u16 = 443;
const PORT_QUIC: u16 = 853;

/// A single upstream server capable of answering DNS queries.
#[async_trait]
pub trait Exchanger: Send + Sync {
    /// Send `req` and wait for the response.
    async fn exchange(&self, req: &Message) -> Result<Message, ExchangeError>;

    /// The canonical address string, e.g. `tls://dns.example.com:853`.
    fn address(&self) -> &str;
}

/// Shared reference to a built upstream.
pub type UpstreamRef = Arc<dyn Exchanger>;

/// Options applied to every upstream built from configuration.
#[derive(Clone)]
pub struct UpstreamOptions {
    pub timeout: Duration,
    pub bootstrap: Arc<Bootstrap>,
    /// Accept any TLS certificate. Test setups only.
    pub insecure_skip_verify: bool,
    /// Prefer HTTP/3 for DoH upstreams.
    pub http3: bool,
}

impl UpstreamOptions {
    pub fn new(bootstrap: Arc<Bootstrap>) -> Self {
        Self {
            timeout: Duration::from_secs(10),
            bootstrap,
            insecure_skip_verify: false,
            http3: false,
        }
    }
}

/// A parsed upstream address before the client is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddr {
    Udp { host: String, port: u16 },
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16 },
    Https { url: String },
    Quic { host: String, port: u16 },
    DnsCrypt { stamp: crate::dnscrypt::DnsCryptStamp },
}

impl UpstreamAddr {
    /// Parse a bare spec (no domain prefix). A spec without a scheme is
    /// plain UDP.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUpstream {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        if spec.starts_with("sdns://") {
            let stamp = crate::dnscrypt::DnsCryptStamp::parse(spec)
                .map_err(|e| invalid(&e.to_string()))?;
            return Ok(Self::DnsCrypt { stamp });
        }

        let with_scheme = if spec.contains("://") {
            spec.to_string()
        } else {
            format!("udp://{spec}")
        };
        let url = Url::parse(&with_scheme).map_err(|e| invalid(&e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host"))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();

        match url.scheme() {
            "udp" => Ok(Self::Udp {
                host,
                port: url.port().unwrap_or(PORT_PLAIN),
            }),
            "tcp" => Ok(Self::Tcp {
                host,
                port: url.port().unwrap_or(PORT_PLAIN),
            }),
            "tls" => Ok(Self::Tls {
                host,
                port: url.port().unwrap_or(PORT_TLS),
            }),
            "https" => {
                let mut url = url;
                if url.path() == "/" || url.path().is_empty() {
                    url.set_path("/dns-query");
                }
                Ok(Self::Https {
                    url: url.to_string(),
                })
            }
            "quic" => Ok(Self::Quic {
                host,
                port: url.port().unwrap_or(PORT_QUIC),
            }),
            other => Err(invalid(&format!("unsupported scheme {other:?}"))),
        }
    }

    /// Build the protocol client for this address.
    pub fn build(self, opts: &UpstreamOptions) -> UpstreamRef {
        match self {
            Self::Udp { host, port } => Arc::new(udp::UdpUpstream::new(host, port, opts)),
            Self::Tcp { host, port } => Arc::new(udp::TcpUpstream::new(host, port, opts)),
            Self::Tls { host, port } => Arc::new(tls::DotUpstream::new(host, port, opts)),
            Self::Https { url } => Arc::new(https::DohUpstream::new(url, opts)),
            Self::Quic { host, port } => Arc::new(quic::DoqUpstream::new(host, port, opts)),
            Self::DnsCrypt { stamp } => Arc::new(dnscrypt::DnsCryptUpstream::new(stamp, opts)),
        }
    }
}

/// One line of upstream configuration: the address plus the domains it is
/// reserved for. `domains` empty means a default upstream; the literal
/// root entry (from `[//]addr`) pins the upstream to the default set
/// only. `addr` of `None` (spelled `#`) reserves the domains without any
/// upstream, sending them back to the default set even when a shorter
/// suffix is reserved elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamSpec {
    pub addr: Option<UpstreamAddr>,
    pub domains: Vec<String>,
}

impl UpstreamSpec {
    /// Parse a spec line of the form `addr`, `[/d1/d2/]addr`,
    /// `[/d1/]#`, or `[//]addr`.
    pub fn parse(line: &str) -> Result<Self, ConfigError> {
        let line = line.trim();
        let invalid = |reason: &str| ConfigError::InvalidUpstream {
            spec: line.to_string(),
            reason: reason.to_string(),
        };

        if !line.starts_with('[') {
            return Ok(Self {
                addr: Some(UpstreamAddr::parse(line)?),
                domains: Vec::new(),
            });
        }

        let end = line.find(']').ok_or_else(|| invalid("unterminated domain list"))?;
        let domains_part = &line[1..end];
        let addr_part = &line[end + 1..];
        if !domains_part.starts_with('/') {
            return Err(invalid("domain list must start with '/'"));
        }

        let mut domains: Vec<String> = domains_part
            .split('/')
            .filter(|d| !d.is_empty())
            .map(|d| d.trim_end_matches('.').to_lowercase())
            .collect();
        if domains.is_empty() {
            // `[//]addr`: reserved for the root, i.e. default-only.
            domains.push(String::new());
        }

        let addr = if addr_part == "#" {
            if domains == [String::new()] {
                return Err(invalid("'#' requires at least one domain"));
            }
            None
        } else {
            Some(UpstreamAddr::parse(addr_part)?)
        };

        Ok(Self { addr, domains })
    }

    /// Parse the lines of an upstream file: `#` and `!` start comments.
    pub fn parse_lines<'a, I>(lines: I) -> Result<Vec<Self>, ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut specs = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            specs.push(Self::parse(line)?);
        }
        Ok(specs)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_plain_addresses_as_udp() {
        let spec = UpstreamSpec::parse("1.1.1.1").unwrap();
        assert_eq!(
            spec.addr,
            Some(UpstreamAddr::Udp {
                host: "1.1.1.1".into(),
                port: 53
            })
        );
        assert!(spec.domains.is_empty());

        let spec = UpstreamSpec::parse("8.8.8.8:5353").unwrap();
        assert_eq!(
            spec.addr,
            Some(UpstreamAddr::Udp {
                host: "8.8.8.8".into(),
                port: 5353
            })
        );
    }

    #[test]
    fn should_parse_scheme_defaults() {
        assert_eq!(
            UpstreamAddr::parse("tls://dns.example.com").unwrap(),
            UpstreamAddr::Tls {
                host: "dns.example.com".into(),
                port: 853
            }
        );
        assert_eq!(
            UpstreamAddr::parse("tcp://9.9.9.9").unwrap(),
            UpstreamAddr::Tcp {
                host: "9.9.9.9".into(),
                port: 53
            }
        );
        assert_eq!(
            UpstreamAddr::parse("quic://dns.example.com:784").unwrap(),
            UpstreamAddr::Quic {
                host: "dns.example.com".into(),
                port: 784
            }
        );
    }

    #[test]
    fn should_default_doh_path_and_port() {
        match UpstreamAddr::parse("https://dns.example.com").unwrap() {
            UpstreamAddr::Https { url } => {
                assert_eq!(url, "https://dns.example.com/dns-query")
            }
            other => panic!("expected https, got {other:?}"),
        }
        match UpstreamAddr::parse("https://dns.example.com/custom").unwrap() {
            UpstreamAddr::Https { url } => assert!(url.ends_with("/custom")),
            other => panic!("expected https, got {other:?}"),
        }
    }

    #[test]
    fn should_parse_ipv6_hosts() {
        assert_eq!(
            UpstreamAddr::parse("udp://[2001:db8::1]:53").unwrap(),
            UpstreamAddr::Udp {
                host: "2001:db8::1".into(),
                port: 53
            }
        );
    }

    #[test]
    fn should_parse_domain_reserved_specs() {
        let spec = UpstreamSpec::parse("[/corp.example/internal.example/]tls://10.0.0.1").unwrap();
        assert_eq!(spec.domains, vec!["corp.example", "internal.example"]);
        assert_eq!(
            spec.addr,
            Some(UpstreamAddr::Tls {
                host: "10.0.0.1".into(),
                port: 853
            })
        );
    }

    #[test]
    fn should_parse_default_only_marker() {
        let spec = UpstreamSpec::parse("[//]1.1.1.1").unwrap();
        assert_eq!(spec.domains, vec![String::new()]);
    }

    #[test]
    fn should_reject_bad_specs() {
        assert!(UpstreamSpec::parse("ftp://example.com").is_err());
        assert!(UpstreamSpec::parse("[/unterminated").is_err());
        assert!(UpstreamSpec::parse("https://").is_err());
    }

    #[test]
    fn should_parse_upstream_files_with_comments() {
        let specs = UpstreamSpec::parse_lines(
            [
                "# default resolvers",
                "1.1.1.1",
                "! reserved",
                "[/corp.example/]10.0.0.1",
                "",
            ],
        )
        .unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].domains, vec!["corp.example"]);
    }
}
