//! Proxy assembly: configuration to running listeners.
//!
//! `Proxy::new` wires the engine together (filters, registries, cache,
//! rate limiter); `start` binds one accept loop per configured transport
//! and `shutdown` closes them with a bounded grace period.

pub mod buffer;
pub mod dnscrypt;
pub mod https;
pub mod quic;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::Bootstrap;
use crate::cache::{CacheConfig, ResponseCache, SingleFlight};
use crate::config::Config;
use crate::dns::Dns64;
use crate::error::{ConfigError, Error, ListenError, Result};
use crate::fastip::FastestAddr;
use crate::filter::{blocklist, DomainMatcher, Filters};
use crate::netutil::{Prefix, PrefixSet};
use crate::ratelimit::RateLimiter;
use crate::recursion::RecursionDetector;
use crate::resolver::{Proto, Resolver, ResolverOptions};
use crate::stats::Stats;
use crate::upstream::{Registry, UpstreamOptions, UpstreamSpec};

/// How long in-flight queries get after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The assembled proxy.
pub struct Proxy {
    config: Config,
    resolver: Arc<Resolver>,
    dnscrypt_server: Option<Arc<dnscrypt::DnsCryptServer>>,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    started: Mutex<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: Mutex<HashMap<&'static str, Vec<SocketAddr>>>,
}

impl Proxy {
    /// Build the engine from a validated configuration. No sockets are
    /// opened here.
    pub async fn new(config: Config) -> Result<Self> {
        let stats = Arc::new(Stats::new());

        let bootstrap = Arc::new(Bootstrap::new(
            config.upstream.bootstrap.clone(),
            config.upstream.timeout(),
        ));
        let mut upstream_opts = UpstreamOptions::new(bootstrap);
        upstream_opts.timeout = config.upstream.timeout();
        upstream_opts.insecure_skip_verify = config.upstream.insecure_skip_verify;
        upstream_opts.http3 = config.upstream.http3;

        let mut specs = parse_spec_lines(&config.upstream.servers)?;
        for path in &config.upstream.server_files {
            let content = tokio::fs::read_to_string(path).await.map_err(|e| {
                Error::Config(ConfigError::Validation(format!(
                    "reading upstream file {}: {e}",
                    path.display()
                )))
            })?;
            specs.extend(UpstreamSpec::parse_lines(content.lines())?);
        }
        let registry = Registry::from_specs(&specs, &upstream_opts)?;

        let fallbacks = build_optional_registry(&config.upstream.fallbacks, &upstream_opts)?;
        let private_registry = build_optional_registry(&config.upstream.private, &upstream_opts)?;

        let filters = Arc::new(Filters::new());
        load_filters(&filters, &config, &stats).await;

        let cache = config.cache.enabled.then(|| {
            ResponseCache::new(CacheConfig {
                size_bytes: config.cache.size_bytes,
                min_ttl: config.cache.min_ttl,
                max_ttl: config.cache.max_ttl,
                optimistic: config.cache.optimistic,
            })
        });

        let dns64 = if config.dns64.enabled {
            let prefixes = config
                .dns64
                .prefixes
                .iter()
                .filter_map(|p| Prefix::parse(p))
                .collect();
            Some(Dns64::new(prefixes).map_err(|e| Error::Config(ConfigError::Validation(e)))?)
        } else {
            None
        };

        let ratelimiter = (config.ratelimit.qps > 0).then(|| {
            RateLimiter::new(
                config.ratelimit.qps,
                config.ratelimit.v4_prefix,
                config.ratelimit.v6_prefix,
                config.ratelimit.whitelist.clone(),
            )
        });

        let resolver = Arc::new_cyclic(|weak| Resolver {
            weak_self: weak.clone(),
            registry,
            private_registry,
            fallbacks,
            exchanges: crate::upstream::Exchanges::new(),
            fastest: FastestAddr::new(config.upstream.fastest_ping_timeout()),
            cache,
            flights: SingleFlight::new(),
            filters,
            dns64,
            bogus_nxdomain: parse_prefixes(&config.bogus_nxdomain),
            private_subnets: parse_prefixes(&config.private_subnets),
            recursion: RecursionDetector::new(),
            ratelimiter,
            stats,
            opts: ResolverOptions {
                mode: config.upstream.mode,
                timeout: config.upstream.timeout(),
                refuse_any: config.refuse_any,
                ipv6_disabled: config.ipv6_disabled,
                edns_enabled: config.edns.enabled,
                edns_client_ip: config.edns.client_ip,
                use_private_rdns: config.use_private_rdns,
                cache_min_ttl: config.cache.min_ttl,
                cache_max_ttl: config.cache.max_ttl,
            },
        });

        let dnscrypt_server = match &config.dnscrypt {
            Some(dc) => {
                let secret = crypto_box::SecretKey::from(read_hex_key(&dc.secret_key_file)?);
                let signing =
                    ed25519_dalek::SigningKey::from_bytes(&read_hex_key(&dc.signing_key_file)?);
                Some(Arc::new(dnscrypt::DnsCryptServer::new(
                    &dc.provider_name,
                    secret,
                    &signing,
                )))
            }
            None => None,
        };

        let workers = (config.max_active_queries > 0)
            .then(|| Arc::new(Semaphore::new(config.max_active_queries)));

        Ok(Self {
            config,
            resolver,
            dnscrypt_server,
            workers,
            shutdown: CancellationToken::new(),
            started: Mutex::new(false),
            tasks: Mutex::new(Vec::new()),
            bound: Mutex::new(HashMap::new()),
        })
    }

    /// The engine, for embedding and tests.
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// First bound address for a transport, available after `start`.
    pub fn local_addr(&self, proto: Proto) -> Option<SocketAddr> {
        self.bound
            .lock()
            .get(proto.as_str())
            .and_then(|addrs| addrs.first().copied())
    }

    /// Bind every configured listener and spawn its loop.
    pub async fn start(&self) -> Result<()> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(ListenError::AlreadyStarted.into());
            }
            *started = true;
        }
        info!("starting dns proxy");

        let pool = buffer::BufferPool::default();

        for &addr in &self.config.listen.udp {
            let socket = Arc::new(bind_udp(addr).await?);
            self.record(Proto::Udp, socket.local_addr()?);
            self.spawn(udp::serve(
                socket,
                Arc::clone(&self.resolver),
                self.workers.clone(),
                self.shutdown.clone(),
                pool.clone(),
            ));
        }

        for &addr in &self.config.listen.tcp {
            let listener = bind_tcp(addr).await?;
            self.record(Proto::Tcp, listener.local_addr()?);
            self.spawn(tcp::serve(
                listener,
                Arc::clone(&self.resolver),
                Proto::Tcp,
                None,
                self.workers.clone(),
                self.shutdown.clone(),
            ));
        }

        if !self.config.listen.tls.is_empty() {
            let acceptor = TlsAcceptor::from(self.server_tls_config(&[b"dot"])?);
            for &addr in &self.config.listen.tls {
                let listener = bind_tcp(addr).await?;
                self.record(Proto::Tls, listener.local_addr()?);
                self.spawn(tcp::serve(
                    listener,
                    Arc::clone(&self.resolver),
                    Proto::Tls,
                    Some(acceptor.clone()),
                    self.workers.clone(),
                    self.shutdown.clone(),
                ));
            }
        }

        if !self.config.listen.https.is_empty() {
            let acceptor = TlsAcceptor::from(self.server_tls_config(&[b"h2", b"http/1.1"])?);
            for &addr in &self.config.listen.https {
                let listener = bind_tcp(addr).await?;
                self.record(Proto::Https, listener.local_addr()?);
                self.spawn(https::serve(
                    listener,
                    Arc::clone(&self.resolver),
                    acceptor.clone(),
                    self.workers.clone(),
                    self.shutdown.clone(),
                ));

                // HTTP/3 answers on the same address over UDP.
                if self.config.upstream.http3 {
                    let endpoint = quic::make_endpoint(addr, self.server_tls_config(&[b"h3"])?)?;
                    self.spawn(https::serve_h3(
                        endpoint,
                        Arc::clone(&self.resolver),
                        self.shutdown.clone(),
                    ));
                }
            }
        }

        if !self.config.listen.quic.is_empty() {
            let tls = self.server_tls_config(&[crate::upstream::quic::ALPN_DOQ])?;
            for &addr in &self.config.listen.quic {
                let endpoint = quic::make_endpoint(addr, Arc::clone(&tls))?;
                self.record(Proto::Quic, endpoint.local_addr()?);
                self.spawn(quic::serve(
                    endpoint,
                    Arc::clone(&self.resolver),
                    self.workers.clone(),
                    self.shutdown.clone(),
                ));
            }
        }

        if let Some(server) = &self.dnscrypt_server {
            for &addr in &self.config.listen.dnscrypt_udp {
                let socket = Arc::new(bind_udp(addr).await?);
                self.record(Proto::DnsCrypt, socket.local_addr()?);
                self.spawn(dnscrypt::serve_udp(
                    socket,
                    Arc::clone(server),
                    Arc::clone(&self.resolver),
                    self.workers.clone(),
                    self.shutdown.clone(),
                    pool.clone(),
                ));
            }
            for &addr in &self.config.listen.dnscrypt_tcp {
                let listener = bind_tcp(addr).await?;
                self.spawn(dnscrypt::serve_tcp(
                    listener,
                    Arc::clone(server),
                    Arc::clone(&self.resolver),
                    self.workers.clone(),
                    self.shutdown.clone(),
                ));
            }
        }

        info!("dns proxy started");
        Ok(())
    }

    /// Stop listeners and give in-flight queries a bounded grace period.
    pub async fn shutdown(&self) {
        {
            let mut started = self.started.lock();
            if !*started {
                return;
            }
            *started = false;
        }
        info!("stopping dns proxy");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        let drain = async {
            for task in tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("listeners did not stop within the grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
        info!("dns proxy stopped");
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(task));
    }

    fn record(&self, proto: Proto, addr: SocketAddr) {
        info!(proto = proto.as_str(), %addr, "listening");
        self.bound.lock().entry(proto.as_str()).or_default().push(addr);
    }

    fn server_tls_config(&self, alpn: &[&[u8]]) -> Result<Arc<rustls::ServerConfig>> {
        crate::upstream::tls::ensure_crypto_provider();
        let tls = self
            .config
            .tls
            .as_ref()
            .ok_or_else(|| ListenError::TlsSetup("missing [tls] section".into()))?;
        let (certs, key) = load_cert_files(&tls.cert_path, &tls.key_path)?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ListenError::TlsSetup(e.to_string()))?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(Arc::new(config))
    }
}

async fn bind_udp(addr: SocketAddr) -> Result<UdpSocket> {
    UdpSocket::bind(addr)
        .await
        .map_err(|e| ListenError::Bind { addr, source: e }.into())
}

async fn bind_tcp(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ListenError::Bind { addr, source: e }.into())
}

fn parse_spec_lines(lines: &[String]) -> Result<Vec<UpstreamSpec>> {
    lines
        .iter()
        .map(|line| UpstreamSpec::parse(line).map_err(Error::Config))
        .collect()
}

fn build_optional_registry(
    lines: &[String],
    opts: &UpstreamOptions,
) -> Result<Option<Registry>> {
    if lines.is_empty() {
        return Ok(None);
    }
    let specs = parse_spec_lines(lines)?;
    Ok(Some(Registry::from_specs(&specs, opts)?))
}

async fn load_filters(filters: &Arc<Filters>, config: &Config, stats: &Arc<Stats>) {
    // Exclusions load first so blocklist loading can honor them.
    let mut exclusions = DomainMatcher::new();
    for path in &config.filter.exclusion_files {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                for line in content.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                        continue;
                    }
                    exclusions.insert(line);
                }
            }
            Err(err) => warn!(path = %path.display(), %err, "failed to load exclusion file"),
        }
    }
    info!(count = exclusions.len(), "loaded exclusion patterns");
    *filters.exclusions.write() = exclusions.clone();

    let mut total_duplicates = 0;
    for path in &config.filter.blocklist_files {
        match blocklist::load_file(&filters.blocked, path, &exclusions).await {
            Ok(summary) => {
                total_duplicates += summary.duplicates;
                info!(
                    path = %path.display(),
                    added = summary.added,
                    duplicates = summary.duplicates,
                    excluded = summary.excluded,
                    "loaded blocklist"
                );
            }
            Err(err) => warn!(path = %path.display(), %err, "failed to load blocklist"),
        }
    }
    stats.increment("blocked_domains::num_domains", filters.blocked.len() as u64);
    info!(
        total = filters.blocked.len(),
        duplicates = total_duplicates,
        "blocklists ready"
    );

    let mut cache_exclusions = DomainMatcher::new();
    for path in &config.filter.cache_exclusion_files {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                    continue;
                }
                cache_exclusions.insert(line);
            }
        }
    }
    *filters.cache_exclusions.write() = cache_exclusions;
}

fn parse_prefixes(entries: &[String]) -> PrefixSet {
    PrefixSet::new(entries.iter().filter_map(|e| Prefix::parse(e)).collect())
}

/// Read a 32-byte hex-encoded key file.
fn read_hex_key(path: &Path) -> Result<[u8; 32]> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
    let content = content.trim();
    let bad = |reason: &str| {
        Error::Config(ConfigError::Validation(format!(
            "key file {}: {reason}",
            path.display()
        )))
    };

    if content.len() != 64 {
        return Err(bad("expected 64 hex characters"));
    }
    let mut out = [0u8; 32];
    for (i, chunk) in content.as_bytes().chunks_exact(2).enumerate() {
        let hex = std::str::from_utf8(chunk).map_err(|_| bad("not ascii"))?;
        out[i] = u8::from_str_radix(hex, 16).map_err(|_| bad("invalid hex digit"))?;
    }
    Ok(out)
}

/// Load a certificate chain and private key in PEM format.
fn load_cert_files(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut reader =
        std::io::BufReader::new(std::fs::File::open(cert_path).map_err(ConfigError::ReadFile)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok())
        .collect();
    if certs.is_empty() {
        return Err(ListenError::TlsSetup(format!(
            "no certificates found in {}",
            cert_path.display()
        ))
        .into());
    }

    let mut reader =
        std::io::BufReader::new(std::fs::File::open(key_path).map_err(ConfigError::ReadFile)?);
    let key = loop {
        match rustls_pemfile::read_one(&mut reader).map_err(Error::Io)? {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => break PrivateKeyDer::Pkcs8(key),
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => break PrivateKeyDer::Pkcs1(key),
            Some(rustls_pemfile::Item::Sec1Key(key)) => break PrivateKeyDer::Sec1(key),
            Some(_) => continue,
            None => {
                return Err(ListenError::TlsSetup(format!(
                    "no private key found in {}",
                    key_path.display()
                ))
                .into())
            }
        }
    };

    Ok((certs, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn should_read_hex_key_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", "ab".repeat(32)).unwrap();
        file.flush().unwrap();

        let key = read_hex_key(file.path()).unwrap();
        assert_eq!(key, [0xab; 32]);
    }

    #[test]
    fn should_reject_malformed_key_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not hex at all").unwrap();
        file.flush().unwrap();
        assert!(read_hex_key(file.path()).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", "zz".repeat(32)).unwrap();
        file.flush().unwrap();
        assert!(read_hex_key(file.path()).is_err());
    }

    #[tokio::test]
    async fn should_build_proxy_from_minimal_config() {
        let config = Config::parse(
            r#"
            [listen]
            udp = ["127.0.0.1:0"]

            [upstream]
            servers = ["udp://127.0.0.1:5399"]
        "#,
        )
        .unwrap();
        let proxy = Proxy::new(config).await.unwrap();
        assert!(proxy.local_addr(Proto::Udp).is_none());

        proxy.start().await.unwrap();
        assert!(proxy.local_addr(Proto::Udp).is_some());

        // A second start is refused.
        assert!(proxy.start().await.is_err());

        proxy.shutdown().await;
    }
}
