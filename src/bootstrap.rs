//! Bootstrap resolution of upstream hostnames.
//!
//! Encrypted upstreams are configured by hostname (`tls://dns.example`)
//! and that hostname has to be resolved without the proxy's own pipeline.
//! A fixed list of bootstrap servers is used exclusively when configured;
//! otherwise the system hosts file is consulted first and the OS resolver
//! last. Results are cached with short negative caching so a flapping
//! bootstrap cannot stall every connection attempt.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use moka::sync::Cache;
use moka::Expiry;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::dns::codec;
use crate::error::{Error, Result};

/// Positive results live this long.
const POSITIVE_TTL: Duration = Duration::from_secs(300);

/// Failed lookups are remembered for 30 seconds.
const NEGATIVE_TTL: Duration = Duration::from_secs(30);

/// Bound on cached hostnames.
const MAX_CACHED: u64 = 512;

#[derive(Debug, Clone)]
enum Resolved {
    Addrs(Vec<IpAddr>),
    Failed(String),
}

struct ResolvedExpiry;

impl Expiry<String, Arc<Resolved>> for ResolvedExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<Resolved>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(match **value {
            Resolved::Addrs(_) => POSITIVE_TTL,
            Resolved::Failed(_) => NEGATIVE_TTL,
        })
    }
}

/// Resolver for upstream hostnames.
pub struct Bootstrap {
    servers: Vec<SocketAddr>,
    hosts_path: PathBuf,
    timeout: Duration,
    cache: Cache<String, Arc<Resolved>>,
}

impl Bootstrap {
    /// `servers` empty means "hosts file, then the OS resolver".
    pub fn new(servers: Vec<SocketAddr>, timeout: Duration) -> Self {
        Self {
            servers,
            hosts_path: PathBuf::from("/etc/hosts"),
            timeout,
            cache: Cache::builder()
                .max_capacity(MAX_CACHED)
                .expire_after(ResolvedExpiry)
                .build(),
        }
    }

    #[cfg(test)]
    fn with_hosts_path(mut self, path: PathBuf) -> Self {
        self.hosts_path = path;
        self
    }

    /// Resolve `host` to socket addresses on `port`.
    ///
    /// IP literals pass straight through without caching.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let key = host.to_ascii_lowercase();
        if let Some(cached) = self.cache.get(&key) {
            return match &*cached {
                Resolved::Addrs(addrs) => {
                    Ok(addrs.iter().map(|&ip| SocketAddr::new(ip, port)).collect())
                }
                Resolved::Failed(reason) => Err(Error::Bootstrap(format!(
                    "{host}: {reason} (cached failure)"
                ))),
            };
        }

        match self.lookup(&key).await {
            Ok(addrs) => {
                self.cache
                    .insert(key, Arc::new(Resolved::Addrs(addrs.clone())));
                Ok(addrs.into_iter().map(|ip| SocketAddr::new(ip, port)).collect())
            }
            Err(err) => {
                self.cache
                    .insert(key, Arc::new(Resolved::Failed(err.to_string())));
                Err(err)
            }
        }
    }

    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if self.servers.is_empty() {
            if let Some(addrs) = self.lookup_hosts_file(host).await {
                return Ok(addrs);
            }
            return self.lookup_system(host).await;
        }

        // Parallel mode: ask every bootstrap, first usable answer wins.
        let mut tasks = tokio::task::JoinSet::new();
        for &server in &self.servers {
            let host = host.to_string();
            let timeout = self.timeout;
            tasks.spawn(async move { query_server(server, &host, timeout).await });
        }

        let mut last_err = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(addrs)) if !addrs.is_empty() => return Ok(addrs),
                Ok(Ok(_)) => last_err = Some(Error::Bootstrap(format!("{host}: empty answer"))),
                Ok(Err(err)) => last_err = Some(err),
                Err(join_err) => last_err = Some(Error::Bootstrap(join_err.to_string())),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Bootstrap(format!("{host}: no bootstrap servers"))))
    }

    async fn lookup_hosts_file(&self, host: &str) -> Option<Vec<IpAddr>> {
        let content = tokio::fs::read_to_string(&self.hosts_path).await.ok()?;
        let mut addrs = Vec::new();
        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(ip) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
                continue;
            };
            if fields.any(|name| name.eq_ignore_ascii_case(host)) {
                addrs.push(ip);
            }
        }
        if addrs.is_empty() {
            None
        } else {
            debug!(host, count = addrs.len(), "bootstrap resolved from hosts file");
            Some(addrs)
        }
    }

    async fn lookup_system(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| Error::Bootstrap(format!("{host}: {e}")))?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(Error::Bootstrap(format!("{host}: no addresses")));
        }
        Ok(addrs)
    }
}

/// One plain-DNS lookup against a single bootstrap server: A first, AAAA
/// when A comes back empty.
async fn query_server(server: SocketAddr, host: &str, timeout: Duration) -> Result<Vec<IpAddr>> {
    let mut addrs = query_rrtype(server, host, RecordType::A, timeout).await?;
    if addrs.is_empty() {
        addrs = query_rrtype(server, host, RecordType::AAAA, timeout).await?;
    }
    Ok(addrs)
}

async fn query_rrtype(
    server: SocketAddr,
    host: &str,
    rrtype: RecordType,
    timeout: Duration,
) -> Result<Vec<IpAddr>> {
    let name =
        Name::from_utf8(host).map_err(|e| Error::Bootstrap(format!("{host}: {e}")))?;
    let mut query = Query::new();
    query.set_name(name);
    query.set_query_type(rrtype);

    let mut req = Message::new();
    req.set_id(rand::thread_rng().gen())
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(query);

    let socket = match server {
        SocketAddr::V4(_) => UdpSocket::bind("0.0.0.0:0").await,
        SocketAddr::V6(_) => UdpSocket::bind("[::]:0").await,
    }
    .map_err(|e| Error::Bootstrap(e.to_string()))?;
    socket
        .connect(server)
        .await
        .map_err(|e| Error::Bootstrap(e.to_string()))?;
    socket
        .send(&codec::encode(&req).map_err(|e| Error::Bootstrap(e.to_string()))?)
        .await
        .map_err(|e| Error::Bootstrap(e.to_string()))?;

    let mut buf = vec![0u8; codec::PLAIN_UDP_SIZE];
    let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| Error::Bootstrap(format!("bootstrap {server} timed out")))?
        .map_err(|e| Error::Bootstrap(e.to_string()))?;

    let resp = codec::decode(&buf[..len]).map_err(|e| Error::Bootstrap(e.to_string()))?;
    Ok(resp
        .answers()
        .iter()
        .filter_map(|rr| match rr.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::Record;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use tempfile::NamedTempFile;

    /// A loopback UDP nameserver answering every A query with `answer`.
    async fn fake_nameserver(answer: Ipv4Addr) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let Ok(req) = codec::decode(&buf[..len]) else {
                    continue;
                };
                let mut resp = crate::dns::message::reply_to(&req, ResponseCode::NoError);
                if let Some(q) = req.queries().first() {
                    if q.query_type() == RecordType::A {
                        resp.add_answer(Record::from_rdata(
                            q.name().clone(),
                            60,
                            RData::A(A(answer)),
                        ));
                    }
                }
                let _ = socket
                    .send_to(&codec::encode(&resp).unwrap(), peer)
                    .await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn should_pass_ip_literals_through() {
        let bootstrap = Bootstrap::new(Vec::new(), Duration::from_secs(1));
        let addrs = bootstrap.resolve("203.0.113.1", 853).await.unwrap();
        assert_eq!(addrs, vec!["203.0.113.1:853".parse().unwrap()]);

        let addrs = bootstrap.resolve("2001:db8::1", 853).await.unwrap();
        assert_eq!(addrs, vec!["[2001:db8::1]:853".parse().unwrap()]);
    }

    #[tokio::test]
    async fn should_resolve_via_fixed_bootstrap_servers() {
        let ns = fake_nameserver(Ipv4Addr::new(198, 51, 100, 7)).await;
        let bootstrap = Bootstrap::new(vec![ns], Duration::from_secs(2));

        let addrs = bootstrap.resolve("dns.example.com", 853).await.unwrap();
        assert_eq!(addrs, vec!["198.51.100.7:853".parse().unwrap()]);
    }

    #[tokio::test]
    async fn should_race_multiple_bootstraps_and_use_first_answer() {
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let ns = fake_nameserver(Ipv4Addr::new(198, 51, 100, 8)).await;
        let bootstrap = Bootstrap::new(vec![dead, ns], Duration::from_millis(500));

        let addrs = bootstrap.resolve("dns.example.com", 443).await.unwrap();
        assert_eq!(addrs, vec!["198.51.100.8:443".parse().unwrap()]);
    }

    #[tokio::test]
    async fn should_cache_lookup_results() {
        let ns = fake_nameserver(Ipv4Addr::new(198, 51, 100, 9)).await;
        let bootstrap = Bootstrap::new(vec![ns], Duration::from_secs(2));

        let first = bootstrap.resolve("dns.example.com", 853).await.unwrap();
        // Second resolution is served from cache; a different port must
        // still be applied to the cached addresses.
        let second = bootstrap.resolve("dns.example.com", 443).await.unwrap();
        assert_eq!(first[0].ip(), second[0].ip());
        assert_eq!(second[0].port(), 443);
    }

    #[tokio::test]
    async fn should_prefer_hosts_file_entries() {
        let mut hosts = NamedTempFile::new().unwrap();
        writeln!(hosts, "# local names").unwrap();
        writeln!(hosts, "192.0.2.50 dns.internal dns").unwrap();
        hosts.flush().unwrap();

        let bootstrap = Bootstrap::new(Vec::new(), Duration::from_secs(1))
            .with_hosts_path(hosts.path().to_path_buf());

        let addrs = bootstrap.resolve("dns.internal", 53).await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.50:53".parse().unwrap()]);
    }

    #[tokio::test]
    async fn should_remember_failures_negatively() {
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let bootstrap = Bootstrap::new(vec![dead], Duration::from_millis(100));

        assert!(bootstrap.resolve("nope.example.com", 53).await.is_err());
        // The cached failure answers immediately.
        let err = bootstrap.resolve("nope.example.com", 53).await.unwrap_err();
        assert!(err.to_string().contains("cached failure"));
    }
}
