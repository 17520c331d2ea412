//! Plain UDP and TCP upstream clients.
//!
//! UDP is one-shot with retries; truncated answers escalate to the TCP
//! client. TCP keeps a small pool of idle connections per upstream with
//! 2-byte length-prefixed framing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::Message;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::{Exchanger, UpstreamOptions};
use crate::bootstrap::Bootstrap;
use crate::dns::codec;
use crate::error::ExchangeError;

/// Send attempts per UDP exchange (one initial try plus two retries).
const UDP_ATTEMPTS: usize = 3;

/// Idle pooled TCP connections are dropped after this long.
pub(crate) const TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connections kept per upstream.
const MAX_IDLE_CONNS: usize = 8;

/// Plain DNS-over-UDP upstream.
pub struct UdpUpstream {
    address: String,
    host: String,
    port: u16,
    timeout: Duration,
    bootstrap: Arc<Bootstrap>,
    /// Used when a response comes back truncated.
    tcp_fallback: TcpUpstream,
}

impl UdpUpstream {
    pub fn new(host: String, port: u16, opts: &UpstreamOptions) -> Self {
        Self {
            address: format!("udp://{host}:{port}"),
            tcp_fallback: TcpUpstream::new(host.clone(), port, opts),
            host,
            port,
            timeout: opts.timeout,
            bootstrap: Arc::clone(&opts.bootstrap),
        }
    }

    async fn exchange_once(
        &self,
        server: SocketAddr,
        req_bytes: &[u8],
        req_id: u16,
    ) -> Result<Message, ExchangeError> {
        let socket = match server {
            SocketAddr::V4(_) => UdpSocket::bind("0.0.0.0:0").await,
            SocketAddr::V6(_) => UdpSocket::bind("[::]:0").await,
        }
        .map_err(|e| ExchangeError::connection(&self.address, e))?;
        socket
            .connect(server)
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        socket
            .send(req_bytes)
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;

        let mut buf = vec![0u8; codec::MAX_PACKET_SIZE];
        loop {
            let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| ExchangeError::timeout(&self.address))?
                .map_err(|e| ExchangeError::connection(&self.address, e))?;

            let resp = codec::decode(&buf[..len])
                .map_err(|e| ExchangeError::protocol(&self.address, e))?;
            // Datagrams with a stray id belong to an earlier retry.
            if resp.id() == req_id {
                return Ok(resp);
            }
            debug!(address = %self.address, "ignoring response with mismatched id");
        }
    }
}

#[async_trait]
impl Exchanger for UdpUpstream {
    async fn exchange(&self, req: &Message) -> Result<Message, ExchangeError> {
        let server = resolve_one(&self.bootstrap, &self.host, self.port, &self.address).await?;
        let req_bytes =
            codec::encode(req).map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let mut last_err = ExchangeError::timeout(&self.address);
        for _ in 0..UDP_ATTEMPTS {
            match self.exchange_once(server, &req_bytes, req.id()).await {
                Ok(resp) if resp.truncated() => {
                    debug!(address = %self.address, "truncated response, retrying over tcp");
                    return self.tcp_fallback.exchange(req).await;
                }
                Ok(resp) => return Ok(resp),
                Err(err @ ExchangeError::Protocol { .. }) => return Err(err),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Plain DNS-over-TCP upstream with connection reuse.
pub struct TcpUpstream {
    address: String,
    host: String,
    port: u16,
    timeout: Duration,
    bootstrap: Arc<Bootstrap>,
    pool: ConnPool<TcpStream>,
}

impl TcpUpstream {
    pub fn new(host: String, port: u16, opts: &UpstreamOptions) -> Self {
        Self {
            address: format!("tcp://{host}:{port}"),
            host,
            port,
            timeout: opts.timeout,
            bootstrap: Arc::clone(&opts.bootstrap),
            pool: ConnPool::new(),
        }
    }

    async fn connect(&self) -> Result<TcpStream, ExchangeError> {
        let server = resolve_one(&self.bootstrap, &self.host, self.port, &self.address).await?;
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(server))
            .await
            .map_err(|_| ExchangeError::timeout(&self.address))?
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        Ok(stream)
    }
}

#[async_trait]
impl Exchanger for TcpUpstream {
    async fn exchange(&self, req: &Message) -> Result<Message, ExchangeError> {
        let req_bytes =
            codec::encode(req).map_err(|e| ExchangeError::protocol(&self.address, e))?;

        // A pooled connection may have died since we parked it; retry
        // once on a fresh one before reporting failure.
        if let Some(mut stream) = self.pool.take() {
            match exchange_stream(&mut stream, &req_bytes, self.timeout, &self.address).await {
                Ok(resp) => {
                    self.pool.put(stream);
                    return verify_id(resp, req.id(), &self.address);
                }
                Err(err) => {
                    debug!(address = %self.address, %err, "pooled connection failed, reconnecting");
                }
            }
        }

        let mut stream = self.connect().await?;
        let resp = exchange_stream(&mut stream, &req_bytes, self.timeout, &self.address).await?;
        self.pool.put(stream);
        verify_id(resp, req.id(), &self.address)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

fn verify_id(resp: Message, req_id: u16, address: &str) -> Result<Message, ExchangeError> {
    if resp.id() != req_id {
        return Err(ExchangeError::protocol(address, "response id mismatch"));
    }
    Ok(resp)
}

/// Resolve an upstream host and pick the first address.
pub(crate) async fn resolve_one(
    bootstrap: &Bootstrap,
    host: &str,
    port: u16,
    address: &str,
) -> Result<SocketAddr, ExchangeError> {
    let addrs = bootstrap
        .resolve(host, port)
        .await
        .map_err(|e| ExchangeError::connection(address, e))?;
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| ExchangeError::connection(address, "bootstrap returned no addresses"))
}

/// Length-prefixed request/response over any byte stream.
pub(crate) async fn exchange_stream<S>(
    stream: &mut S,
    req_bytes: &[u8],
    timeout: Duration,
    address: &str,
) -> Result<Message, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    tokio::time::timeout(timeout, async {
        write_prefixed(stream, req_bytes)
            .await
            .map_err(|e| ExchangeError::connection(address, e))?;
        let resp_bytes = read_prefixed(stream)
            .await
            .map_err(|e| ExchangeError::connection(address, e))?;
        codec::decode(&resp_bytes).map_err(|e| ExchangeError::protocol(address, e))
    })
    .await
    .map_err(|_| ExchangeError::timeout(address))?
}

/// Write a DNS message with its 2-byte big-endian length prefix.
pub(crate) async fn write_prefixed<S>(stream: &mut S, msg: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin + Send,
{
    let len = u16::try_from(msg.len())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "message too long"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(msg).await?;
    stream.flush().await
}

/// Read a length-prefixed DNS message.
pub(crate) async fn read_prefixed<S>(stream: &mut S) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin + Send,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// A tiny idle-connection pool.
pub(crate) struct ConnPool<S> {
    idle: Mutex<Vec<(S, Instant)>>,
}

impl<S> ConnPool<S> {
    pub(crate) fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Pop the most recently parked connection that is still fresh.
    pub(crate) fn take(&self) -> Option<S> {
        let mut idle = self.idle.lock();
        while let Some((conn, parked_at)) = idle.pop() {
            if parked_at.elapsed() < TCP_IDLE_TIMEOUT {
                return Some(conn);
            }
            // Stale; drop it and keep looking.
        }
        None
    }

    pub(crate) fn put(&self, conn: S) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNS {
            idle.push((conn, Instant::now()));
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::message::reply_to;
    use hickory_proto::op::{Query, ResponseCode};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    fn request(domain: &str, id: u16) -> Message {
        let mut q = Query::new();
        q.set_name(Name::from_str(domain).unwrap());
        q.set_query_type(RecordType::A);
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_query(q);
        msg
    }

    fn options() -> UpstreamOptions {
        let bootstrap = Arc::new(Bootstrap::new(Vec::new(), Duration::from_secs(1)));
        let mut opts = UpstreamOptions::new(bootstrap);
        opts.timeout = Duration::from_millis(800);
        opts
    }

    async fn fake_udp_server(answer: Ipv4Addr, truncated: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let Ok(req) = codec::decode(&buf[..len]) else {
                    continue;
                };
                let mut resp = reply_to(&req, ResponseCode::NoError);
                resp.set_truncated(truncated);
                if !truncated {
                    if let Some(q) = req.queries().first() {
                        resp.add_answer(Record::from_rdata(
                            q.name().clone(),
                            60,
                            RData::A(A(answer)),
                        ));
                    }
                }
                let _ = socket.send_to(&codec::encode(&resp).unwrap(), peer).await;
            }
        });
        addr
    }

    async fn fake_tcp_server(answer: Ipv4Addr) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let conn_count = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                conn_count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    while let Ok(req_bytes) = read_prefixed(&mut stream).await {
                        let Ok(req) = codec::decode(&req_bytes) else {
                            break;
                        };
                        let mut resp = reply_to(&req, ResponseCode::NoError);
                        if let Some(q) = req.queries().first() {
                            resp.add_answer(Record::from_rdata(
                                q.name().clone(),
                                60,
                                RData::A(A(answer)),
                            ));
                        }
                        if write_prefixed(&mut stream, &codec::encode(&resp).unwrap())
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                });
            }
        });
        (addr, connections)
    }

    #[tokio::test]
    async fn should_exchange_over_udp() {
        let server = fake_udp_server(Ipv4Addr::new(93, 184, 216, 34), false).await;
        let upstream = UdpUpstream::new(server.ip().to_string(), server.port(), &options());

        let req = request("example.com.", 0x1234);
        let resp = upstream.exchange(&req).await.unwrap();
        assert_eq!(resp.id(), 0x1234);
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn should_escalate_truncated_udp_to_tcp() {
        // The UDP server always sets TC; TCP on the same port answers.
        let udp = fake_udp_server(Ipv4Addr::new(1, 2, 3, 4), true).await;
        let (tcp, _) = fake_tcp_server(Ipv4Addr::new(5, 6, 7, 8)).await;

        // Point the fallback at the TCP server's port by building the
        // upstream against it directly.
        let mut upstream = UdpUpstream::new(udp.ip().to_string(), udp.port(), &options());
        upstream.tcp_fallback = TcpUpstream::new(tcp.ip().to_string(), tcp.port(), &options());

        let resp = upstream.exchange(&request("example.com.", 7)).await.unwrap();
        assert_eq!(
            resp.answers()[0].data().unwrap().as_a().unwrap().0,
            Ipv4Addr::new(5, 6, 7, 8)
        );
    }

    #[tokio::test]
    async fn should_time_out_against_dead_upstreams() {
        let upstream = UdpUpstream::new("127.0.0.1".into(), 1, &options());
        let err = upstream.exchange(&request("example.com.", 1)).await;
        assert!(err.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn should_reuse_tcp_connections() {
        let (addr, connections) = fake_tcp_server(Ipv4Addr::new(9, 9, 9, 9)).await;
        let upstream = TcpUpstream::new(addr.ip().to_string(), addr.port(), &options());

        for id in 0..3u16 {
            let resp = upstream.exchange(&request("example.com.", id)).await.unwrap();
            assert_eq!(resp.id(), id);
        }
        assert_eq!(connections.load(Ordering::SeqCst), 1);
        assert_eq!(upstream.pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn should_reconnect_when_pooled_connection_died() {
        let (addr, connections) = fake_tcp_server(Ipv4Addr::new(9, 9, 9, 9)).await;
        let upstream = TcpUpstream::new(addr.ip().to_string(), addr.port(), &options());

        upstream.exchange(&request("example.com.", 1)).await.unwrap();

        // Replace the pooled connection with one whose server side is
        // already closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        let (dead, accepted) = tokio::join!(TcpStream::connect(dead_addr), listener.accept());
        drop(accepted);
        drop(upstream.pool.take());
        upstream.pool.put(dead.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let resp = upstream.exchange(&request("example.com.", 2)).await.unwrap();
        assert_eq!(resp.id(), 2);
        assert!(connections.load(Ordering::SeqCst) >= 2);
    }
}
