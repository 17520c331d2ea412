//! DNS-over-QUIC upstream client (RFC 9250).
//!
//! One bidirectional stream per query with the TCP-style 2-byte length
//! prefix; the message id on the wire is zero, as the RFC requires, and
//! is restored on the way back. The QUIC connection is kept open and
//! shared by consecutive queries until it closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::debug;

use super::tls::client_config;
use super::udp::resolve_one;
use super::{Exchanger, UpstreamOptions};
use crate::bootstrap::Bootstrap;
use crate::dns::codec;
use crate::error::ExchangeError;

/// ALPN token for DNS-over-QUIC.
pub(crate) const ALPN_DOQ: &[u8] = b"doq";

/// DNS-over-QUIC upstream.
pub struct DoqUpstream {
    address: String,
    host: String,
    port: u16,
    timeout: Duration,
    bootstrap: Arc<Bootstrap>,
    tls: Arc<rustls::ClientConfig>,
    conn: tokio::sync::Mutex<Option<quinn::Connection>>,
}

impl DoqUpstream {
    pub fn new(host: String, port: u16, opts: &UpstreamOptions) -> Self {
        Self {
            address: format!("quic://{host}:{port}"),
            host,
            port,
            timeout: opts.timeout,
            bootstrap: Arc::clone(&opts.bootstrap),
            tls: client_config(opts.insecure_skip_verify, &[ALPN_DOQ]),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    async fn connection(&self) -> Result<quinn::Connection, ExchangeError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            debug!(address = %self.address, "quic connection closed, redialing");
        }

        let server = resolve_one(&self.bootstrap, &self.host, self.port, &self.address).await?;
        let conn = tokio::time::timeout(
            self.timeout,
            connect(server, &self.host, Arc::clone(&self.tls), &self.address),
        )
        .await
        .map_err(|_| ExchangeError::timeout(&self.address))??;

        *slot = Some(conn.clone());
        Ok(conn)
    }
}

/// Dial a QUIC connection with the given TLS config and SNI.
pub(crate) async fn connect(
    server: SocketAddr,
    server_name: &str,
    tls: Arc<rustls::ClientConfig>,
    address: &str,
) -> Result<quinn::Connection, ExchangeError> {
    let bind: SocketAddr = match server {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
        SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
    };
    let mut endpoint =
        quinn::Endpoint::client(bind).map_err(|e| ExchangeError::connection(address, e))?;

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls)
        .map_err(|e| ExchangeError::connection(address, e))?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

    endpoint
        .connect(server, server_name)
        .map_err(|e| ExchangeError::connection(address, e))?
        .await
        .map_err(|e| ExchangeError::connection(address, e))
}

#[async_trait]
impl Exchanger for DoqUpstream {
    async fn exchange(&self, req: &Message) -> Result<Message, ExchangeError> {
        // RFC 9250 §4.2.1: the wire id is zero on DoQ.
        let mut wire_req = req.clone();
        wire_req.set_id(0);
        let req_bytes =
            codec::encode(&wire_req).map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let conn = self.connection().await?;
        let resp_bytes = tokio::time::timeout(self.timeout, async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;

            let mut framed = Vec::with_capacity(2 + req_bytes.len());
            framed.extend_from_slice(&(req_bytes.len() as u16).to_be_bytes());
            framed.extend_from_slice(&req_bytes);
            send.write_all(&framed)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;
            send.finish()
                .map_err(|e| ExchangeError::connection(&self.address, e))?;

            recv.read_to_end(2 + codec::MAX_PACKET_SIZE)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))
        })
        .await
        .map_err(|_| ExchangeError::timeout(&self.address))??;

        if resp_bytes.len() < 2 {
            return Err(ExchangeError::protocol(&self.address, "missing length prefix"));
        }
        let declared = usize::from(u16::from_be_bytes([resp_bytes[0], resp_bytes[1]]));
        let body = &resp_bytes[2..];
        if declared != body.len() {
            return Err(ExchangeError::protocol(&self.address, "length prefix mismatch"));
        }

        let mut resp =
            codec::decode(body).map_err(|e| ExchangeError::protocol(&self.address, e))?;
        if resp.id() != 0 {
            return Err(ExchangeError::protocol(&self.address, "non-zero doq message id"));
        }
        resp.set_id(req.id());
        Ok(resp)
    }

    fn address(&self) -> &str {
        &self.address
    }
}
