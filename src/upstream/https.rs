//! DNS-over-HTTPS upstream client.
//!
//! HTTP/2 by way of a per-upstream `reqwest` client; HTTP/3 over
//! quinn/h3 when enabled. Either way the query travels as a POST body
//! with the `application/dns-message` media type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use hickory_proto::op::Message;
use tokio::sync::OnceCell;
use url::Url;

use super::tls::client_config;
use super::udp::resolve_one;
use super::{Exchanger, UpstreamOptions, PORT_HTTPS};
use crate::bootstrap::Bootstrap;
use crate::dns::codec;
use crate::error::ExchangeError;

/// Media type from RFC 8484.
pub const DNS_MESSAGE_TYPE: &str = "application/dns-message";

/// DNS-over-HTTPS upstream.
pub struct DohUpstream {
    /// Full query URL, also the canonical address.
    address: String,
    host: String,
    port: u16,
    timeout: Duration,
    bootstrap: Arc<Bootstrap>,
    insecure: bool,
    http3: bool,
    client: OnceCell<reqwest::Client>,
}

impl DohUpstream {
    pub fn new(url: String, opts: &UpstreamOptions) -> Self {
        // reqwest builds its TLS config lazily from the process-default
        // provider; make sure one is installed before that happens.
        super::tls::ensure_crypto_provider();
        let (host, port) = Url::parse(&url)
            .ok()
            .and_then(|u| {
                let host = u.host_str()?.trim_matches(|c| c == '[' || c == ']').to_string();
                Some((host, u.port_or_known_default().unwrap_or(PORT_HTTPS)))
            })
            .unwrap_or_default();
        Self {
            address: url,
            host,
            port,
            timeout: opts.timeout,
            bootstrap: Arc::clone(&opts.bootstrap),
            insecure: opts.insecure_skip_verify,
            http3: opts.http3,
            client: OnceCell::new(),
        }
    }

    async fn h2_client(&self) -> Result<&reqwest::Client, ExchangeError> {
        self.client
            .get_or_try_init(|| async {
                let server =
                    resolve_one(&self.bootstrap, &self.host, self.port, &self.address).await?;
                let mut builder = reqwest::Client::builder()
                    .timeout(self.timeout)
                    .resolve(&self.host, server);
                if self.insecure {
                    builder = builder.danger_accept_invalid_certs(true);
                }
                builder
                    .build()
                    .map_err(|e| ExchangeError::connection(&self.address, e))
            })
            .await
    }

    async fn exchange_h2(&self, req_bytes: Vec<u8>) -> Result<Vec<u8>, ExchangeError> {
        let client = self.h2_client().await?;
        let response = client
            .post(self.address.as_str())
            .header(reqwest::header::CONTENT_TYPE, DNS_MESSAGE_TYPE)
            .header(reqwest::header::ACCEPT, DNS_MESSAGE_TYPE)
            .body(req_bytes)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExchangeError::timeout(&self.address)
                } else {
                    ExchangeError::connection(&self.address, e)
                }
            })?;

        if !response.status().is_success() {
            return Err(ExchangeError::protocol(
                &self.address,
                format!("http status {}", response.status()),
            ));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?
            .to_vec())
    }

    async fn exchange_h3(&self, req_bytes: Vec<u8>) -> Result<Vec<u8>, ExchangeError> {
        let server = resolve_one(&self.bootstrap, &self.host, self.port, &self.address).await?;
        let tls = client_config(self.insecure, &[b"h3"]);
        let conn = super::quic::connect(server, &self.host, tls, &self.address).await?;

        let quinn_conn = h3_quinn::Connection::new(conn);
        let (mut driver, mut send_request) = h3::client::new(quinn_conn)
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        tokio::spawn(async move {
            let _ = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
        });

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(self.address.as_str())
            .header(http::header::CONTENT_TYPE, DNS_MESSAGE_TYPE)
            .header(http::header::ACCEPT, DNS_MESSAGE_TYPE)
            .body(())
            .map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let mut stream = send_request
            .send_request(request)
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        stream
            .send_data(Bytes::from(req_bytes))
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        stream
            .finish()
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        if !response.status().is_success() {
            return Err(ExchangeError::protocol(
                &self.address,
                format!("http status {}", response.status()),
            ));
        }

        let mut body = Vec::new();
        while let Some(mut chunk) = stream
            .recv_data()
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?
        {
            let bytes = chunk.copy_to_bytes(chunk.remaining());
            body.extend_from_slice(&bytes);
        }
        Ok(body)
    }
}

#[async_trait]
impl Exchanger for DohUpstream {
    async fn exchange(&self, req: &Message) -> Result<Message, ExchangeError> {
        let req_bytes =
            codec::encode(req).map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let resp_bytes = tokio::time::timeout(self.timeout, async {
            if self.http3 {
                self.exchange_h3(req_bytes).await
            } else {
                self.exchange_h2(req_bytes).await
            }
        })
        .await
        .map_err(|_| ExchangeError::timeout(&self.address))??;

        let resp = codec::decode(&resp_bytes)
            .map_err(|e| ExchangeError::protocol(&self.address, e))?;
        if resp.id() != req.id() {
            return Err(ExchangeError::protocol(&self.address, "response id mismatch"));
        }
        Ok(resp)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> UpstreamOptions {
        let bootstrap = Arc::new(Bootstrap::new(Vec::new(), Duration::from_secs(1)));
        UpstreamOptions::new(bootstrap)
    }

    #[test]
    fn should_extract_host_and_port_from_url() {
        let upstream = DohUpstream::new("https://dns.example.com/dns-query".into(), &options());
        assert_eq!(upstream.host, "dns.example.com");
        assert_eq!(upstream.port, 443);

        let upstream = DohUpstream::new("https://dns.example.com:8443/q".into(), &options());
        assert_eq!(upstream.port, 8443);
    }

    #[test]
    fn should_use_url_as_address() {
        let upstream = DohUpstream::new("https://dns.example.com/dns-query".into(), &options());
        assert_eq!(upstream.address(), "https://dns.example.com/dns-query");
    }
}
