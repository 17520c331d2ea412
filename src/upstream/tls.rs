//! DNS-over-TLS upstream client and the shared rustls client config.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use rustls::pki_types::{CertificateDer, ServerName};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

use super::udp::{exchange_stream, resolve_one, ConnPool};
use super::{Exchanger, UpstreamOptions};
use crate::bootstrap::Bootstrap;
use crate::dns::codec;
use crate::error::ExchangeError;

/// Install the ring crypto provider exactly once; several dependencies
/// compile more than one rustls provider and the process default must
/// be unambiguous before any config builder runs.
pub(crate) fn ensure_crypto_provider() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build the rustls client config used by every encrypted upstream:
/// webpki roots, optional verification bypass, and the given ALPN list.
pub(crate) fn client_config(insecure: bool, alpn: &[&[u8]]) -> Arc<rustls::ClientConfig> {
    ensure_crypto_provider();
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// DNS-over-TLS upstream. TLS sessions are pooled and reused across
/// queries; framing matches TCP (2-byte length prefix).
pub struct DotUpstream {
    address: String,
    host: String,
    port: u16,
    timeout: Duration,
    bootstrap: Arc<Bootstrap>,
    connector: TlsConnector,
    pool: ConnPool<TlsStream<TcpStream>>,
}

impl DotUpstream {
    pub fn new(host: String, port: u16, opts: &UpstreamOptions) -> Self {
        let config = client_config(opts.insecure_skip_verify, &[b"dot"]);
        Self {
            address: format!("tls://{host}:{port}"),
            host,
            port,
            timeout: opts.timeout,
            bootstrap: Arc::clone(&opts.bootstrap),
            connector: TlsConnector::from(config),
            pool: ConnPool::new(),
        }
    }

    async fn connect(&self) -> Result<TlsStream<TcpStream>, ExchangeError> {
        let server = resolve_one(&self.bootstrap, &self.host, self.port, &self.address).await?;
        let sni = ServerName::try_from(self.host.clone())
            .map_err(|e| ExchangeError::connection(&self.address, e))?;

        tokio::time::timeout(self.timeout, async {
            let tcp = TcpStream::connect(server)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;
            tcp.set_nodelay(true)
                .map_err(|e| ExchangeError::connection(&self.address, e))?;
            self.connector
                .connect(sni, tcp)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))
        })
        .await
        .map_err(|_| ExchangeError::timeout(&self.address))?
    }
}

#[async_trait]
impl Exchanger for DotUpstream {
    async fn exchange(&self, req: &Message) -> Result<Message, ExchangeError> {
        let req_bytes =
            codec::encode(req).map_err(|e| ExchangeError::protocol(&self.address, e))?;

        if let Some(mut stream) = self.pool.take() {
            match exchange_stream(&mut stream, &req_bytes, self.timeout, &self.address).await {
                Ok(resp) if resp.id() == req.id() => {
                    self.pool.put(stream);
                    return Ok(resp);
                }
                Ok(_) => {
                    return Err(ExchangeError::protocol(&self.address, "response id mismatch"))
                }
                Err(err) => {
                    debug!(address = %self.address, %err, "pooled tls session failed, reconnecting");
                }
            }
        }

        let mut stream = self.connect().await?;
        let resp = exchange_stream(&mut stream, &req_bytes, self.timeout, &self.address).await?;
        if resp.id() != req.id() {
            return Err(ExchangeError::protocol(&self.address, "response id mismatch"));
        }
        self.pool.put(stream);
        Ok(resp)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Certificate verifier that accepts anything; gated behind the
/// `insecure_skip_verify` option for test environments.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_set_requested_alpn() {
        let config = client_config(false, &[b"dot"]);
        assert_eq!(config.alpn_protocols, vec![b"dot".to_vec()]);

        let config = client_config(false, &[b"h2", b"http/1.1"]);
        assert_eq!(config.alpn_protocols.len(), 2);
    }

    #[test]
    fn should_format_address() {
        let bootstrap = Arc::new(Bootstrap::new(Vec::new(), Duration::from_secs(1)));
        let opts = UpstreamOptions::new(bootstrap);
        let upstream = DotUpstream::new("dns.example.com".into(), 853, &opts);
        assert_eq!(upstream.address(), "tls://dns.example.com:853");
    }
}
