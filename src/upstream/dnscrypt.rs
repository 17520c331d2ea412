//! DNSCrypt v2 upstream client.
//!
//! The client fetches the resolver certificate with a plain TXT query to
//! the provider name, verifies it against the provider's ed25519 key
//! from the `sdns://` stamp, and then seals queries with the negotiated
//! cipher. The certificate is re-fetched when it expires.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use crypto_box::{PublicKey, SecretKey};
use ed25519_dalek::VerifyingKey;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use super::{Exchanger, UpstreamOptions};
use crate::dns::codec;
use crate::dnscrypt::{
    open_response, seal_query, Cert, CipherBox, DnsCryptStamp,
};
use crate::error::ExchangeError;

struct ClientState {
    cert: Cert,
    cipher: CipherBox,
}

/// DNSCrypt upstream client.
pub struct DnsCryptUpstream {
    address: String,
    stamp: DnsCryptStamp,
    timeout: Duration,
    client_secret: SecretKey,
    client_pk: PublicKey,
    state: tokio::sync::Mutex<Option<std::sync::Arc<ClientState>>>,
}

impl DnsCryptUpstream {
    pub fn new(stamp: DnsCryptStamp, opts: &UpstreamOptions) -> Self {
        let bytes: [u8; 32] = rand::thread_rng().gen();
        let client_secret = SecretKey::from(bytes);
        let client_pk = client_secret.public_key();
        Self {
            address: format!("dnscrypt://{}", stamp.provider_name),
            stamp,
            timeout: opts.timeout,
            client_secret,
            client_pk,
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Fetch and verify the resolver certificate, picking the valid one
    /// with the highest serial.
    async fn fetch_cert(&self) -> Result<Cert, ExchangeError> {
        let provider_pk = VerifyingKey::from_bytes(&self.stamp.provider_pk)
            .map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let name = Name::from_utf8(&self.stamp.provider_name)
            .map_err(|e| ExchangeError::protocol(&self.address, e))?;
        let mut query = Query::new();
        query.set_name(name);
        query.set_query_type(RecordType::TXT);
        let mut req = Message::new();
        req.set_id(rand::thread_rng().gen())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(query);

        let resp = self
            .udp_roundtrip(
                self.stamp.addr,
                &codec::encode(&req).map_err(|e| ExchangeError::protocol(&self.address, e))?,
            )
            .await?;
        let resp =
            codec::decode(&resp).map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let mut best: Option<Cert> = None;
        for rr in resp.answers() {
            let Some(RData::TXT(txt)) = rr.data() else {
                continue;
            };
            let data: Vec<u8> = txt
                .txt_data()
                .iter()
                .flat_map(|chunk| chunk.iter().copied())
                .collect();
            match Cert::parse(&data, &provider_pk) {
                Ok(cert) if cert.is_valid_now() => {
                    if best.as_ref().map_or(true, |b| cert.serial > b.serial) {
                        best = Some(cert);
                    }
                }
                Ok(_) => debug!(address = %self.address, "skipping out-of-window certificate"),
                Err(err) => {
                    debug!(address = %self.address, %err, "skipping unverifiable certificate")
                }
            }
        }
        best.ok_or_else(|| ExchangeError::protocol(&self.address, "no valid certificate"))
    }

    async fn udp_roundtrip(
        &self,
        server: SocketAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>, ExchangeError> {
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
            .send(payload)
            .await
            .map_err(|e| ExchangeError::connection(&self.address, e))?;

        let mut buf = vec![0u8; codec::MAX_PACKET_SIZE];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ExchangeError::timeout(&self.address))?
            .map_err(|e| ExchangeError::connection(&self.address, e))?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn tcp_roundtrip(
        &self,
        server: SocketAddr,
        payload: &[u8],
    ) -> Result<Vec<u8>, ExchangeError> {
        tokio::time::timeout(self.timeout, async {
            let mut stream = TcpStream::connect(server)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;
            let len = u16::try_from(payload.len())
                .map_err(|e| ExchangeError::protocol(&self.address, e))?;
            stream
                .write_all(&len.to_be_bytes())
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;
            stream
                .write_all(payload)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;

            let mut len_buf = [0u8; 2];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;
            let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| ExchangeError::connection(&self.address, e))?;
            Ok(buf)
        })
        .await
        .map_err(|_| ExchangeError::timeout(&self.address))?
    }

    /// Seal, send, open. `over_tcp` retries after a truncated answer.
    async fn exchange_sealed(
        &self,
        state: &ClientState,
        req_bytes: &[u8],
        over_tcp: bool,
    ) -> Result<Message, ExchangeError> {
        let (sealed, client_nonce) = seal_query(
            &state.cipher,
            &state.cert.client_magic,
            &self.client_pk,
            req_bytes,
        )
        .map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let raw = if over_tcp {
            self.tcp_roundtrip(self.stamp.addr, &sealed).await?
        } else {
            self.udp_roundtrip(self.stamp.addr, &sealed).await?
        };

        let plain = open_response(&state.cipher, &client_nonce, &raw)
            .map_err(|e| ExchangeError::protocol(&self.address, e))?;
        codec::decode(&plain).map_err(|e| ExchangeError::protocol(&self.address, e))
    }
}

#[async_trait]
impl Exchanger for DnsCryptUpstream {
    async fn exchange(&self, req: &Message) -> Result<Message, ExchangeError> {
        let state = {
            let mut slot = self.state.lock().await;
            if slot.as_ref().map_or(true, |s| !s.cert.is_valid_now()) {
                let cert = self.fetch_cert().await?;
                debug!(address = %self.address, serial = cert.serial, "fetched dnscrypt certificate");
                let cipher =
                    CipherBox::new(cert.es_version, &cert.resolver_pk, &self.client_secret);
                *slot = Some(std::sync::Arc::new(ClientState { cert, cipher }));
            }
            std::sync::Arc::clone(slot.as_ref().expect("state populated above"))
        };

        let req_bytes =
            codec::encode(req).map_err(|e| ExchangeError::protocol(&self.address, e))?;

        let mut resp = self.exchange_sealed(&state, &req_bytes, false).await?;
        if resp.truncated() {
            debug!(address = %self.address, "truncated dnscrypt response, retrying over tcp");
            resp = self.exchange_sealed(&state, &req_bytes, true).await?;
        }
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
    use crate::bootstrap::Bootstrap;
    use std::sync::Arc;

    #[test]
    fn should_use_provider_name_as_address() {
        let stamp = DnsCryptStamp {
            addr: "198.51.100.4:443".parse().unwrap(),
            provider_name: "2.dnscrypt-cert.example.com".into(),
            provider_pk: [1; 32],
        };
        let bootstrap = Arc::new(Bootstrap::new(Vec::new(), Duration::from_secs(1)));
        let opts = UpstreamOptions::new(bootstrap);
        let upstream = DnsCryptUpstream::new(stamp, &opts);
        assert_eq!(upstream.address(), "dnscrypt://2.dnscrypt-cert.example.com");
    }
}
