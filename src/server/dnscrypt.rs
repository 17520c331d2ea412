//! DNSCrypt listener: certificate serving plus encrypted queries.
//!
//! Unencrypted TXT queries for the provider name get the signed
//! certificate; everything else is expected to start with the
//! certificate's client magic and decrypt into a regular query that
//! runs through the normal pipeline.

use std::net::SocketAddr;
use std::sync::Arc;

use crypto_box::SecretKey;
use ed25519_dalek::SigningKey;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{RData, Record, RecordType};
use rand::RngCore;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::buffer::BufferPool;
use crate::dns::{codec, message};
use crate::dnscrypt::{
    open_query, seal_response, unix_now_u32, Cert, CipherBox, EsVersion,
};
use crate::resolver::{log_io_error, Proto, Resolver};
use crate::upstream::udp::{read_prefixed, write_prefixed};

/// TTL on the certificate TXT answer.
const CERT_TTL: u32 = 600;

/// Certificates are issued for one year; rotation is an operator
/// concern.
const CERT_VALIDITY_SECS: u32 = 365 * 24 * 3600;

/// Server-side DNSCrypt state shared by the UDP and TCP listeners.
pub struct DnsCryptServer {
    provider_name: String,
    secret: SecretKey,
    es_version: EsVersion,
    client_magic: [u8; 8],
    cert_bytes: Vec<u8>,
}

impl DnsCryptServer {
    /// Build the server identity and sign a fresh certificate.
    pub fn new(provider_name: &str, secret: SecretKey, signing: &SigningKey) -> Self {
        let mut client_magic = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut client_magic);

        let es_version = EsVersion::XChaCha20Poly1305;
        let now = unix_now_u32();
        let resolver_pk = *secret.public_key().as_bytes();
        let cert_bytes = Cert::build(
            es_version,
            &resolver_pk,
            &client_magic,
            now,
            now.saturating_sub(60),
            now.saturating_add(CERT_VALIDITY_SECS),
            signing,
        );
        info!(provider_name, serial = now, "dnscrypt certificate issued");

        Self {
            provider_name: provider_name.trim_end_matches('.').to_lowercase(),
            secret,
            es_version,
            client_magic,
            cert_bytes,
        }
    }

    /// Process one DNSCrypt datagram or stream message.
    async fn handle_packet(
        &self,
        resolver: &Arc<Resolver>,
        bytes: &[u8],
        peer: SocketAddr,
    ) -> Option<Vec<u8>> {
        if bytes.len() >= 8 && bytes[..8] == self.client_magic {
            return self.handle_encrypted(resolver, bytes, peer).await;
        }
        self.handle_cert_query(bytes)
    }

    async fn handle_encrypted(
        &self,
        resolver: &Arc<Resolver>,
        bytes: &[u8],
        peer: SocketAddr,
    ) -> Option<Vec<u8>> {
        let opened = match open_query(self.es_version, &self.secret, &self.client_magic, bytes) {
            Ok(opened) => opened,
            Err(err) => {
                debug!(%peer, %err, "undecryptable dnscrypt query");
                return None;
            }
        };

        let response = resolver
            .handle_bytes(&opened.query, peer, Proto::DnsCrypt)
            .await?;

        let cipher = CipherBox::new(self.es_version, &opened.client_pk, &self.secret);
        match seal_response(&cipher, &opened.client_nonce, &response) {
            Ok(sealed) => Some(sealed),
            Err(err) => {
                debug!(%peer, %err, "failed to seal dnscrypt response");
                None
            }
        }
    }

    /// A plaintext TXT query for the provider name gets the certificate.
    fn handle_cert_query(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let req = codec::decode(bytes).ok()?;
        let q = req.queries().first()?;
        if q.query_type() != RecordType::TXT {
            return None;
        }
        let qname = q.name().to_utf8().to_lowercase();
        if qname.trim_end_matches('.') != self.provider_name {
            return None;
        }

        let mut resp = message::reply_to(&req, ResponseCode::NoError);
        // TXT strings carry at most 255 bytes; the 124-byte cert fits in
        // one.
        let txt = TXT::from_bytes(vec![self.cert_bytes.as_slice()]);
        resp.add_answer(Record::from_rdata(
            q.name().clone(),
            CERT_TTL,
            RData::TXT(txt),
        ));
        codec::encode(&resp).ok()
    }
}

/// UDP listener loop for DNSCrypt.
pub async fn serve_udp(
    socket: Arc<UdpSocket>,
    server: Arc<DnsCryptServer>,
    resolver: Arc<Resolver>,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    pool: BufferPool,
) {
    loop {
        let mut buf = pool.get();
        let (len, peer) = tokio::select! {
            biased;

            () = shutdown.cancelled() => return,

            result = socket.recv_from(buf.as_mut_slice()) => match result {
                Ok(r) => r,
                Err(err) => {
                    log_io_error(&err, "dnscrypt udp receive failed", Proto::DnsCrypt);
                    continue;
                }
            },
        };

        let permit = match &workers {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!("worker pool saturated, dropping dnscrypt datagram");
                    continue;
                }
            },
            None => None,
        };

        let socket = Arc::clone(&socket);
        let server = Arc::clone(&server);
        let resolver = Arc::clone(&resolver);
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(response) = server
                .handle_packet(&resolver, &buf.as_slice()[..len], peer)
                .await
            {
                if let Err(err) = socket.send_to(&response, peer).await {
                    log_io_error(&err, "dnscrypt udp send failed", Proto::DnsCrypt);
                }
            }
        });
    }
}

/// TCP listener loop for DNSCrypt (length-prefixed messages).
pub async fn serve_tcp(
    listener: TcpListener,
    server: Arc<DnsCryptServer>,
    resolver: Arc<Resolver>,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
) {
    loop {
        let (mut stream, peer) = tokio::select! {
            biased;

            () = shutdown.cancelled() => return,

            result = listener.accept() => match result {
                Ok(r) => r,
                Err(err) => {
                    log_io_error(&err, "dnscrypt tcp accept failed", Proto::DnsCrypt);
                    continue;
                }
            },
        };

        let server = Arc::clone(&server);
        let resolver = Arc::clone(&resolver);
        let workers = workers.clone();
        tokio::spawn(async move {
            while let Ok(query) = read_prefixed(&mut stream).await {
                let _permit = match &workers {
                    Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };
                let Some(response) = server.handle_packet(&resolver, &query, peer).await else {
                    continue;
                };
                if write_prefixed(&mut stream, &response).await.is_err() {
                    return;
                }
            }
        });
    }
}
