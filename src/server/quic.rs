//! DNS-over-QUIC listener (RFC 9250).

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ListenError, Result};
use crate::resolver::{Proto, Resolver};

/// Build a QUIC endpoint from a prepared rustls server config.
pub(crate) fn make_endpoint(
    addr: SocketAddr,
    tls: Arc<rustls::ServerConfig>,
) -> Result<quinn::Endpoint> {
    let crypto =
        QuicServerConfig::try_from(tls).map_err(|e| ListenError::Quic(e.to_string()))?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    quinn::Endpoint::server(server_config, addr)
        .map_err(|e| ListenError::Bind { addr, source: e }.into())
}

/// Accept QUIC connections and answer one query per bidirectional
/// stream.
pub async fn serve(
    endpoint: quinn::Endpoint,
    resolver: Arc<Resolver>,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
) {
    loop {
        let incoming = tokio::select! {
            biased;

            () = shutdown.cancelled() => {
                endpoint.close(0u32.into(), b"shutting down");
                return;
            }

            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => return,
            },
        };

        let resolver = Arc::clone(&resolver);
        let workers = workers.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(err) => {
                    debug!(%err, "quic handshake failed");
                    return;
                }
            };
            let peer = connection.remote_address();

            loop {
                let (send, recv) = tokio::select! {
                    biased;

                    () = shutdown.cancelled() => return,

                    stream = connection.accept_bi() => match stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            debug!(%err, "quic connection closed");
                            return;
                        }
                    },
                };

                let _permit = match &workers {
                    Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => return,
                    },
                    None => None,
                };

                let resolver = Arc::clone(&resolver);
                tokio::spawn(async move {
                    let _permit = _permit;
                    handle_stream(send, recv, peer, resolver).await;
                });
            }
        });
    }
}

/// One DoQ query: a length-prefixed message on a bidirectional stream.
async fn handle_stream(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
) {
    let framed = match recv.read_to_end(2 + crate::dns::codec::MAX_PACKET_SIZE).await {
        Ok(framed) => framed,
        Err(err) => {
            debug!(%peer, %err, "quic stream read failed");
            return;
        }
    };
    if framed.len() < 2 {
        return;
    }
    let declared = usize::from(u16::from_be_bytes([framed[0], framed[1]]));
    let body = &framed[2..];
    if declared != body.len() {
        debug!(%peer, "quic stream length prefix mismatch");
        return;
    }

    let Some(response) = resolver.handle_bytes(body, peer, Proto::Quic).await else {
        return;
    };

    let mut out = Vec::with_capacity(2 + response.len());
    out.extend_from_slice(&(response.len() as u16).to_be_bytes());
    out.extend_from_slice(&response);
    if send.write_all(&out).await.is_err() {
        debug!(%peer, "quic stream write failed");
        return;
    }
    let _ = send.finish();
}
