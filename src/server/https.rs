//! DNS-over-HTTPS listener (RFC 8484).
//!
//! HTTP/1.1 and HTTP/2 are served with hyper over the TLS accept loop;
//! HTTP/3 runs over its own QUIC endpoint when enabled. Queries arrive
//! as `application/dns-message` POST bodies or as base64url in the
//! `?dns=` query parameter.

use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, Bytes};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::resolver::{Proto, Resolver};
use crate::upstream::https::DNS_MESSAGE_TYPE;

/// Accept loop for DoH over TCP+TLS.
pub async fn serve(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    acceptor: TlsAcceptor,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;

            () = shutdown.cancelled() => return,

            result = listener.accept() => match result {
                Ok(r) => r,
                Err(err) => {
                    debug!(%err, "https accept failed");
                    continue;
                }
            },
        };

        let resolver = Arc::clone(&resolver);
        let acceptor = acceptor.clone();
        let workers = workers.clone();
        tokio::spawn(async move {
            let tls = match acceptor.accept(stream).await {
                Ok(tls) => tls,
                Err(err) => {
                    debug!(%peer, %err, "https tls handshake failed");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                let resolver = Arc::clone(&resolver);
                let workers = workers.clone();
                async move {
                    let _permit = match &workers {
                        Some(semaphore) => {
                            match Arc::clone(semaphore).acquire_owned().await {
                                Ok(permit) => Some(permit),
                                Err(_) => return plain_status(StatusCode::SERVICE_UNAVAILABLE),
                            }
                        }
                        None => None,
                    };
                    handle_request(req, peer, resolver).await
                }
            });

            let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
            if let Err(err) = builder
                .serve_connection(TokioIo::new(tls), service)
                .await
            {
                debug!(%peer, %err, "https connection ended with error");
            }
        });
    }
}

/// One DoH request over any HTTP version.
async fn handle_request(
    req: Request<Incoming>,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let query = match extract_query(&req) {
        QueryPayload::Inline(bytes) => bytes,
        QueryPayload::Body => {
            let body = req.into_body().collect().await?.to_bytes();
            body.to_vec()
        }
        QueryPayload::Invalid(status) => return plain_status(status),
    };

    match resolver.handle_bytes(&query, peer, Proto::Https).await {
        Some(response) => Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, DNS_MESSAGE_TYPE)
            .body(Full::new(Bytes::from(response)))
            .expect("static response parts are valid")),
        None => plain_status(StatusCode::BAD_REQUEST),
    }
}

enum QueryPayload {
    /// Decoded from the `?dns=` parameter.
    Inline(Vec<u8>),
    /// Read the POST body.
    Body,
    Invalid(StatusCode),
}

fn extract_query(req: &Request<Incoming>) -> QueryPayload {
    if req.method() == hyper::Method::GET {
        let Some(encoded) = req
            .uri()
            .query()
            .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("dns=")))
        else {
            return QueryPayload::Invalid(StatusCode::BAD_REQUEST);
        };
        return match URL_SAFE_NO_PAD.decode(encoded) {
            Ok(bytes) => QueryPayload::Inline(bytes),
            Err(_) => QueryPayload::Invalid(StatusCode::BAD_REQUEST),
        };
    }

    if req.method() == hyper::Method::POST {
        let content_type = req
            .headers()
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if content_type != DNS_MESSAGE_TYPE {
            return QueryPayload::Invalid(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }
        return QueryPayload::Body;
    }

    QueryPayload::Invalid(StatusCode::METHOD_NOT_ALLOWED)
}

fn plain_status(status: StatusCode) -> Result<Response<Full<Bytes>>, hyper::Error> {
    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .expect("static response parts are valid"))
}

/// DNS-over-HTTP/3: the same request handling over an h3 server
/// connection.
pub async fn serve_h3(
    endpoint: quinn::Endpoint,
    resolver: Arc<Resolver>,
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
        tokio::spawn(async move {
            let connection = match incoming.await {
                Ok(connection) => connection,
                Err(err) => {
                    debug!(%err, "h3 handshake failed");
                    return;
                }
            };
            let peer = connection.remote_address();

            let mut h3_conn = match h3::server::Connection::new(h3_quinn::Connection::new(
                connection,
            ))
            .await
            {
                Ok(conn) => conn,
                Err(err) => {
                    debug!(%peer, %err, "h3 connection setup failed");
                    return;
                }
            };

            loop {
                match h3_conn.accept().await {
                    Ok(Some((req, mut stream))) => {
                        let resolver = Arc::clone(&resolver);
                        tokio::spawn(async move {
                            // Only the `?dns=` form or a POST body; h3
                            // requests carry the body on the stream.
                            let query = if req.method() == http::Method::GET {
                                req.uri()
                                    .query()
                                    .and_then(|q| {
                                        q.split('&').find_map(|pair| pair.strip_prefix("dns="))
                                    })
                                    .and_then(|encoded| URL_SAFE_NO_PAD.decode(encoded).ok())
                            } else {
                                let mut body = Vec::new();
                                loop {
                                    match stream.recv_data().await {
                                        Ok(Some(mut chunk)) => {
                                            let bytes = chunk.copy_to_bytes(chunk.remaining());
                                            body.extend_from_slice(&bytes);
                                        }
                                        Ok(None) => break,
                                        Err(err) => {
                                            debug!(%peer, %err, "h3 body read failed");
                                            return;
                                        }
                                    }
                                }
                                Some(body)
                            };

                            let response = match query {
                                Some(query) => {
                                    resolver.handle_bytes(&query, peer, Proto::Https).await
                                }
                                None => None,
                            };

                            let (status, body) = match response {
                                Some(bytes) => (StatusCode::OK, Bytes::from(bytes)),
                                None => (StatusCode::BAD_REQUEST, Bytes::new()),
                            };
                            let head = http::Response::builder()
                                .status(status)
                                .header(http::header::CONTENT_TYPE, DNS_MESSAGE_TYPE)
                                .body(())
                                .expect("static response parts are valid");

                            if stream.send_response(head).await.is_ok() {
                                let _ = stream.send_data(body).await;
                            }
                            let _ = stream.finish().await;
                        });
                    }
                    Ok(None) => return,
                    Err(err) => {
                        debug!(%peer, %err, "h3 accept failed");
                        return;
                    }
                }
            }
        });
    }
}
