//! TCP and TLS listener loops.
//!
//! Both transports share the same length-prefixed connection handler;
//! TLS only adds the handshake in front of it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::resolver::{log_io_error, Proto, Resolver};
use crate::upstream::udp::{read_prefixed, write_prefixed};

/// Connections are dropped after this long without a complete query.
const CONN_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Accept loop for plain TCP and for TLS (when `acceptor` is set).
pub async fn serve(
    listener: TcpListener,
    resolver: Arc<Resolver>,
    proto: Proto,
    acceptor: Option<TlsAcceptor>,
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
                    log_io_error(&err, "tcp accept failed", proto);
                    continue;
                }
            },
        };

        let resolver = Arc::clone(&resolver);
        let acceptor = acceptor.clone();
        let workers = workers.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => {
                        handle_connection(tls, peer, resolver, proto, workers, shutdown).await
                    }
                    Err(err) => {
                        debug!(%peer, %err, "tls handshake failed");
                    }
                },
                None => handle_connection(stream, peer, resolver, proto, workers, shutdown).await,
            }
        });
    }
}

/// Read length-prefixed queries in a loop until idle timeout, EOF, or
/// shutdown.
async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
    proto: Proto,
    workers: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let query = tokio::select! {
            biased;

            () = shutdown.cancelled() => return,

            result = tokio::time::timeout(CONN_IDLE_TIMEOUT, read_prefixed(&mut stream)) => {
                match result {
                    Ok(Ok(query)) => query,
                    Ok(Err(err)) => {
                        log_io_error(&err, "tcp read failed", proto);
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "connection idle, closing");
                        return;
                    }
                }
            }
        };

        let _permit = match &workers {
            Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => return,
            },
            None => None,
        };

        let Some(response) = resolver.handle_bytes(&query, peer, proto).await else {
            continue;
        };
        if let Err(err) = write_prefixed(&mut stream, &response).await {
            log_io_error(&err, "tcp write failed", proto);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::codec;
    use crate::testsupport::{test_query, test_resolver};
    use hickory_proto::op::ResponseCode;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn should_answer_length_prefixed_queries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(
            listener,
            test_resolver(),
            Proto::Tcp,
            None,
            None,
            shutdown.clone(),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = test_query("example.com.", 42);
        write_prefixed(&mut client, &codec::encode(&req).unwrap())
            .await
            .unwrap();

        let resp_bytes = read_prefixed(&mut client).await.unwrap();
        let resp = codec::decode(&resp_bytes).unwrap();
        assert_eq!(resp.id(), 42);
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);

        // The same connection serves a second query.
        let req = test_query("example.com.", 43);
        write_prefixed(&mut client, &codec::encode(&req).unwrap())
            .await
            .unwrap();
        let resp = codec::decode(&read_prefixed(&mut client).await.unwrap()).unwrap();
        assert_eq!(resp.id(), 43);

        shutdown.cancel();
    }
}
