//! The UDP listener loop.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::buffer::BufferPool;
use crate::resolver::{log_io_error, Proto, Resolver};

/// Read datagrams until shutdown, dispatching each to a worker task.
///
/// When the worker semaphore is exhausted the datagram is dropped: UDP
/// clients retransmit, and dropping is the backpressure mechanism.
pub async fn serve(
    socket: Arc<UdpSocket>,
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
                    log_io_error(&err, "udp receive failed", Proto::Udp);
                    continue;
                }
            },
        };

        let permit = match &workers {
            Some(semaphore) => match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!("worker pool saturated, dropping datagram");
                    continue;
                }
            },
            None => None,
        };

        let socket = Arc::clone(&socket);
        let resolver = Arc::clone(&resolver);
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(response) = resolver
                .handle_bytes(&buf.as_slice()[..len], peer, Proto::Udp)
                .await
            {
                if let Err(err) = socket.send_to(&response, peer).await {
                    log_io_error(&err, "udp send failed", Proto::Udp);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport::test_resolver;
    use std::time::Duration;

    #[tokio::test]
    async fn should_stop_on_shutdown() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let resolver = test_resolver();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(serve(
            socket,
            resolver,
            None,
            shutdown.clone(),
            BufferPool::new(2),
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener exits on shutdown")
            .unwrap();
    }
}
