//! TCP Receiver
//!
//! Accepts peer connections and hands each request frame to the provider's
//! dispatch task, writing back whatever response it produces.
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::frames::{read_frame, write_frame};
use crate::error::{ClusterError, Result};

/// A request with a channel to send the response back
pub struct TcpRequest {
    pub data: Vec<u8>,
    pub peer_addr: SocketAddr,
    pub response_tx: oneshot::Sender<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct ReceiverStats {
    pub messages_received: AtomicU64,
    pub receive_errors: AtomicU64,
}

impl ReceiverStats {
    pub fn freeze(&self) -> FrozenReceiverStats {
        FrozenReceiverStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrozenReceiverStats {
    pub messages_received: u64,
    pub receive_errors: u64,
}

/// TCP request receiver
pub struct TcpReceiver {
    pub local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    stats: Arc<ReceiverStats>,
    request_tx: mpsc::Sender<TcpRequest>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpReceiver {
    pub async fn new(bind_addr: SocketAddr, request_tx: mpsc::Sender<TcpRequest>) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            ClusterError::ProviderInit(format!("Socket creation failed on {}: {}", bind_addr, e))
        })?;
        let local_addr = listener.local_addr().map_err(|e| {
            ClusterError::ProviderInit(format!("Socket creation failed on {}: {}", bind_addr, e))
        })?;

        Ok(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            stats: Arc::new(ReceiverStats::default()),
            request_tx,
            task: Mutex::new(None),
        })
    }

    /// Start the accept loop. Calling it again has no effect.
    pub fn start(&self) {
        let Some(listener) = self.listener.lock().take() else {
            return;
        };
        let stats = self.stats.clone();
        let request_tx = self.request_tx.clone();
        let local_addr = self.local_addr;

        let handle = tokio::spawn(async move {
            loop {
                let (mut stream, peer_addr) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("TCP accept failed on {}: {}", local_addr, e);
                        continue;
                    }
                };

                let tx = request_tx.clone();
                let stats = stats.clone();
                tokio::spawn(async move {
                    let data = match read_frame(&mut stream).await {
                        Ok(data) => data,
                        Err(e) => {
                            stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                            warn!("Dropping connection from {}: {}", peer_addr, e);
                            return;
                        }
                    };
                    stats.messages_received.fetch_add(1, Ordering::Relaxed);

                    let (response_tx, response_rx) = oneshot::channel();
                    let request = TcpRequest {
                        data,
                        peer_addr,
                        response_tx,
                    };
                    if tx.send(request).await.is_err() {
                        debug!("Request handler is gone; closing connection from {}", peer_addr);
                        return;
                    }

                    match response_rx.await {
                        Ok(response) => {
                            if let Err(e) = write_frame(&mut stream, &response).await {
                                warn!("Failed to write response to {}: {}", peer_addr, e);
                            }
                        }
                        Err(_) => debug!("Handler dropped response channel for {}", peer_addr),
                    }
                });
            }
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop accepting connections and release the listener
    pub fn stop(&self) {
        self.listener.lock().take();
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }

    pub fn get_stats(&self) -> FrozenReceiverStats {
        self.stats.freeze()
    }
}

impl Drop for TcpReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::{timeout, Duration};

    use super::*;

    fn any_local() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test]
    async fn test_receiver_creation() {
        let (tx, _rx) = mpsc::channel(16);
        let receiver = TcpReceiver::new(any_local(), tx).await.unwrap();
        assert_ne!(receiver.local_addr.port(), 0);
        assert_eq!(receiver.get_stats().messages_received, 0);
    }

    #[tokio::test]
    async fn test_bind_conflict_is_provider_init() {
        let (tx, _rx) = mpsc::channel(16);
        let first = TcpReceiver::new(any_local(), tx.clone()).await.unwrap();
        let second = TcpReceiver::new(first.local_addr, tx).await;
        assert!(matches!(second, Err(ClusterError::ProviderInit(_))));
    }

    #[tokio::test]
    async fn test_request_response() {
        let (tx, mut rx) = mpsc::channel(16);
        let receiver = TcpReceiver::new(any_local(), tx).await.unwrap();
        receiver.start();

        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let mut reply = request.data.clone();
                reply.reverse();
                let _ = request.response_tx.send(reply);
            }
        });

        let mut stream = TcpStream::connect(receiver.local_addr).await.unwrap();
        write_frame(&mut stream, b"abc").await.unwrap();
        let response = timeout(Duration::from_secs(1), read_frame(&mut stream))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response, b"cba");
        assert_eq!(receiver.get_stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_bad_prefix_counts_error() {
        let (tx, _rx) = mpsc::channel(16);
        let receiver = TcpReceiver::new(any_local(), tx).await.unwrap();
        receiver.start();

        let mut stream = TcpStream::connect(receiver.local_addr).await.unwrap();
        stream.write_all(&[0xff, 0xff, 0xff, 0xff]).await.unwrap();
        drop(stream);

        timeout(Duration::from_secs(1), async {
            while receiver.get_stats().receive_errors == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let (tx, _rx) = mpsc::channel(16);
        let receiver = TcpReceiver::new(any_local(), tx.clone()).await.unwrap();
        let addr = receiver.local_addr;
        receiver.start();
        receiver.stop();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let again = TcpReceiver::new(addr, tx).await;
        assert!(again.is_ok());
    }
}
