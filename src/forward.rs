//! TCP forwarder (C9): a plain port-forward in front of the tunnel, for
//! callers that want a single fixed destination instead of general SOCKS5
//! routing. No negotiation: every accepted connection dials
//! `forward_target` through the connection manager and bridges it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::bridge::BufferPool;
use crate::error::StartupError;
use crate::manager::ConnectionManager;

/// Accepts either a bare `host:port` or a URL (`config.forward_target`
/// may be given as either per spec §3) and reduces it to `host:port`,
/// which is all [`ConnectionManager::connect`] understands.
pub fn normalize_target(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(url) if url.host_str().is_some() => {
            let host = url.host_str().unwrap();
            let port = url.port_or_known_default().unwrap_or(80);
            format!("{host}:{port}")
        }
        _ => raw.to_string(),
    }
}

pub struct ForwardServer {
    listen_addr: SocketAddr,
    forward_target: String,
    manager: Arc<ConnectionManager>,
    pool: Arc<BufferPool>,
}

impl ForwardServer {
    pub fn new(
        listen_addr: SocketAddr,
        forward_target: String,
        manager: Arc<ConnectionManager>,
        buffer_size: usize,
    ) -> Self {
        Self {
            listen_addr,
            forward_target: normalize_target(&forward_target),
            manager,
            pool: BufferPool::new(buffer_size),
        }
    }

    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), StartupError> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| StartupError::Bind(self.listen_addr, e))?;
        tracing::info!(addr = %self.listen_addr, target = %self.forward_target, "TCP forwarder listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let manager = self.manager.clone();
                    let pool = self.pool.clone();
                    let target = self.forward_target.clone();
                    tokio::spawn(async move {
                        match manager.connect(&target).await {
                            Ok(tunneled) => crate::bridge::bridge(socket, tunneled, pool).await,
                            Err(e) => tracing::warn!(%peer, error = %e, "forward dial failed"),
                        }
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("forwarder shutting down");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_target_passes_host_port_through() {
        assert_eq!(normalize_target("example.internal:443"), "example.internal:443");
    }

    #[test]
    fn normalize_target_reduces_a_url_to_host_port() {
        assert_eq!(normalize_target("http://example.com:8080/path"), "example.com:8080");
    }

    #[test]
    fn normalize_target_falls_back_to_a_default_port() {
        assert_eq!(normalize_target("http://example.com/path"), "example.com:80");
    }
}
