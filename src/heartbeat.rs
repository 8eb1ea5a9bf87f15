//! Heartbeat wrapper (C5): decorates any [`Stream`] with a cooperative
//! keep-alive ticker. Every 5 seconds of outbound inactivity it emits a
//! HEARTBEAT frame via the wrapped stream's raw (non-DATA) write path,
//! so intermediaries don't idle-time the tunnel out. Resets whenever the
//! caller writes user data; stops on close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::duplex::Stream;
use crate::error::TunnelError;
use crate::protocol::build_heartbeat;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub struct HeartbeatStream {
    inner: Arc<dyn Stream>,
    reset: Arc<Notify>,
    stop: Arc<AtomicBool>,
    ticker: Option<JoinHandle<()>>,
}

impl HeartbeatStream {
    pub fn new(inner: Box<dyn Stream>, id: String, redirect: String) -> Self {
        let inner: Arc<dyn Stream> = Arc::from(inner);
        let reset = Arc::new(Notify::new());
        let stop = Arc::new(AtomicBool::new(false));

        let ticker = {
            let inner = inner.clone();
            let reset = reset.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    let sleep = tokio::time::sleep(HEARTBEAT_INTERVAL);
                    tokio::select! {
                        _ = sleep => {}
                        _ = reset.notified() => continue,
                    }
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    let msg = build_heartbeat(&id, &redirect);
                    if inner.write_raw(msg.encode()).await.is_err() {
                        break;
                    }
                }
            })
        };

        Self {
            inner,
            reset,
            stop,
            ticker: Some(ticker),
        }
    }
}

impl Drop for HeartbeatStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.reset.notify_one();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl Stream for HeartbeatStream {
    async fn read(&self) -> Result<Option<Vec<u8>>, TunnelError> {
        self.inner.read().await
    }

    async fn write_user(&self, data: &[u8]) -> Result<(), TunnelError> {
        let result = self.inner.write_user(data).await;
        self.reset.notify_one();
        result
    }

    async fn write_raw(&self, frame: Vec<u8>) -> Result<(), TunnelError> {
        self.inner.write_raw(frame).await
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.stop.store(true, Ordering::SeqCst);
        self.reset.notify_one();
        self.inner.close().await
    }
}
