//! Bridging (shared by C8 and C9): copies bytes between an accepted local
//! TCP socket and a tunneled [`Stream`], using a shared, fixed-size
//! buffer pool to bound memory under load (spec §5, §9).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::duplex::Stream;

/// Local-socket write timeout: a client that stops reading must not pin a
/// tunneled stream open forever.
const LOCAL_WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// A pool of reusable `buffer_size`-byte buffers, shared across every
/// bridge the process runs, matching the reference implementation's
/// `sync.Pool` of read buffers.
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }
}

pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.free.lock().expect("buffer pool mutex poisoned").push(buf);
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Bridges `local` and `tunneled` with two independent copy loops. Either
/// side closing, erroring, or hitting EOF tears down both ends.
pub async fn bridge(local: TcpStream, tunneled: Box<dyn Stream>, pool: Arc<BufferPool>) {
    let tunneled: Arc<dyn Stream> = Arc::from(tunneled);
    let (mut local_rd, mut local_wr) = local.into_split();

    let upstream = {
        let tunneled = tunneled.clone();
        let mut buf = pool.acquire();
        async move {
            loop {
                let n = match local_rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if tunneled.write_user(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    };

    let downstream = {
        let tunneled = tunneled.clone();
        async move {
            loop {
                match tunneled.read().await {
                    Ok(Some(data)) => {
                        let wrote = tokio::time::timeout(LOCAL_WRITE_TIMEOUT, local_wr.write_all(&data)).await;
                        if !matches!(wrote, Ok(Ok(()))) {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            let _ = local_wr.shutdown().await;
        }
    };

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }

    let _ = tunneled.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_buffers_are_reused_rather_than_reallocated() {
        let pool = BufferPool::new(128);
        {
            let buf = pool.acquire();
            assert_eq!(buf.len(), 128);
        }
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 128);
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }
}
