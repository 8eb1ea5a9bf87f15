//! Duplex engine (C4): full- and half-duplex adapters over the HTTP
//! transport, unified behind a single `Stream` capability so the
//! connection manager, heartbeat wrapper, and bridge never need to know
//! which one they're holding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;

use crate::error::TunnelError;
use crate::protocol::{build_data, build_delete, decode_frame, encode_frame, Action, Message};
use crate::transport::{BodySender, HttpTransport, HEADER_VALUE_FULL, HEADER_VALUE_HALF};

fn io_err(e: reqwest::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e)
}

type BoxedByteStream = std::pin::Pin<Box<dyn futures::Stream<Item = std::io::Result<bytes::Bytes>> + Send>>;
pub type BodyReader = StreamReader<BoxedByteStream, bytes::Bytes>;

/// Wraps a streaming response body as an `AsyncRead`. The connection
/// manager reads the offset preamble and CREATE-ACK frame off this same
/// reader before handing it to an adapter, since a `reqwest::Response`
/// body can only be consumed once.
pub fn body_reader(response: reqwest::Response) -> BodyReader {
    use futures::TryStreamExt;
    let stream: BoxedByteStream = Box::pin(response.bytes_stream().map_err(io_err));
    StreamReader::new(stream)
}

/// Unified capability exposed by both duplex adapters (and, transparently,
/// the heartbeat wrapper around either one). `write_user` carries caller
/// bytes; `write_raw` carries a fully-framed message (heartbeat) that must
/// not be mistaken for user data by anything counting bytes written.
#[async_trait]
pub trait Stream: Send + Sync {
    async fn read(&self) -> Result<Option<Vec<u8>>, TunnelError>;
    async fn write_user(&self, data: &[u8]) -> Result<(), TunnelError>;
    async fn write_raw(&self, frame: Vec<u8>) -> Result<(), TunnelError>;
    async fn close(&self) -> Result<(), TunnelError>;
}

/// One long-lived chunked request (outbound) and response (inbound),
/// sharing a single HTTP pair for the whole stream lifetime.
pub struct FullDuplexStream {
    id: String,
    redirect: String,
    outbound: BodySender,
    inbound: Mutex<BodyReader>,
    read_buf: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl FullDuplexStream {
    pub fn new(id: String, redirect: String, outbound: BodySender, inbound: BodyReader) -> Self {
        Self {
            id,
            redirect,
            outbound,
            inbound: Mutex::new(inbound),
            read_buf: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Stream for FullDuplexStream {
    async fn read(&self) -> Result<Option<Vec<u8>>, TunnelError> {
        {
            let mut buf = self.read_buf.lock().await;
            if !buf.is_empty() {
                return Ok(Some(std::mem::take(&mut *buf)));
            }
        }

        let mut reader = self.inbound.lock().await;
        let plain = match decode_frame(&mut *reader).await {
            Ok(plain) => plain,
            Err(crate::protocol::FrameError::Io(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e.into()),
        };
        let msg = Message::decode(&plain)?;
        match msg.action()? {
            Action::Data => Ok(Some(msg.require("dt")?.to_vec())),
            Action::Delete => Ok(None),
            other => Err(TunnelError::Socks5(format!("unexpected action on read: {other:?}"))),
        }
    }

    async fn write_user(&self, data: &[u8]) -> Result<(), TunnelError> {
        let msg = build_data(&self.id, data, &self.redirect);
        self.write_raw(msg.encode()).await
    }

    async fn write_raw(&self, plain: Vec<u8>) -> Result<(), TunnelError> {
        self.outbound.send(encode_frame(&plain)).await
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let msg = build_delete(&self.id, &self.redirect);
        let _ = self.outbound.send(encode_frame(&msg.encode())).await;
        let mut reader = self.inbound.lock().await;
        let mut sink = [0u8; 0];
        let _ = reader.read(&mut sink).await;
        Ok(())
    }
}

/// A long-lived response reader, with each write performed as its own
/// short-lived HTTP request. Writers are serialized: at most one
/// HTTP write-request is in flight per stream (spec §5).
pub struct HalfDuplexStream {
    id: String,
    redirect: String,
    transport: Arc<HttpTransport>,
    inbound: Mutex<BodyReader>,
    read_buf: Mutex<Vec<u8>>,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl HalfDuplexStream {
    pub fn new(id: String, redirect: String, transport: Arc<HttpTransport>, inbound: BodyReader) -> Self {
        Self {
            id,
            redirect,
            transport,
            inbound: Mutex::new(inbound),
            read_buf: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Stream for HalfDuplexStream {
    async fn read(&self) -> Result<Option<Vec<u8>>, TunnelError> {
        loop {
            {
                let mut buf = self.read_buf.lock().await;
                if !buf.is_empty() {
                    return Ok(Some(std::mem::take(&mut *buf)));
                }
            }

            let mut reader = self.inbound.lock().await;
            let plain = match decode_frame(&mut *reader).await {
                Ok(plain) => plain,
                Err(crate::protocol::FrameError::Io(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e.into()),
            };
            drop(reader);
            let msg = Message::decode(&plain)?;
            match msg.action()? {
                Action::Data => return Ok(Some(msg.require("dt")?.to_vec())),
                Action::Delete => return Ok(None),
                // A spurious wake-up: loop back around for the next frame
                // rather than delivering zero bytes to the caller.
                Action::Heartbeat => continue,
                other => return Err(TunnelError::Socks5(format!("unexpected action on read: {other:?}"))),
            }
        }
    }

    async fn write_user(&self, data: &[u8]) -> Result<(), TunnelError> {
        let msg = build_data(&self.id, data, &self.redirect);
        self.write_raw(msg.encode()).await
    }

    async fn write_raw(&self, plain: Vec<u8>) -> Result<(), TunnelError> {
        let _guard = self.write_lock.lock().await;
        let frame = encode_frame(&plain);
        self.transport.send_once(HEADER_VALUE_HALF, frame).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let msg = build_delete(&self.id, &self.redirect);
        let _guard = self.write_lock.lock().await;
        let _ = self
            .transport
            .send_once(HEADER_VALUE_HALF, encode_frame(&msg.encode()))
            .await;
        Ok(())
    }
}

/// The `X-Suo5` header value to advertise while opening a stream.
pub fn mode_marker(full: bool) -> &'static str {
    if full {
        HEADER_VALUE_FULL
    } else {
        HEADER_VALUE_HALF
    }
}
