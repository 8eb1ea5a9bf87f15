//! Connection manager (C6): turns a bare `host:port` into a live tunneled
//! [`Stream`], running the CREATE handshake and instantiating the
//! appropriate duplex adapter, optionally heartbeat-wrapped.

use std::sync::Arc;

use rand::Rng;
use tokio::io::AsyncReadExt;

use crate::config::DuplexMode;
use crate::duplex::{body_reader, mode_marker, BodyReader, FullDuplexStream, HalfDuplexStream, Stream};
use crate::error::TunnelError;
use crate::heartbeat::HeartbeatStream;
use crate::protocol::{build_create, decode_frame, Action, Message};
use crate::transport::HttpTransport;

/// 8-character alphanumeric id, unique among live streams with
/// probability `1 - 62^-8` (spec §8 invariant 4).
pub fn random_id() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<HttpTransport>,
    mode: DuplexMode,
    offset: usize,
    redirect: String,
    disable_heartbeat: bool,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<HttpTransport>,
        mode: DuplexMode,
        offset: usize,
        redirect: String,
        disable_heartbeat: bool,
    ) -> Self {
        assert_ne!(mode, DuplexMode::Auto, "connection manager needs a resolved mode");
        Self {
            transport,
            mode,
            offset,
            redirect,
            disable_heartbeat,
        }
    }

    /// Dials `address` (`host:port`) through the tunnel: generates an id,
    /// sends CREATE, validates the CREATE-ACK, and returns a ready-to-use
    /// stream (spec §4.6).
    pub async fn connect(&self, address: &str) -> Result<Box<dyn Stream>, TunnelError> {
        let (host, port) = split_host_port(address)?;
        let id = random_id();
        let create = build_create(&id, &host, port, &self.redirect);
        let create_bytes = crate::protocol::encode_frame(&create.encode());

        let stream: Box<dyn Stream> = if self.mode == DuplexMode::Full {
            let (outbound, response) = self
                .transport
                .open_streaming(mode_marker(true), create_bytes)
                .await
                .map_err(|e| TunnelError::HostUnreachable(e.to_string()))?;
            let mut reader = body_reader(response);
            self.skip_offset(&mut reader).await?;
            self.validate_create_ack(&mut reader).await?;
            Box::new(FullDuplexStream::new(id.clone(), self.redirect.clone(), outbound, reader))
        } else {
            let response = self
                .transport
                .open_persistent(mode_marker(false), create_bytes)
                .await
                .map_err(|e| TunnelError::HostUnreachable(e.to_string()))?;
            let mut reader = body_reader(response);
            self.skip_offset(&mut reader).await?;
            self.validate_create_ack(&mut reader).await?;
            Box::new(HalfDuplexStream::new(
                id.clone(),
                self.redirect.clone(),
                self.transport.clone(),
                reader,
            ))
        };

        let stream = if self.disable_heartbeat {
            stream
        } else {
            Box::new(HeartbeatStream::new(stream, id, self.redirect.clone()))
        };

        Ok(stream)
    }

    /// Discards the handler's preamble bytes, if any, at the start of the
    /// response body (some targets emit a fixed banner before the first
    /// real frame; see the auto-probe, C7).
    async fn skip_offset(&self, reader: &mut BodyReader) -> Result<(), TunnelError> {
        if self.offset == 0 {
            return Ok(());
        }
        let mut discard = vec![0u8; self.offset];
        reader
            .read_exact(&mut discard)
            .await
            .map_err(|e| TunnelError::DialFailed(format!("failed to skip response offset: {e}")))
    }

    async fn validate_create_ack(&self, reader: &mut BodyReader) -> Result<(), TunnelError> {
        let plain = decode_frame(reader).await.map_err(|e| {
            TunnelError::HostUnreachable(format!(
                "failed to read CREATE-ACK, target may have load balancing: {e}"
            ))
        })?;
        let msg = Message::decode(&plain).map_err(|e| TunnelError::HostUnreachable(e.to_string()))?;
        if msg.action().ok() != Some(Action::Create) {
            return Err(TunnelError::create_rejected(0xFE));
        }
        let status = msg.require("s").map_err(|e| TunnelError::HostUnreachable(e.to_string()))?;
        match status.first() {
            Some(0x00) => Ok(()),
            other => Err(TunnelError::create_rejected(other.copied().unwrap_or(0xFF))),
        }
    }
}

fn split_host_port(address: &str) -> Result<(String, u16), TunnelError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| TunnelError::Socks5(format!("invalid address {address:?}, expected host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| TunnelError::Socks5(format!("invalid port in address {address:?}")))?;
    Ok((host.to_string(), port))
}
