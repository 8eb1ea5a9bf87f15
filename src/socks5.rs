//! SOCKS5 server (C8): RFC 1928 negotiation and CONNECT handling, plus
//! RFC 1929 username/password auth. Every accepted CONNECT either dials
//! directly (excluded domains, C10) or through the tunnel (C6), then
//! bridges the two sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::bridge::{bridge, BufferPool};
use crate::error::{StartupError, TunnelError};
use crate::exclude::ExclusionFilter;
use crate::manager::ConnectionManager;

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDR_TYPE_NOT_SUPPORTED: u8 = 0x08;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONN_REFUSED: u8 = 0x05;

#[derive(Clone)]
pub struct Socks5Auth {
    pub no_auth: bool,
    pub username: String,
    pub password: String,
}

impl Socks5Auth {
    fn user_pass_required(&self) -> bool {
        !self.no_auth && !self.username.is_empty()
    }
}

pub struct Socks5Server {
    listen_addr: SocketAddr,
    auth: Socks5Auth,
    manager: Arc<ConnectionManager>,
    exclude: ExclusionFilter,
    pool: Arc<BufferPool>,
    negotiation_timeout: Duration,
}

impl Socks5Server {
    pub fn new(
        listen_addr: SocketAddr,
        auth: Socks5Auth,
        manager: Arc<ConnectionManager>,
        exclude: ExclusionFilter,
        buffer_size: usize,
        negotiation_timeout: Duration,
    ) -> Self {
        Self {
            listen_addr,
            auth,
            manager,
            exclude,
            pool: BufferPool::new(buffer_size),
            negotiation_timeout,
        }
    }

    /// Binds the listener and serves connections until `shutdown` resolves.
    pub async fn serve(self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<(), StartupError> {
        let listener = TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| StartupError::Bind(self.listen_addr, e))?;
        tracing::info!(addr = %self.listen_addr, "SOCKS5 server listening");

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
                    let auth = self.auth.clone();
                    let manager = self.manager.clone();
                    let exclude = self.exclude.clone();
                    let pool = self.pool.clone();
                    let negotiation_timeout = self.negotiation_timeout;
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(socket, auth, manager, exclude, pool, negotiation_timeout).await
                        {
                            tracing::debug!(%peer, error = %e, "SOCKS5 connection ended");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    tracing::info!("SOCKS5 listener shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    auth: Socks5Auth,
    manager: Arc<ConnectionManager>,
    exclude: ExclusionFilter,
    pool: Arc<BufferPool>,
    negotiation_timeout: Duration,
) -> Result<(), TunnelError> {
    negotiate_method(&mut socket, &auth, negotiation_timeout).await?;
    let address = read_connect_request(&mut socket, negotiation_timeout).await?;

    let tunneled = if exclude.is_excluded(host_of(&address)) {
        tracing::debug!(%address, "excluded domain, dialing directly");
        match TcpStream::connect(&address).await {
            Ok(direct) => {
                write_reply(&mut socket, REP_SUCCEEDED).await?;
                return bridge_direct(socket, direct, pool).await;
            }
            Err(e) => {
                write_reply(&mut socket, reply_code_for_io_error(&e)).await?;
                return Err(TunnelError::Io(e));
            }
        }
    } else {
        match manager.connect(&address).await {
            Ok(stream) => stream,
            Err(e) => {
                write_reply(&mut socket, reply_code(&e)).await?;
                return Err(e);
            }
        }
    };

    write_reply(&mut socket, REP_SUCCEEDED).await?;
    bridge(socket, tunneled, pool).await;
    Ok(())
}

async fn bridge_direct(local: TcpStream, direct: TcpStream, pool: Arc<BufferPool>) -> Result<(), TunnelError> {
    // A direct connection is a bare TCP socket too, but `bridge` expects a
    // tunneled `Stream`; a plain TCP-to-TCP splice is simpler and avoids
    // the tunnel framing machinery entirely for excluded domains.
    let (mut lr, mut lw) = local.into_split();
    let (mut dr, mut dw) = direct.into_split();
    let mut buf1 = pool.acquire();
    let mut buf2 = pool.acquire();
    let up = async {
        loop {
            let n = match lr.read(&mut buf1).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if dw.write_all(&buf1[..n]).await.is_err() {
                break;
            }
        }
    };
    let down = async {
        loop {
            let n = match dr.read(&mut buf2).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if lw.write_all(&buf2[..n]).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = up => {}
        _ = down => {}
    }
    Ok(())
}

fn host_of(address: &str) -> &str {
    address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address)
}

/// Reads exactly `buf.len()` bytes, failing with `TunnelError::Io` (kind
/// `TimedOut`) if `deadline` elapses first. A stalled negotiation would
/// otherwise pin the spawned connection handler forever (spec §5: the
/// configured timeout applies to SOCKS5 negotiation reads, unlike the
/// tunnel's own streaming body reads).
async fn read_exact_timed(socket: &mut TcpStream, buf: &mut [u8], deadline: Duration) -> Result<(), TunnelError> {
    let timed_out = || {
        TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "SOCKS5 negotiation timed out",
        ))
    };
    timeout(deadline, socket.read_exact(buf)).await.map_err(|_| timed_out())??;
    Ok(())
}

async fn negotiate_method(socket: &mut TcpStream, auth: &Socks5Auth, deadline: Duration) -> Result<(), TunnelError> {
    let mut header = [0u8; 2];
    read_exact_timed(socket, &mut header, deadline).await?;
    if header[0] != VERSION {
        return Err(TunnelError::Socks5(format!("unsupported SOCKS version {}", header[0])));
    }
    let mut methods = vec![0u8; header[1] as usize];
    read_exact_timed(socket, &mut methods, deadline).await?;

    let selected = if auth.user_pass_required() {
        if methods.contains(&METHOD_USER_PASS) {
            METHOD_USER_PASS
        } else {
            METHOD_NO_ACCEPTABLE
        }
    } else if methods.contains(&METHOD_NO_AUTH) {
        METHOD_NO_AUTH
    } else {
        METHOD_NO_ACCEPTABLE
    };

    socket.write_all(&[VERSION, selected]).await?;
    if selected == METHOD_NO_ACCEPTABLE {
        return Err(TunnelError::Socks5("no acceptable authentication method".into()));
    }
    if selected == METHOD_USER_PASS {
        negotiate_user_pass(socket, auth, deadline).await?;
    }
    Ok(())
}

async fn negotiate_user_pass(socket: &mut TcpStream, auth: &Socks5Auth, deadline: Duration) -> Result<(), TunnelError> {
    let mut header = [0u8; 2];
    read_exact_timed(socket, &mut header, deadline).await?;
    let ulen = header[1] as usize;
    let mut username = vec![0u8; ulen];
    read_exact_timed(socket, &mut username, deadline).await?;

    let mut plen_buf = [0u8; 1];
    read_exact_timed(socket, &mut plen_buf, deadline).await?;
    let mut password = vec![0u8; plen_buf[0] as usize];
    read_exact_timed(socket, &mut password, deadline).await?;

    let ok = username == auth.username.as_bytes() && password == auth.password.as_bytes();
    socket.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
    if !ok {
        return Err(TunnelError::Socks5("SOCKS5 auth failed".into()));
    }
    Ok(())
}

async fn read_connect_request(socket: &mut TcpStream, deadline: Duration) -> Result<String, TunnelError> {
    let mut header = [0u8; 4];
    read_exact_timed(socket, &mut header, deadline).await?;
    if header[0] != VERSION {
        return Err(TunnelError::Socks5("invalid SOCKS5 request version".into()));
    }
    if header[1] != CMD_CONNECT {
        write_reply(socket, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(TunnelError::Socks5(format!("unsupported command {}", header[1])));
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            read_exact_timed(socket, &mut addr, deadline).await?;
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            read_exact_timed(socket, &mut len_buf, deadline).await?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            read_exact_timed(socket, &mut domain, deadline).await?;
            String::from_utf8(domain).map_err(|_| TunnelError::Socks5("invalid domain name".into()))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            read_exact_timed(socket, &mut addr, deadline).await?;
            let parts: Vec<String> = (0..8)
                .map(|i| format!("{:x}", u16::from_be_bytes([addr[i * 2], addr[i * 2 + 1]])))
                .collect();
            parts.join(":")
        }
        other => {
            write_reply(socket, REP_ADDR_TYPE_NOT_SUPPORTED).await?;
            return Err(TunnelError::Socks5(format!("unsupported address type {other}")));
        }
    };

    let mut port_buf = [0u8; 2];
    read_exact_timed(socket, &mut port_buf, deadline).await?;
    let port = u16::from_be_bytes(port_buf);

    Ok(format!("{host}:{port}"))
}

async fn write_reply(socket: &mut TcpStream, rep: u8) -> Result<(), TunnelError> {
    socket
        .write_all(&[VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

fn reply_code(err: &TunnelError) -> u8 {
    match err {
        TunnelError::HostUnreachable(_) => REP_HOST_UNREACHABLE,
        TunnelError::DialFailed(_) => REP_HOST_UNREACHABLE,
        TunnelError::ConnRefused => REP_CONN_REFUSED,
        _ => REP_GENERAL_FAILURE,
    }
}

fn reply_code_for_io_error(err: &std::io::Error) -> u8 {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused => REP_CONN_REFUSED,
        ErrorKind::NotFound | ErrorKind::AddrNotAvailable => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}
