//! Error types. `StartupError` covers configuration and bootstrap failures;
//! `TunnelError` covers failures in an established or attempted tunnel.

use crate::protocol::{FrameError, MessageError};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: ConfigFormatError,
    },

    #[error("invalid mode {0:?}: expected one of auto, full, half")]
    InvalidMode(String),

    #[error("invalid buffer size {0}: must be between 512 and 1024000 bytes")]
    InvalidBufferSize(usize),

    #[error("invalid target URL {0:?}: {1}")]
    InvalidTarget(String, url::ParseError),

    #[error("invalid exclude-domain pattern {0:?}: {1}")]
    InvalidExcludePattern(String, regex::Error),

    #[error("failed to bind SOCKS5 listener on {0}: {1}")]
    Bind(std::net::SocketAddr, std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("auto-probe failed: {0}")]
    Probe(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFormatError {
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("unrecognized config file extension; expected one of .yaml, .yml, .toml, .json")]
    UnknownExtension,
}

/// Runtime, per-stream error taxonomy (spec §7). `HostUnreachable`,
/// `DialFailed`, and `ConnRefused` map to SOCKS5 reply codes at the C8
/// boundary; `Protocol` and `LocalClosed` simply close the stream.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("host unreachable: {0}")]
    HostUnreachable(String),

    #[error("dial failed: {0}")]
    DialFailed(String),

    #[error("connection refused")]
    ConnRefused,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("local peer closed")]
    LocalClosed,

    #[error("tunnel stream closed")]
    Closed,

    #[error("auto-probe could not establish a duplex mode within the timeout")]
    ProbeTimedOut,

    #[error("upstream responded with status {0}")]
    UnexpectedStatus(reqwest::StatusCode),

    #[error("upstream HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SOCKS5 protocol violation: {0}")]
    Socks5(String),
}

impl TunnelError {
    /// `CREATE` rejected by the remote handler: either a transport-level
    /// failure before the first frame, or a non-zero status byte.
    pub fn create_rejected(status: u8) -> Self {
        TunnelError::HostUnreachable(format!("CREATE rejected, status byte 0x{status:02x}"))
    }
}

impl From<FrameError> for TunnelError {
    fn from(e: FrameError) -> Self {
        TunnelError::Protocol(e.to_string())
    }
}

impl From<MessageError> for TunnelError {
    fn from(e: MessageError) -> Self {
        TunnelError::Protocol(e.to_string())
    }
}

pub(crate) fn log_startup_error(err: &StartupError) {
    tracing::error!(error = %err, "startup failed");
}
