//! HTTP transport (C3): one streaming request/response pair per tunneled
//! stream, with mid-body writes, cookie policy, and the `X-Suo5` mode
//! header. Treats `reqwest` itself as the external HTTP client
//! collaborator (spec §1); this module only wires it up the way the
//! connection manager and duplex engine need.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ResolvedConfig;
use crate::error::{StartupError, TunnelError};

pub const HEADER_KEY: &str = "X-Suo5";
pub const HEADER_VALUE_CHECKING: &str = "checking";
pub const HEADER_VALUE_FULL: &str = "full";
pub const HEADER_VALUE_HALF: &str = "half";

const DEFAULT_ALLOWED_COOKIES: &[&str] = &["PHPSESSID"];

/// A jar that delegates to a full `reqwest::cookie::Jar` but only persists
/// cookies whose name is on an allowlist, dropping the rest on the floor.
/// Models the "switchable jar" cookie policy from spec §4.3 without an
/// inheritance hierarchy: it's a filter wrapped around the real jar.
#[derive(Debug)]
struct SwitchableJar {
    inner: reqwest::cookie::Jar,
    allowed: Vec<String>,
}

impl SwitchableJar {
    fn new(allowed: Vec<String>) -> Self {
        Self {
            inner: reqwest::cookie::Jar::default(),
            allowed,
        }
    }

    fn filter(&self, value: &HeaderValue) -> Option<HeaderValue> {
        let text = value.to_str().ok()?;
        let name = text.split('=').next()?.trim();
        self.allowed
            .iter()
            .any(|a| a.eq_ignore_ascii_case(name))
            .then(|| value.clone())
    }
}

impl reqwest::cookie::CookieStore for SwitchableJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url) {
        let allowed: Vec<HeaderValue> = cookie_headers.filter_map(|v| self.filter(v)).collect();
        if !allowed.is_empty() {
            self.inner.set_cookies(&mut allowed.iter(), url);
        }
    }

    fn cookies(&self, url: &url::Url) -> Option<HeaderValue> {
        self.inner.cookies(url)
    }
}

/// Builds the shared `reqwest::Client` used by every tunneled stream.
///
/// TLS is configured with `danger_accept_invalid_certs` and a minimum of
/// TLS 1.0, per spec §4.3; a randomized ClientHello fingerprint (JA3
/// variance) requires a non-`reqwest` TLS stack and is the external
/// collaborator spec §1 carves out, not something this crate implements.
pub fn build_client(resolved: &ResolvedConfig) -> Result<reqwest::Client, StartupError> {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .min_tls_version(reqwest::tls::Version::TLS_1_0)
        .redirect(reqwest::redirect::Policy::none())
        .pool_idle_timeout(Some(Duration::from_secs(90)));

    if resolved.raw.enable_cookiejar {
        builder = builder.cookie_store(true);
    } else {
        let jar = Arc::new(SwitchableJar::new(
            DEFAULT_ALLOWED_COOKIES.iter().map(|s| s.to_string()).collect(),
        ));
        builder = builder.cookie_provider(jar);
    }

    // Upstream proxy chaining (spec §1 external collaborator) is reduced
    // here to the single hop reqwest itself understands; only the first
    // configured proxy is honored.
    if let Some(proxy_url) = resolved.raw.upstream_proxy.first() {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(StartupError::HttpClient)?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(StartupError::HttpClient)
}

/// Handle to the live body of a full-duplex request: pushing bytes here
/// appends to the still-open chunked request body.
#[derive(Clone)]
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

impl BodySender {
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), TunnelError> {
        self.tx
            .send(Ok(Bytes::from(bytes)))
            .await
            .map_err(|_| TunnelError::Closed)
    }
}

/// The HTTP surface the duplex engine and connection manager need: opening
/// a streaming request/response pair, and issuing bounded one-shot
/// requests (half-duplex writes, DELETE, heartbeat).
pub struct HttpTransport {
    client: reqwest::Client,
    pub target: String,
    pub method: reqwest::Method,
    pub headers: HeaderMap,
    pub timeout: Duration,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, resolved: &ResolvedConfig) -> Result<Self, StartupError> {
        let method = resolved
            .raw
            .method
            .parse::<reqwest::Method>()
            .unwrap_or(reqwest::Method::POST);
        Ok(Self {
            client,
            target: resolved.raw.target.clone(),
            method,
            headers: resolved.headers.clone(),
            timeout: Duration::from_secs(resolved.raw.timeout_secs),
        })
    }

    fn request_headers(&self, mode_marker: &str) -> HeaderMap {
        let mut headers = self.headers.clone();
        headers.insert(
            HeaderName::from_static("x-suo5"),
            HeaderValue::from_str(mode_marker).unwrap_or_else(|_| HeaderValue::from_static("full")),
        );
        headers
    }

    /// Opens a long-lived request whose body is fed by the returned
    /// [`BodySender`] and whose response is the live, streaming
    /// `reqwest::Response`. `head` is written immediately (the CREATE
    /// frame); subsequent sends append DATA/HEARTBEAT frames.
    pub async fn open_streaming(
        &self,
        mode_marker: &str,
        head: Vec<u8>,
    ) -> Result<(BodySender, reqwest::Response), TunnelError> {
        let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        tx.send(Ok(Bytes::from(head))).await.map_err(|_| TunnelError::Closed)?;

        let body = reqwest::Body::wrap_stream(ReceiverStream::new(rx));
        let response = self
            .client
            .request(self.method.clone(), &self.target)
            .headers(self.request_headers(mode_marker))
            .body(body)
            .send()
            .await?;

        Ok((BodySender { tx }, response))
    }

    /// Issues a single bounded request carrying `body`, used for
    /// half-duplex writes, DELETE, and (when not streamed) heartbeat
    /// frames. Returns the response with status already checked for 200.
    pub async fn send_once(&self, mode_marker: &str, body: Vec<u8>) -> Result<reqwest::Response, TunnelError> {
        let response = self
            .client
            .request(self.method.clone(), &self.target)
            .headers(self.request_headers(mode_marker))
            .timeout(self.timeout)
            .body(body)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(TunnelError::UnexpectedStatus(response.status()));
        }
        Ok(response)
    }

    /// Opens the half-duplex CREATE dial: a single request whose response
    /// body becomes the stream's persistent tunnel reader. Deliberately
    /// carries no request-level timeout — `reqwest`'s timeout covers the
    /// whole request including streaming body reads, and this response
    /// stays open for the stream's entire lifetime. Bounded per-write
    /// requests (DATA/DELETE/heartbeat) go through `send_once` instead.
    pub async fn open_persistent(&self, mode_marker: &str, body: Vec<u8>) -> Result<reqwest::Response, TunnelError> {
        let response = self
            .client
            .request(self.method.clone(), &self.target)
            .headers(self.request_headers(mode_marker))
            .body(body)
            .send()
            .await?;

        if response.status() != reqwest::StatusCode::OK {
            return Err(TunnelError::UnexpectedStatus(response.status()));
        }
        Ok(response)
    }

    /// Opens a single streaming request with a channel-backed body and no
    /// overall timeout, used by the auto-probe (which manages its own
    /// cancellation by closing the channel).
    pub async fn open_probe(
        &self,
        body_rx: mpsc::Receiver<Result<Bytes, std::io::Error>>,
    ) -> Result<reqwest::Response, TunnelError> {
        let body = reqwest::Body::wrap_stream(ReceiverStream::new(body_rx));
        let response = self
            .client
            .request(self.method.clone(), &self.target)
            .headers(self.request_headers(HEADER_VALUE_CHECKING))
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switchable_jar_keeps_allowlisted_cookie_names() {
        let jar = SwitchableJar::new(vec!["PHPSESSID".to_string()]);
        let kept = HeaderValue::from_static("PHPSESSID=abc123; Path=/");
        let dropped = HeaderValue::from_static("tracking=xyz; Path=/");
        assert!(jar.filter(&kept).is_some());
        assert!(jar.filter(&dropped).is_none());
    }

    #[test]
    fn switchable_jar_match_is_case_insensitive() {
        let jar = SwitchableJar::new(vec!["PHPSESSID".to_string()]);
        let value = HeaderValue::from_static("phpsessid=abc123");
        assert!(jar.filter(&value).is_some());
    }
}
