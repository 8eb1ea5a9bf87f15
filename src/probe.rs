//! Auto-probe (C7): run once at startup to measure whether the remote
//! endpoint streams the request body through to an intermediary promptly
//! (full-duplex viable) or buffers it until the body is complete
//! (half-duplex only), and to learn the response-body preamble offset.

use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;

use crate::config::DuplexMode;
use crate::error::StartupError;
use crate::transport::HttpTransport;

/// Cutoff between "the intermediary streamed our body through" (fast
/// echo) and "it buffered the whole thing first" (slow echo).
const FULL_DUPLEX_CUTOFF: Duration = Duration::from_secs(3);
/// How long the probe keeps its request body channel open before closing
/// it, forcing a buffering intermediary to finally see EOF and reply.
const PROBE_BODY_LIFETIME: Duration = Duration::from_secs(5);

pub struct ProbeResult {
    pub mode: DuplexMode,
    pub offset: usize,
}

/// Generates a random printable-ASCII payload of length in `[32, 1056)`,
/// matching the reference implementation's `32 + rand.Intn(1024)` shape.
fn random_payload() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let len = 32 + rng.gen_range(0..1024usize);
    (0..len).map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char).collect()
}

/// Runs the probe once. Returns the measured mode and response offset, or
/// a fatal [`StartupError`] if the target never echoes the probe payload
/// (it doesn't speak this protocol at all).
pub async fn run(transport: &HttpTransport) -> Result<ProbeResult, StartupError> {
    let payload = random_payload();
    let needle = payload[..32].to_string();

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(1);
    let _ = tx.send(Ok(Bytes::from(payload.into_bytes()))).await;

    // Closing the channel after PROBE_BODY_LIFETIME forces a buffering
    // intermediary to observe EOF on our request body and finally reply.
    tokio::spawn(async move {
        tokio::time::sleep(PROBE_BODY_LIFETIME).await;
        drop(tx);
    });

    let start = Instant::now();
    let response = transport
        .open_probe(rx)
        .await
        .map_err(|e| StartupError::Probe(format!("probe request failed: {e}")))?;
    // Headers are available as soon as `send()` resolves; this is the
    // "send-start to headers-received" measurement the duplex decision
    // is based on.
    let elapsed = start.elapsed();

    let body = response
        .bytes()
        .await
        .map_err(|e| StartupError::Probe(format!("failed to read probe response body: {e}")))?;

    let offset = find_subsequence(&body, needle.as_bytes())
        .ok_or_else(|| StartupError::Probe("target did not echo the probe payload; it may not speak this tunnel protocol".into()))?;

    let mode = if elapsed < FULL_DUPLEX_CUTOFF {
        DuplexMode::Full
    } else {
        DuplexMode::Half
    };

    Ok(ProbeResult { mode, offset })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Reconciles the user's configured mode with what the probe measured,
/// per spec §4.7 step 7: a user-forced `full` that the probe contradicts
/// is a fatal startup error; a user-forced `half` is honored either way,
/// with the probe's more-capable verdict only logged as informational.
pub fn reconcile(configured: DuplexMode, probed: DuplexMode) -> Result<DuplexMode, StartupError> {
    match (configured, probed) {
        (DuplexMode::Auto, probed) => Ok(probed),
        (DuplexMode::Full, DuplexMode::Half) => Err(StartupError::Probe(
            "target doesn't support full-duplex; rerun with mode=half or mode=auto".into(),
        )),
        (DuplexMode::Full, DuplexMode::Full) => Ok(DuplexMode::Full),
        (DuplexMode::Half, DuplexMode::Full) => {
            tracing::info!("target supports full-duplex; mode=half is still honored as configured");
            Ok(DuplexMode::Half)
        }
        (DuplexMode::Half, DuplexMode::Half) => Ok(DuplexMode::Half),
        (DuplexMode::Auto, DuplexMode::Auto) => unreachable!("probe never reports Auto"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_subsequence_locates_the_needle() {
        let haystack = b"----banner----0123456789012345678901234567890123tail";
        let needle = b"01234567890123456789012345678901";
        assert_eq!(find_subsequence(haystack, needle), Some(14));
    }

    #[test]
    fn find_subsequence_returns_none_when_absent() {
        assert_eq!(find_subsequence(b"abcdef", b"xyz"), None);
    }

    #[test]
    fn reconcile_auto_adopts_the_probe_result() {
        assert_eq!(reconcile(DuplexMode::Auto, DuplexMode::Half).unwrap(), DuplexMode::Half);
    }

    #[test]
    fn reconcile_forced_full_against_half_probe_is_fatal() {
        assert!(reconcile(DuplexMode::Full, DuplexMode::Half).is_err());
    }

    #[test]
    fn reconcile_forced_half_is_always_honored() {
        assert_eq!(reconcile(DuplexMode::Half, DuplexMode::Full).unwrap(), DuplexMode::Half);
    }
}
