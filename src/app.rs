//! Top-level wiring: resolves configuration, builds the HTTP transport,
//! runs the startup probe, then dispatches to the SOCKS5 server, the TCP
//! forwarder, or a one-shot `--test-exit` dial.

use std::sync::Arc;

use crate::config::{Config, DuplexMode, ResolvedConfig};
use crate::error::{log_startup_error, StartupError};
use crate::forward::ForwardServer;
use crate::manager::ConnectionManager;
use crate::socks5::{Socks5Auth, Socks5Server};
use crate::transport::{build_client, HttpTransport};

/// Runs the process end to end. Returns the process exit code (spec §6).
pub async fn run(config: Config) -> i32 {
    match try_run(config).await {
        Ok(code) => code,
        Err(e) => {
            log_startup_error(&e);
            1
        }
    }
}

async fn try_run(config: Config) -> Result<i32, StartupError> {
    let resolved = config.resolve()?;
    let client = build_client(&resolved)?;
    let transport = Arc::new(HttpTransport::new(client, &resolved)?);

    let (mode, offset) = resolve_mode_and_offset(&resolved, &transport).await?;

    let manager = Arc::new(ConnectionManager::new(
        transport,
        mode,
        offset,
        resolved.raw.redirect_url.clone(),
        resolved.raw.disable_heartbeat,
    ));

    if let Some(target) = resolved.raw.test_exit.clone() {
        return Ok(run_test_exit(&manager, &target).await);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if !resolved.raw.forward_target.is_empty() {
        let server = ForwardServer::new(
            resolved.listen_addr,
            resolved.raw.forward_target.clone(),
            manager,
            resolved.raw.buffer_size,
        );
        server.serve(shutdown_rx).await?;
    } else {
        let auth = Socks5Auth {
            no_auth: resolved.raw.no_auth,
            username: resolved.raw.username.clone(),
            password: resolved.raw.password.clone(),
        };
        let server = Socks5Server::new(
            resolved.listen_addr,
            auth,
            manager,
            resolved.exclude.clone(),
            resolved.raw.buffer_size,
            std::time::Duration::from_secs(resolved.raw.timeout_secs),
        );
        server.serve(shutdown_rx).await?;
    }

    Ok(0)
}

/// Runs the auto-probe once at startup (spec §4.7: "run once during
/// startup, before accepting local connections") regardless of the
/// configured mode, since the response offset it discovers is needed by
/// every mode, not only `auto`.
async fn resolve_mode_and_offset(
    resolved: &ResolvedConfig,
    transport: &HttpTransport,
) -> Result<(DuplexMode, usize), StartupError> {
    let probed = crate::probe::run(transport).await?;
    let mode = crate::probe::reconcile(resolved.mode, probed.mode)?;
    tracing::info!(?mode, offset = probed.offset, "auto-probe complete");
    Ok((mode, probed.offset))
}

async fn run_test_exit(manager: &ConnectionManager, target: &str) -> i32 {
    match manager.connect(target).await {
        Ok(stream) => {
            tracing::info!(%target, "test-exit probe succeeded");
            let _ = stream.close().await;
            0
        }
        Err(e) => {
            tracing::error!(%target, error = %e, "test-exit probe failed");
            1
        }
    }
}
