// ABOUTME: Connection helpers with a process-wide TLS policy
// ABOUTME: Each client owns a spawned connection task that logs its own failures

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::utils::sanitize_url;

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set once at startup whether invalid server certificates are accepted.
///
/// Later calls are ignored; clients created before the first call use the
/// secure default.
pub fn init_tls_policy(allow_self_signed: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed).is_err() {
        tracing::debug!("TLS policy already initialised, ignoring update");
    }
    if allow_self_signed {
        tracing::warn!("Accepting self-signed TLS certificates (insecure)");
    }
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

fn make_tls() -> Result<MakeTlsConnector> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_self_signed())
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a connection and spawn its driver task.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = make_tls()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", sanitize_url(url)))?;

    let target = sanitize_url(url);
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection to {} closed with error: {}", target, e);
        }
    });

    Ok(client)
}

/// [`connect`] with three attempts and exponential backoff starting at one second.
pub async fn connect_with_retry(url: &str) -> Result<Client> {
    let label = format!("connect to {}", sanitize_url(url));
    retry_with_backoff(&label, RetryPolicy::new(3, Duration::from_secs(1)), || connect(url))
        .await
        .map_err(|e| e.into_inner())
}
