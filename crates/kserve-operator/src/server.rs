//! Webhook, health probe and metrics listeners

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::info;

use crate::controllers::ReconcileMetrics;

/// Certificate file inside the cert directory
pub const TLS_CERT_FILE: &str = "tls.crt";
/// Key file inside the cert directory
pub const TLS_KEY_FILE: &str = "tls.key";

/// Parse a bind address, accepting the `:port` shorthand for all interfaces
pub fn parse_bind_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .with_context(|| format!("invalid bind address {addr:?}"))
}

/// TLS settings from `tls.crt`/`tls.key` in `cert_dir`.
///
/// HTTP/2 is only negotiated when `enable_http2` is set.
pub fn tls_config(cert_dir: &Path, enable_http2: bool) -> anyhow::Result<RustlsConfig> {
    let cert_path = cert_dir.join(TLS_CERT_FILE);
    let key_path = cert_dir.join(TLS_KEY_FILE);

    let certs = CertificateDer::pem_file_iter(&cert_path)
        .and_then(|certs| certs.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("failed to read certificates from {}", cert_path.display()))?;
    let key = PrivateKeyDer::from_pem_file(&key_path)
        .with_context(|| format!("failed to read private key from {}", key_path.display()))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid webhook certificate")?;
    config.alpn_protocols = alpn_protocols(enable_http2);

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

fn alpn_protocols(enable_http2: bool) -> Vec<Vec<u8>> {
    if enable_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    }
}

fn health_routes() -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
}

fn metrics_routes(metrics: Arc<ReconcileMetrics>) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let metrics = metrics.clone();
            async move { metrics.render() }
        }),
    )
}

/// Serve admission webhooks and `/healthz` over TLS until the process exits
pub async fn serve_webhooks(addr: SocketAddr, tls: RustlsConfig, webhooks: Router) -> anyhow::Result<()> {
    let app = webhooks.merge(health_routes());
    info!(%addr, "starting webhook server");
    axum_server::bind_rustls(addr, tls)
        .serve(app.into_make_service())
        .await
        .context("webhook server failed")
}

/// Serve `/healthz` and `/readyz` over plain HTTP
pub async fn serve_health(addr: SocketAddr) -> anyhow::Result<()> {
    info!(%addr, "starting health probe server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health probe address {addr}"))?;
    axum::serve(listener, health_routes())
        .await
        .context("health probe server failed")
}

/// Serve `/metrics`, over TLS when `tls` is given
pub async fn serve_metrics(
    addr: SocketAddr,
    tls: Option<RustlsConfig>,
    metrics: Arc<ReconcileMetrics>,
) -> anyhow::Result<()> {
    let app = metrics_routes(metrics);
    info!(%addr, secure = tls.is_some(), "starting metrics server");
    match tls {
        Some(tls) => axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await
            .context("metrics server failed"),
        None => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind metrics address {addr}"))?;
            axum::serve(listener, app).await.context("metrics server failed")
        }
    }
}
