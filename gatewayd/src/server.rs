use std::path::Path;
use std::sync::Arc;
use anyhow::{Context, Result};
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS certificate: {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to read TLS key: {}", key_path.display()))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", cert_path.display());
    }
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("Failed to parse TLS key")?
        .with_context(|| format!("No private key found in {}", key_path.display()))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Serve `app` on `listener`, over TLS when an acceptor is given, until
/// `cancel` fires. In-flight requests are allowed to finish.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    tls: Option<TlsAcceptor>,
    cancel: CancellationToken,
) -> Result<()> {
    match tls {
        None => axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .context("HTTP server failed"),
        Some(acceptor) => serve_tls(listener, app, acceptor, cancel).await,
    }
}

async fn serve_tls(
    listener: TcpListener,
    app: Router,
    acceptor: TlsAcceptor,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        let acceptor = acceptor.clone();
        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::debug!("TLS handshake with {} failed: {}", peer, e);
                    return;
                }
            };
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("Connection from {} closed: {}", peer, e);
            }
        });
    }

    tracing::info!("TLS listener stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("dweb-gatewayd-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_files_rejected() {
        let err = load_tls(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("TLS certificate"));
    }

    #[test]
    fn test_empty_pem_rejected() {
        let cert = temp_file("cert.pem", "");
        let key = temp_file("key.pem", "");
        let err = load_tls(&cert, &key).err().unwrap();
        assert!(err.to_string().contains("No certificates"));
    }

    #[tokio::test]
    async fn test_plain_server_stops_on_cancel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(listener, Router::new(), None, cancel.clone()));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
