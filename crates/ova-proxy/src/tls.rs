//! TLS termination

use crate::error::ProxyError;
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tracing::debug;

/// Build a server config from PEM certificate chain and key files
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, ProxyError> {
    let certs = CertificateDer::pem_file_iter(cert)
        .map_err(|e| ProxyError::Tls(format!("{}: {}", cert.display(), e)))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("{}: {}", cert.display(), e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!("{}: no certificates found", cert.display())));
    }
    let key = PrivateKeyDer::from_pem_file(key).map_err(|e| ProxyError::Tls(format!("{}: {}", key.display(), e)))?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// Accept TLS connections and serve `app` on each
pub async fn serve_tls(listener: TcpListener, config: Arc<ServerConfig>, app: Router) -> Result<(), ProxyError> {
    let acceptor = TlsAcceptor::from(config);
    loop {
        let (stream, addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let app = app.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(stream).await {
                Ok(stream) => stream,
                Err(e) => {
                    debug!("TLS handshake with {} failed: {}", addr, e);
                    return;
                }
            };

            let service = app.map_request(move |mut request: http::Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(addr));
                request
            });
            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), TowerToHyperService::new(service))
                .await
            {
                debug!("Connection from {} closed with error: {}", addr, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_files_are_reported() {
        let err = load_server_config(Path::new("/nonexistent/tls.crt"), Path::new("/nonexistent/tls.key")).unwrap_err();
        assert!(matches!(err, ProxyError::Tls(msg) if msg.contains("/nonexistent/tls.crt")));
    }

    #[test]
    fn test_empty_certificate_file() {
        let dir = std::env::temp_dir().join(format!("ova-proxy-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("empty.crt");
        std::fs::write(&cert, "").unwrap();

        let err = load_server_config(&cert, &dir.join("tls.key")).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
