//! HTTP surface of the proxy

use crate::cache::ProxyCache;
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::lookup::ProviderLookup;
use crate::proxy::{ProxyTransport, ReverseProxy};
use crate::tls;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::response::Response;
use axum::routing::{any, get};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared request state
pub struct AppState {
    /// Proxy configuration
    pub config: ProxyConfig,
    /// Proxies built so far, keyed `namespace/provider`
    pub cache: ProxyCache<Arc<ReverseProxy>>,
    /// Provider resolution
    pub lookup: Arc<dyn ProviderLookup>,
    /// Upstream transport shared by every proxy
    pub transport: Arc<dyn ProxyTransport>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// State with an empty cache
    pub fn new(config: ProxyConfig, lookup: Arc<dyn ProviderLookup>, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            cache: ProxyCache::new(config.cache_ttl),
            config,
            lookup,
            transport,
        }
    }

    /// Cached proxy for a provider, built on a miss
    ///
    /// Concurrent misses on one key may each build a proxy; the last one stored wins.
    pub async fn proxy_for(&self, namespace: &str, provider: &str) -> Result<Arc<ReverseProxy>, ProxyError> {
        let key = ProxyCache::<Arc<ReverseProxy>>::key(namespace, provider);
        if let Some(proxy) = self.cache.get(&key) {
            return Ok(proxy);
        }

        let service = self.lookup.service_for(namespace, provider).await?;
        let proxy = Arc::new(ReverseProxy::new(
            &service,
            &self.config.cluster_domain,
            self.config.inventory_port,
            Arc::clone(&self.transport),
        ));
        debug!("Built proxy {} -> {}", key, proxy.target());
        self.cache.insert(key, Arc::clone(&proxy));
        Ok(proxy)
    }

    fn scheme(&self) -> &'static str {
        if self.config.tls.is_some() { "https" } else { "http" }
    }
}

/// Routes of the proxy
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{namespace}/{provider}/appliances", any(appliances))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn appliances(
    State(state): State<Arc<AppState>>,
    Path((namespace, provider)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ProxyError> {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let proxy = state.proxy_for(&namespace, &provider).await?;
    proxy.forward(request, client, state.scheme()).await
}

/// Bind and serve until the listener fails
pub async fn serve(state: Arc<AppState>) -> Result<(), ProxyError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.listen_port()));
    let listener = TcpListener::bind(addr).await?;
    let tls = state.config.tls.clone();
    let app = router(state);

    match tls {
        Some((cert, key)) => {
            let server_config = tls::load_server_config(&cert, &key)?;
            info!("Serving HTTPS on {}", addr);
            tls::serve_tls(listener, server_config, app).await
        }
        None => {
            info!("Serving HTTP on {}", addr);
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::ServiceRef;
    use axum::body::Body;
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    /// Counts lookups; answers according to the provider name
    #[derive(Default)]
    struct CountingLookup {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ProviderLookup for CountingLookup {
        async fn service_for(&self, namespace: &str, provider: &str) -> Result<ServiceRef, ProxyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match provider {
                "missing" => Err(ProxyError::ProviderNotFound(format!("{}/{}", namespace, provider))),
                "collecting" => Err(ProxyError::ServiceNotReady(format!("{}/{}", namespace, provider))),
                "broken" => Err(ProxyError::Lookup("apiserver unavailable".to_string())),
                _ => Ok(ServiceRef {
                    name: "svc-name".to_string(),
                    namespace: "svc-ns".to_string(),
                }),
            }
        }
    }

    struct Backend;

    #[async_trait::async_trait]
    impl ProxyTransport for Backend {
        async fn send(&self, request: http::Request<Bytes>) -> Result<http::Response<Bytes>, ProxyError> {
            assert!(request.uri().to_string().starts_with("http://svc-name.svc-ns.svc.cluster.local:8080/appliances"));
            Ok(http::Response::new(Bytes::from_static(b"[]")))
        }
    }

    fn state(lookup: Arc<CountingLookup>) -> Arc<AppState> {
        Arc::new(AppState::new(ProxyConfig::default(), lookup, Arc::new(Backend)))
    }

    async fn get(state: &Arc<AppState>, path: &str) -> StatusCode {
        let request = http::Request::builder().uri(path).body(Body::empty()).unwrap();
        router(Arc::clone(state)).oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_cache_hit_skips_lookup() {
        let lookup = Arc::new(CountingLookup::default());
        let state = state(Arc::clone(&lookup));

        assert_eq!(get(&state, "/ns/prov/appliances").await, StatusCode::OK);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        assert_eq!(get(&state, "/ns/prov/appliances").await, StatusCode::OK);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_rebuilt() {
        let lookup = Arc::new(CountingLookup::default());
        let state = state(Arc::clone(&lookup));

        assert_eq!(get(&state, "/ns/prov/appliances").await, StatusCode::OK);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(get(&state, "/ns/prov/appliances").await, StatusCode::OK);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_failures_map_to_status() {
        let lookup = Arc::new(CountingLookup::default());
        let state = state(Arc::clone(&lookup));

        assert_eq!(get(&state, "/ns/missing/appliances").await, StatusCode::NOT_FOUND);
        assert_eq!(get(&state, "/ns/collecting/appliances").await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(get(&state, "/ns/broken/appliances").await, StatusCode::INTERNAL_SERVER_ERROR);
        // Failures are not cached
        assert_eq!(get(&state, "/ns/missing/appliances").await, StatusCode::NOT_FOUND);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 4);
        assert!(state.cache.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let state = state(Arc::new(CountingLookup::default()));
        assert_eq!(get(&state, "/ns/prov/vms").await, StatusCode::NOT_FOUND);
    }
}
