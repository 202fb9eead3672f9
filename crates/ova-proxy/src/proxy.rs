//! Reverse proxy to one inventory service

use crate::error::ProxyError;
use crate::lookup::ServiceRef;
use axum::body::Body;
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Largest request body forwarded
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Sends a buffered request upstream
#[async_trait::async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Send `request` and buffer the whole response
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError>;
}

/// Default transport
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Transport with a 60s request timeout
    pub fn new() -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ProxyError::Configuration(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl ProxyTransport for ReqwestTransport {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        let request = reqwest::Request::try_from(request).map_err(|e| ProxyError::Request(e.to_string()))?;
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        let mut builder = Response::builder().status(response.status());
        if let Some(headers) = builder.headers_mut() {
            *headers = response.headers().clone();
        }
        let body = response.bytes().await.map_err(|e| ProxyError::Upstream(e.to_string()))?;
        builder.body(body).map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}

/// Forwards requests to `http://{svc}.{ns}.svc.{domain}:{port}/appliances`
pub struct ReverseProxy {
    target: String,
    transport: Arc<dyn ProxyTransport>,
}

impl std::fmt::Debug for ReverseProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReverseProxy").field("target", &self.target).finish_non_exhaustive()
    }
}

impl ReverseProxy {
    /// Proxy to the inventory service `service`
    pub fn new(service: &ServiceRef, cluster_domain: &str, port: u16, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            target: format!(
                "http://{}.{}.svc.{}:{}/appliances",
                service.name, service.namespace, cluster_domain, port
            ),
            transport,
        }
    }

    /// Upstream URL requests are rewritten to
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Forward one request; the path is rewritten and the query string kept
    pub async fn forward(
        &self,
        request: Request<Body>,
        client: Option<SocketAddr>,
        scheme: &'static str,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| ProxyError::Request(e.to_string()))?;

        let uri = match parts.uri.query() {
            Some(query) => format!("{}?{}", self.target, query),
            None => self.target.clone(),
        };

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(HOST);

        if let Some(addr) = client {
            let forwarded_for = match parts.headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, addr.ip()),
                None => addr.ip().to_string(),
            };
            let value = HeaderValue::from_str(&forwarded_for).map_err(|e| ProxyError::Request(e.to_string()))?;
            headers.insert(X_FORWARDED_FOR.clone(), value);
        }
        if let Some(host) = parts.headers.get(HOST) {
            headers.insert(X_FORWARDED_HOST.clone(), host.clone());
        }
        headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static(scheme));

        debug!("{} {} -> {}", parts.method, parts.uri, uri);
        let mut outbound = Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body)
            .map_err(|e| ProxyError::Request(e.to_string()))?;
        *outbound.headers_mut() = headers;

        let (mut response, body) = self.transport.send(outbound).await?.into_parts();
        response.headers = strip_hop_by_hop(&response.headers);
        Ok(Response::from_parts(response, Body::from(body)))
    }
}

/// Copy headers minus hop-by-hop ones, including any listed in `Connection`
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|v| v.trim().to_ascii_lowercase())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || listed.iter().any(|l| l == lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
