//! OVA Appliance Proxy
//!
//! Every OVA provider gets its own inventory server deployment. This proxy gives them a single
//! entry point: `ANY /{namespace}/{provider}/appliances` is forwarded to the inventory service
//! recorded in the Provider status.
//!
//! Proxies are built on first use and kept in a TTL cache keyed by `namespace/provider`.

pub mod cache;
pub mod config;
pub mod error;
pub mod lookup;
pub mod proxy;
pub mod server;
pub mod tls;

pub use cache::ProxyCache;
pub use config::ProxyConfig;
pub use error::ProxyError;
pub use lookup::{KubeProviderLookup, ProviderLookup, ServiceRef};
pub use proxy::{ProxyTransport, ReqwestTransport, ReverseProxy};
pub use server::{router, AppState};
