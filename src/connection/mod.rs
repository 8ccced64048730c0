//! Connection management
//!
//! This module handles:
//! * Transport selection (TCP, Unix socket, Cloud SQL, RDS Data API)
//! * Cloud SQL ephemeral client certificates for mutual TLS
//! * TLS material loading and the per-provider TLS registry
//! * SOCKS5 forwarding for proxied dials
//! * Connection pooling with a fresh credential per physical dial
//! * Bounded retry and the post-connect capability probe

mod cloudsql;
mod data_api;
mod factory;
mod pool;
mod probe;
mod proxy;
mod retry;
pub(crate) mod tls;
mod transport;

pub use cloudsql::{CloudSqlTls, CERT_REFRESH_MARGIN};
pub use data_api::DataApiClient;
pub use factory::{ConnectionFactory, PooledConnection, ProviderConnection, QueryExecutor};
pub use pool::{
    build_opts, ConnectionManager, FixedTls, MysqlPool, PooledConn, TlsSource, DEFAULT_MAX_OPEN,
};
pub use probe::{probe, ServerCapabilities, ServerVendor, ServerVersion, TiDbInfo};
pub use proxy::{socks5_connect, ProxyConfig, Socks5Forwarder, DEFAULT_SOCKS_PORT};
pub use retry::{retry_async, RetryPolicy};
pub use tls::{system_ssl_opts, CustomTls, PemSource, TlsMaterial, TlsMaterialBuilder, TlsRegistry};
pub use transport::{select_transport, DialTarget, TransportPlan};
