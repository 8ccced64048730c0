//! Connection pool
//!
//! The pool is a bb8 pool over [`ConnectionManager`], whose `connect` mints a
//! credential for every physical connection it opens. A token is used for
//! exactly one dial: idle connections are reused, tokens are not. TLS options
//! are also taken per dial from a [`TlsSource`], so short-lived client
//! certificates are renewed the same way. Pool limits come from
//! `max_open_conns` and `max_conn_lifetime_sec`.

use super::transport::DialTarget;
use crate::auth::{self, CredentialProvider, ResolvedCredential, DEFAULT_ACQUIRE_TIMEOUT};
use crate::config::{AuthPlugin, ConnectionSpec, PoolPolicy};
use crate::{Error, Result};
use async_trait::async_trait;
use bb8::{ManageConnection, RunError};
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, SslOpts};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pool size used when `max_open_conns` is unset
pub const DEFAULT_MAX_OPEN: u32 = 10;

/// How long `get_conn` waits for a free connection or a finished dial
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection checked out of a [`MysqlPool`]
pub type PooledConn = bb8::PooledConnection<'static, ConnectionManager>;

/// Build driver options for one dial
pub fn build_opts(
    spec: &ConnectionSpec,
    target: &DialTarget,
    credential: &ResolvedCredential,
    ssl: Option<SslOpts>,
) -> Result<Opts> {
    let mut builder = OptsBuilder::default()
        .user(Some(spec.username()))
        .pass(credential.password())
        .prefer_socket(Some(false))
        .ssl_opts(ssl);

    builder = match target {
        DialTarget::Tcp { host, port } => builder.ip_or_hostname(host.as_str()).tcp_port(*port),
        DialTarget::Unix(path) => {
            let path = path.to_str().ok_or_else(|| {
                Error::Config(format!("socket path '{}' is not valid UTF-8", path.display()))
            })?;
            builder.socket(Some(path))
        }
    };

    if spec.auth_plugin() == AuthPlugin::Cleartext {
        builder = builder.enable_cleartext_plugin(true);
    }

    let init: Vec<String> = spec
        .conn_params()
        .iter()
        .map(|(key, value)| format!("SET {} = {}", key, value))
        .collect();
    if !init.is_empty() {
        builder = builder.init(init);
    }

    Ok(Opts::from(builder))
}

/// Maximum pool size for a pool policy
fn max_size(policy: PoolPolicy) -> u32 {
    policy
        .max_open_conns
        .map(|max| u32::try_from(max).unwrap_or(u32::MAX).max(1))
        .unwrap_or(DEFAULT_MAX_OPEN)
}

/// Driver TLS options for each new physical connection
#[async_trait]
pub trait TlsSource: Send + Sync + std::fmt::Debug {
    /// Options for the next dial; `None` dials without TLS
    async fn ssl_opts(&self) -> Result<Option<SslOpts>>;
}

/// The same TLS options for every dial
#[derive(Debug, Clone, Default)]
pub struct FixedTls(pub Option<SslOpts>);

#[async_trait]
impl TlsSource for FixedTls {
    async fn ssl_opts(&self) -> Result<Option<SslOpts>> {
        Ok(self.0.clone())
    }
}

/// bb8 manager dialing MySQL with a freshly minted credential per connection
pub struct ConnectionManager {
    spec: Arc<ConnectionSpec>,
    target: DialTarget,
    ssl: Arc<dyn TlsSource>,
    provider: Arc<dyn CredentialProvider>,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl ConnectionManager {
    /// Create a manager for one dial target
    pub fn new(
        spec: Arc<ConnectionSpec>,
        target: DialTarget,
        ssl: Arc<dyn TlsSource>,
        provider: Arc<dyn CredentialProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            spec,
            target,
            ssl,
            provider,
            cancel,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("target", &self.target)
            .field("tls", &self.ssl)
            .field("mode", &self.provider.mode())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ManageConnection for ConnectionManager {
    type Connection = Conn;
    type Error = Error;

    async fn connect(&self) -> Result<Conn> {
        if self.is_closed() {
            return Err(Error::Connection(format!("connection pool for {} is closed", self.target)));
        }
        let ssl = self.ssl.ssl_opts().await?;
        let credential =
            auth::acquire_with(self.provider.as_ref(), &self.cancel, DEFAULT_ACQUIRE_TIMEOUT).await?;
        let opts = build_opts(&self.spec, &self.target, &credential, ssl)?;
        crate::metrics::counters::pool_dial(self.spec.transport().as_str());

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled(format!("dial to {} cancelled", self.target))),
            conn = Conn::new(opts) => {
                let conn = conn?;
                tracing::debug!(target = %self.target, mode = %self.provider.mode(), "opened MySQL connection");
                Ok(conn)
            }
        }
    }

    async fn is_valid(&self, conn: &mut Conn) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Connection("connection pool is closed".into()));
        }
        Ok(conn.ping().await?)
    }

    fn has_broken(&self, _conn: &mut Conn) -> bool {
        // connections returned after close are dropped instead of kept idle
        self.is_closed()
    }
}

/// Pooled connection source for one provider instance
#[derive(Clone)]
pub struct MysqlPool {
    inner: bb8::Pool<ConnectionManager>,
    target: DialTarget,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MysqlPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("MysqlPool")
            .field("target", &self.target)
            .field("connections", &state.connections)
            .field("idle_connections", &state.idle_connections)
            .finish()
    }
}

impl MysqlPool {
    /// Create the pool; no connection is opened until the first checkout
    pub fn new(
        spec: Arc<ConnectionSpec>,
        target: DialTarget,
        ssl: Arc<dyn TlsSource>,
        provider: Arc<dyn CredentialProvider>,
        cancel: CancellationToken,
    ) -> Self {
        let policy = spec.pool();
        let max_size = max_size(policy);
        let manager = ConnectionManager::new(spec, target.clone(), ssl, provider, cancel);
        let closed = manager.closed.clone();

        // dial failures surface to the caller; the factory owns the retry policy
        let inner = bb8::Pool::builder()
            .max_size(max_size)
            .max_lifetime(policy.max_lifetime)
            .connection_timeout(CHECKOUT_TIMEOUT)
            .retry_connection(false)
            .build_unchecked(manager);

        tracing::info!(
            target = %target,
            max_open_conns = max_size,
            max_lifetime = ?policy.max_lifetime,
            "MySQL connection pool created"
        );

        Self {
            inner,
            target,
            closed,
        }
    }

    /// Address the pool dials
    pub fn target(&self) -> &DialTarget {
        &self.target
    }

    /// Open and idle connection counts
    pub fn state(&self) -> bb8::State {
        self.inner.state()
    }

    /// Check out a connection, dialing with a fresh credential when none is idle
    pub async fn get_conn(&self) -> Result<PooledConn> {
        self.inner.get_owned().await.map_err(|e| match e {
            RunError::User(e) => e,
            RunError::TimedOut => Error::Connection(format!(
                "timed out after {:?} waiting for a connection to {}",
                CHECKOUT_TIMEOUT, self.target
            )),
        })
    }

    /// Close the pool.
    ///
    /// Idle connections fail validation once the pool is closed, so one
    /// checkout drops all of them (mysql_async disconnects dropped connections
    /// in the background) and then fails without dialing. Checked-out
    /// connections are dropped when they are returned.
    pub async fn disconnect(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let idle = self.inner.state().idle_connections;
        if idle > 0 {
            let _ = self.inner.get().await;
        }
        tracing::debug!(target = %self.target, idle, "MySQL connection pool disconnected");
        Ok(())
    }

    /// Whether [`disconnect`](Self::disconnect) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
