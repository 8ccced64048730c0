//! Connection factory
//!
//! Assembles the connection handle for a resolved spec:
//! transport plan → dial target (Cloud SQL lookup, SOCKS5 forwarder) → TLS →
//! credential → pool → capability probe. Dial attempts are wrapped in the
//! bounded retry loop; a fresh credential is minted for every attempt.

use super::cloudsql::CloudSqlTls;
use super::data_api::DataApiClient;
use super::pool::{FixedTls, MysqlPool, TlsSource};
use super::probe::{self, ServerCapabilities};
use super::proxy::Socks5Forwarder;
use super::retry::{retry_async, RetryPolicy};
use super::tls::{system_ssl_opts, TlsMaterial, TlsRegistry};
use super::transport::{select_transport, DialTarget, TransportPlan};
use crate::auth::{self, AuthMode, CredentialProvider};
use crate::client::CloudSqlInstance;
use crate::cloud::{
    ClientKeyPair, CloudSqlResolver, GoogleCredentials, ResolvedCloudConfig, CLOUD_SQL_SERVER_PORT,
};
use crate::config::{ConnectionSpec, TlsMode, TransportScheme};
use crate::{Error, Result};
use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Row, SslOpts, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Query execution capability handed to resource reconcilers
#[async_trait]
pub trait QueryExecutor: Send + Sync + fmt::Debug {
    /// Run a statement, returning the number of affected rows
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a query, returning every row as text columns (`None` for NULL)
    async fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>>;

    /// Server capabilities from the one-shot probe
    async fn capabilities(&self) -> Result<ServerCapabilities>;

    /// Release every resource held by this executor
    async fn close(&self) -> Result<()>;
}

/// Pooled MySQL connection source
pub struct PooledConnection {
    pool: MysqlPool,
    transport: TransportScheme,
    capabilities: ServerCapabilities,
    forwarder: Mutex<Option<Socks5Forwarder>>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool)
            .field("transport", &self.transport)
            .field("vendor", &self.capabilities.vendor)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Underlying pool
    pub fn pool(&self) -> &MysqlPool {
        &self.pool
    }
}

#[async_trait]
impl QueryExecutor for PooledConnection {
    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(sql).await?;
        Ok(conn.affected_rows())
    }

    async fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn.query(sql).await?;
        Ok(rows
            .into_iter()
            .map(|row| row.unwrap().iter().map(value_to_string).collect())
            .collect())
    }

    async fn capabilities(&self) -> Result<ServerCapabilities> {
        Ok(self.capabilities.clone())
    }

    async fn close(&self) -> Result<()> {
        let result = self.pool.disconnect().await;
        if let Some(forwarder) = self.forwarder.lock().await.take() {
            forwarder.shutdown().await;
        }
        result
    }
}

/// Render a driver value as MySQL text-protocol output
fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(n) => Some(n.to_string()),
        Value::UInt(n) => Some(n.to_string()),
        Value::Float(n) => Some(n.to_string()),
        Value::Double(n) => Some(n.to_string()),
        Value::Date(y, mo, d, 0, 0, 0, 0) => Some(format!("{:04}-{:02}-{:02}", y, mo, d)),
        Value::Date(y, mo, d, h, mi, s, 0) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            y, mo, d, h, mi, s
        )),
        Value::Date(y, mo, d, h, mi, s, us) => Some(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
            y, mo, d, h, mi, s, us
        )),
        Value::Time(neg, days, h, mi, s, us) => {
            let sign = if *neg { "-" } else { "" };
            let hours = *days * 24 + u32::from(*h);
            Some(if *us == 0 {
                format!("{}{:02}:{:02}:{:02}", sign, hours, mi, s)
            } else {
                format!("{}{:02}:{:02}:{:02}.{:06}", sign, hours, mi, s, us)
            })
        }
    }
}

/// Connection handle: a pool or a Data API client
#[derive(Debug)]
pub enum ProviderConnection {
    /// Connection pool over TCP or a Unix socket
    Pooled(PooledConnection),
    /// Stateless RDS Data API client
    DataApi(DataApiClient),
}

impl ProviderConnection {
    /// Transport behind this handle
    pub fn transport(&self) -> TransportScheme {
        match self {
            ProviderConnection::Pooled(pooled) => pooled.transport,
            ProviderConnection::DataApi(_) => TransportScheme::AwsDataApi,
        }
    }

    fn executor(&self) -> &dyn QueryExecutor {
        match self {
            ProviderConnection::Pooled(pooled) => pooled,
            ProviderConnection::DataApi(client) => client,
        }
    }
}

#[async_trait]
impl QueryExecutor for ProviderConnection {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.executor().execute(sql).await
    }

    async fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        self.executor().query(sql).await
    }

    async fn capabilities(&self) -> Result<ServerCapabilities> {
        self.executor().capabilities().await
    }

    async fn close(&self) -> Result<()> {
        self.executor().close().await
    }
}

/// Builds connection handles for one provider instance
#[derive(Debug)]
pub struct ConnectionFactory {
    spec: Arc<ConnectionSpec>,
    cloud: ResolvedCloudConfig,
    tls_registry: Arc<TlsRegistry>,
    cancel: CancellationToken,
    retry: RetryPolicy,
    cloud_sql: Option<CloudSqlResolver>,
    google: Option<GoogleCredentials>,
    client_keys: OnceCell<Arc<ClientKeyPair>>,
}

impl ConnectionFactory {
    /// Create a factory; the retry budget comes from `connect_retry_timeout_sec`
    pub fn new(
        spec: Arc<ConnectionSpec>,
        cloud: ResolvedCloudConfig,
        tls_registry: Arc<TlsRegistry>,
        cancel: CancellationToken,
    ) -> Self {
        let retry = RetryPolicy::with_budget(spec.connect_retry_timeout());
        Self {
            spec,
            cloud,
            tls_registry,
            cancel,
            retry,
            cloud_sql: None,
            google: None,
            client_keys: OnceCell::new(),
        }
    }

    /// Override the retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Use a specific Cloud SQL Admin client
    pub fn cloud_sql_resolver(mut self, resolver: CloudSqlResolver) -> Self {
        self.cloud_sql = Some(resolver);
        self
    }

    /// Use specific Google credentials instead of discovering them
    pub fn google_credentials(mut self, credentials: GoogleCredentials) -> Self {
        self.google = Some(credentials);
        self
    }

    /// Use an existing RSA key for Cloud SQL client certificates instead of
    /// generating one on first use
    pub fn cloud_sql_client_key(mut self, keys: ClientKeyPair) -> Self {
        self.client_keys = OnceCell::new_with(Some(Arc::new(keys)));
        self
    }

    /// Establish the connection handle.
    ///
    /// # Errors
    ///
    /// * [`Error::Config`] / [`Error::Auth`] immediately, without retry
    /// * [`Error::Connection`] once the retry budget is exhausted
    /// * [`Error::Cancelled`] when the factory's token is cancelled
    pub async fn connect(&self) -> Result<ProviderConnection> {
        let plan = select_transport(&self.spec)?;
        let transport = plan.scheme();
        let started = Instant::now();

        let result = async {
            match plan {
                TransportPlan::DataApi(target) => {
                    if self.spec.pool().is_configured() {
                        tracing::warn!(
                            "max_open_conns and max_conn_lifetime_sec do not apply to the Data API and are ignored"
                        );
                    }
                    let aws = self.cloud.aws().ok_or_else(|| {
                        Error::Config("Data API mode requires a resolved AWS configuration".into())
                    })?;
                    Ok(ProviderConnection::DataApi(DataApiClient::new(
                        aws.sdk_config(),
                        target,
                        self.retry.clone(),
                        self.cancel.child_token(),
                    )))
                }
                plan => self.connect_pooled(plan).await.map(ProviderConnection::Pooled),
            }
        }
        .instrument(tracing::info_span!(
            "connect",
            transport = %transport,
            mode = %self.spec.auth_mode(),
        ))
        .await;

        crate::metrics::histograms::connect_duration(
            transport.as_str(),
            result.is_ok(),
            started.elapsed(),
        );
        result
    }

    async fn connect_pooled(&self, plan: TransportPlan) -> Result<PooledConnection> {
        let scheme = plan.scheme();
        let transport = scheme.as_str();
        let provider = auth::select_provider(&self.spec, &self.cloud)?;
        let started = Instant::now();

        let (mut target, cloud_sql) = match plan {
            TransportPlan::Tcp { host, port } => (DialTarget::Tcp { host, port }, None),
            TransportPlan::Unix(path) => (DialTarget::Unix(path), None),
            TransportPlan::CloudSql { instance, ip_type } => {
                let google = self.resolve_google_credentials().await?;
                let settings = retry_async(&self.retry, &self.cancel, transport, |_| {
                    self.cloud_sql_settings(&google, &instance)
                })
                .await?;
                let address = settings.address(ip_type)?.to_string();
                let server_ca = settings.server_ca_pem.ok_or_else(|| {
                    Error::Connection(format!(
                        "Cloud SQL instance '{}' returned no server CA certificate",
                        instance
                    ))
                })?;
                tracing::info!(instance = %instance, ip_type = %ip_type, address = %address, "resolved Cloud SQL address");
                (
                    DialTarget::tcp(address, CLOUD_SQL_SERVER_PORT),
                    Some((instance, server_ca, google)),
                )
            }
            TransportPlan::DataApi(_) => {
                return Err(Error::Config("Data API transport has no dial target".into()))
            }
        };

        let forwarder = match (self.spec.proxy(), &target) {
            (Some(proxy), DialTarget::Tcp { host, port }) => Some(
                Socks5Forwarder::spawn(proxy.clone(), host.clone(), *port, self.cancel.clone())
                    .await?,
            ),
            _ => None,
        };
        if let Some(forwarder) = &forwarder {
            let local = forwarder.local_addr();
            target = DialTarget::tcp(local.ip().to_string(), local.port());
        }

        let ssl: Arc<dyn TlsSource> = match cloud_sql {
            Some((instance, server_ca, google)) => {
                Arc::new(self.cloud_sql_tls(instance, server_ca, google).await?)
            }
            None => Arc::new(FixedTls(self.ssl_opts(forwarder.is_some())?)),
        };

        // the address lookup and the dial share one budget
        let retry = RetryPolicy {
            budget: self.retry.budget.saturating_sub(started.elapsed()),
            ..self.retry.clone()
        };
        let (pool, capabilities) = retry_async(&retry, &self.cancel, transport, |attempt| {
            self.attempt(provider.clone(), target.clone(), ssl.clone())
                .instrument(tracing::debug_span!("connect_attempt", attempt))
        })
        .await?;

        Ok(PooledConnection {
            pool,
            transport: scheme,
            capabilities,
            forwarder: Mutex::new(forwarder),
        })
    }

    /// One dial: new pool, first connection (which mints its credential), probe
    async fn attempt(
        &self,
        provider: Arc<dyn CredentialProvider>,
        target: DialTarget,
        ssl: Arc<dyn TlsSource>,
    ) -> Result<(MysqlPool, ServerCapabilities)> {
        let pool = MysqlPool::new(
            self.spec.clone(),
            target,
            ssl,
            provider,
            self.cancel.clone(),
        );

        let probed = async {
            let mut conn = pool.get_conn().await?;
            probe::probe(&mut *conn).await
        }
        .await;

        match probed {
            Ok(capabilities) => {
                tracing::info!(target = %pool.target(), "connected");
                Ok((pool, capabilities))
            }
            Err(e) => {
                let _ = pool.disconnect().await;
                Err(e)
            }
        }
    }

    async fn resolve_google_credentials(&self) -> Result<GoogleCredentials> {
        match &self.google {
            Some(credentials) => Ok(credentials.clone()),
            None => GoogleCredentials::discover().await,
        }
    }

    fn resolved_cloud_sql_resolver(&self) -> CloudSqlResolver {
        self.cloud_sql
            .clone()
            .unwrap_or_else(|| CloudSqlResolver::new(self.cloud.http().clone()))
    }

    async fn cloud_sql_settings(
        &self,
        google: &GoogleCredentials,
        instance: &CloudSqlInstance,
    ) -> Result<crate::cloud::ConnectSettings> {
        let token = google.access_token(self.cloud.http()).await?;
        self.resolved_cloud_sql_resolver().connect_settings(instance, &token).await
    }

    /// RSA key for Cloud SQL client certificates, generated once per factory
    async fn client_keys(&self) -> Result<Arc<ClientKeyPair>> {
        self.client_keys
            .get_or_try_init(|| async {
                let keys = tokio::task::spawn_blocking(ClientKeyPair::generate)
                    .await
                    .map_err(|e| {
                        Error::Connection(format!("Cloud SQL client key generation failed: {}", e))
                    })??;
                tracing::debug!("generated Cloud SQL client key");
                Ok::<_, Error>(Arc::new(keys))
            })
            .await
            .cloned()
    }

    /// Mutual TLS for the Cloud SQL server-side proxy.
    ///
    /// The proxy only accepts its own client certificates, so `tls` settings
    /// other than the connector material do not apply.
    async fn cloud_sql_tls(
        &self,
        instance: CloudSqlInstance,
        server_ca: String,
        google: GoogleCredentials,
    ) -> Result<CloudSqlTls> {
        match self.spec.tls() {
            TlsMode::On => {}
            other => tracing::warn!(
                tls = ?other,
                "Cloud SQL connections always use the instance's mutual TLS; the tls setting is ignored"
            ),
        }

        let login_token = match self.spec.auth_mode() {
            AuthMode::CloudSqlIam => self.spec.password().cloned(),
            _ => None,
        };

        Ok(CloudSqlTls::new(
            instance,
            server_ca,
            self.client_keys().await?,
            self.resolved_cloud_sql_resolver(),
            google,
            self.cloud.http().clone(),
            self.tls_registry.clone(),
        )
        .login_token(login_token))
    }

    /// Driver TLS options for direct connections.
    ///
    /// Hostname validation is skipped when dialing through the local proxy
    /// forwarder.
    fn ssl_opts(&self, proxied: bool) -> Result<Option<SslOpts>> {
        let key = match (self.spec.tls(), self.spec.custom_tls()) {
            (TlsMode::Custom, Some(custom)) => {
                let material = TlsMaterial::load(custom)?;
                self.tls_registry.register(custom.config_key.as_deref(), material)
            }
            (TlsMode::Off, _) => return Ok(None),
            (TlsMode::SkipVerify, _) => return Ok(Some(system_ssl_opts(true))),
            (TlsMode::On, _) | (TlsMode::Custom, None) => {
                if proxied {
                    tracing::warn!("TLS hostname validation is disabled because connections go through the proxy forwarder");
                }
                return Ok(Some(
                    system_ssl_opts(false).with_danger_skip_domain_validation(proxied),
                ));
            }
        };

        let material = self
            .tls_registry
            .get(&key)
            .ok_or_else(|| Error::Config(format!("TLS configuration '{}' is not registered", key)))?;
        tracing::debug!(key = %key, client_identity = material.has_client_identity(), "using registered TLS configuration");

        let material = if proxied {
            material.without_domain_validation()
        } else {
            (*material).clone()
        };
        Ok(Some(material.to_ssl_opts()))
    }
}
