//! MysqlProvider implementation

use crate::cloud::{self, CloudResolver, CloudSqlResolver, GoogleCredentials, ResolvedCloudConfig};
use crate::config::{ConnectionSpec, ProviderConfig};
use crate::connection::{
    ConnectionFactory, ProviderConnection, QueryExecutor, RetryPolicy, ServerCapabilities,
    TlsRegistry,
};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Configured MySQL provider: a resolved spec and a live connection handle
#[derive(Debug)]
pub struct MysqlProvider {
    spec: Arc<ConnectionSpec>,
    cloud: ResolvedCloudConfig,
    connection: ProviderConnection,
    tls_registry: Arc<TlsRegistry>,
    cancel: CancellationToken,
}

impl MysqlProvider {
    /// Resolve `config` and connect with default settings
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example() -> mysql_provider::Result<()> {
    /// use mysql_provider::{MysqlProvider, ProviderConfig, QueryExecutor};
    ///
    /// let config = ProviderConfig::new()
    ///     .endpoint("my-db.example.com:3306")
    ///     .username("app")
    ///     .password("secret")
    ///     .with_env_fallback();
    ///
    /// let provider = MysqlProvider::configure(config).await?;
    /// let caps = provider.capabilities().await?;
    /// println!("connected to {} {}", caps.vendor, caps.version_string);
    /// provider.close().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn configure(config: ProviderConfig) -> Result<Self> {
        Self::builder().connect(config).await
    }

    /// Start building a provider with custom cloud endpoints, retry or cancellation
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # async fn example(config: mysql_provider::ProviderConfig) -> mysql_provider::Result<()> {
    /// use mysql_provider::{MysqlProvider, RetryPolicy};
    /// use std::time::Duration;
    /// use tokio_util::sync::CancellationToken;
    ///
    /// let shutdown = CancellationToken::new();
    /// let provider = MysqlProvider::builder()
    ///     .retry_policy(RetryPolicy::with_budget(Duration::from_secs(30)))
    ///     .cancel_token(shutdown.clone())
    ///     .connect(config)
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> MysqlProviderBuilder {
        MysqlProviderBuilder::default()
    }

    /// Validated connection spec
    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// Resolved cloud configuration
    pub fn cloud(&self) -> &ResolvedCloudConfig {
        &self.cloud
    }

    /// Connection handle for resource reconcilers
    pub fn connection(&self) -> &ProviderConnection {
        &self.connection
    }

    /// TLS configurations registered by this provider
    pub fn tls_registry(&self) -> &TlsRegistry {
        &self.tls_registry
    }
}

#[async_trait]
impl QueryExecutor for MysqlProvider {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.connection.execute(sql).await
    }

    async fn query(&self, sql: &str) -> Result<Vec<Vec<Option<String>>>> {
        self.connection.query(sql).await
    }

    async fn capabilities(&self) -> Result<ServerCapabilities> {
        self.connection.capabilities().await
    }

    /// Disconnect the pool, stop the proxy forwarder and drop registered TLS configurations
    async fn close(&self) -> Result<()> {
        let result = self.connection.close().await;
        self.cancel.cancel();
        self.tls_registry.clear();
        tracing::info!(transport = %self.connection.transport(), "provider closed");
        result
    }
}

/// Builder for [`MysqlProvider`]
#[derive(Debug, Default)]
pub struct MysqlProviderBuilder {
    cloud_resolver: Option<CloudResolver>,
    cloud_sql_api_base: Option<String>,
    google_credentials: Option<GoogleCredentials>,
    retry_policy: Option<RetryPolicy>,
    cancel: Option<CancellationToken>,
}

impl MysqlProviderBuilder {
    /// Resolve cloud blocks with a customized resolver
    pub fn cloud_resolver(mut self, resolver: CloudResolver) -> Self {
        self.cloud_resolver = Some(resolver);
        self
    }

    /// Override the Cloud SQL Admin API base URL
    pub fn cloud_sql_api_base(mut self, base: impl Into<String>) -> Self {
        self.cloud_sql_api_base = Some(base.into());
        self
    }

    /// Use these Google credentials for Cloud SQL lookups instead of discovering them
    pub fn google_credentials(mut self, credentials: GoogleCredentials) -> Self {
        self.google_credentials = Some(credentials);
        self
    }

    /// Override the retry policy (default: exponential backoff within `connect_retry_timeout_sec`)
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Cancel every credential fetch and dial when `token` is cancelled
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Resolve `config` and establish the connection handle.
    ///
    /// Configuration errors are reported before any secret is fetched or any
    /// socket opened.
    pub async fn connect(self, config: ProviderConfig) -> Result<MysqlProvider> {
        let spec = Arc::new(ConnectionSpec::resolve(&config)?);
        let cancel = self
            .cancel
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let span = tracing::info_span!(
            "configure",
            user = %spec.username(),
            endpoint = ?spec.endpoint().map(|ep| ep.to_string()),
        );

        async move {
            let http = cloud::http_client(spec.proxy())?;
            let resolver = self.cloud_resolver.unwrap_or_default();
            let cloud = resolver.resolve(&spec, http).await?;

            let tls_registry = Arc::new(TlsRegistry::new());
            let mut factory = ConnectionFactory::new(
                spec.clone(),
                cloud.clone(),
                tls_registry.clone(),
                cancel.clone(),
            );
            if let Some(policy) = self.retry_policy {
                factory = factory.retry_policy(policy);
            }
            if let Some(base) = self.cloud_sql_api_base {
                factory = factory
                    .cloud_sql_resolver(CloudSqlResolver::new(cloud.http().clone()).with_api_base(base));
            }
            if let Some(credentials) = self.google_credentials {
                factory = factory.google_credentials(credentials);
            }

            let connection = factory.connect().await?;
            tracing::info!(transport = %connection.transport(), "provider configured");

            Ok(MysqlProvider {
                spec,
                cloud,
                connection,
                tls_registry,
                cancel,
            })
        }
        .instrument(span)
        .await
    }
}
