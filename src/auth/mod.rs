//! Credential acquisition
//!
//! A [`CredentialProvider`] produces the secret used for one connection attempt:
//! a static password, an RDS IAM token, an Azure AD token, a caller-supplied
//! Cloud SQL OAuth2 token, or nothing at all (Data API mode).
//!
//! Token-based providers mint a fresh token on every call; nothing is cached
//! between attempts. Static passwords and pre-resolved cloud credential chains
//! are immutable and shared.

mod rds_iam;

pub use rds_iam::{infer_rds_region, RdsIamTokenProvider, RdsTokenRequest, TOKEN_VALIDITY};

use crate::cloud::{AzureCredentialChain, ResolvedCloudConfig};
use crate::config::ConnectionSpec;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

/// Upper bound for a single credential acquisition (token mint, metadata call)
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// A string that redacts its contents in Debug and Display.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString {
    inner: String,
}

impl SecretString {
    /// Create a new secret string.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Access the underlying value.
    pub fn expose(&self) -> &str {
        &self.inner
    }

    /// Whether the secret is the empty string
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Authentication mode; exactly one is active per connection spec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMode {
    /// Static password (possibly empty)
    Static,
    /// RDS IAM authentication token
    RdsIam,
    /// Azure AD access token
    AzureAd,
    /// Caller-supplied Cloud SQL IAM OAuth2 token
    CloudSqlIam,
    /// RDS Data API: no password on the wire
    DataApi,
}

impl AuthMode {
    /// Whether the secret is a short-lived token sent through the cleartext plugin
    pub fn is_token(&self) -> bool {
        matches!(self, AuthMode::RdsIam | AuthMode::AzureAd | AuthMode::CloudSqlIam)
    }

    /// Stable lowercase label
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Static => "static",
            AuthMode::RdsIam => "rds_iam",
            AuthMode::AzureAd => "azure_ad",
            AuthMode::CloudSqlIam => "cloudsql_iam",
            AuthMode::DataApi => "data_api",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret for a single connection attempt.
///
/// Owned by the attempt that requested it; never persisted and never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    secret: Option<SecretString>,
    expires_at: Option<SystemTime>,
}

impl ResolvedCredential {
    /// Credential without a secret (Data API mode, or no password configured)
    pub fn none() -> Self {
        Self {
            secret: None,
            expires_at: None,
        }
    }

    /// Static credential with no expiry
    pub fn from_static(secret: Option<SecretString>) -> Self {
        Self {
            secret,
            expires_at: None,
        }
    }

    /// Token credential valid until `expires_at`
    pub fn expiring(secret: SecretString, expires_at: SystemTime) -> Self {
        Self {
            secret: Some(secret),
            expires_at: Some(expires_at),
        }
    }

    /// Password-equivalent value, if any
    pub fn password(&self) -> Option<&str> {
        self.secret.as_ref().map(SecretString::expose)
    }

    /// Expiry instant, if the credential is short-lived
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    /// Whether the credential expires within `margin` from now
    pub fn expires_within(&self, margin: Duration) -> bool {
        match self.expires_at {
            Some(at) => SystemTime::now() + margin >= at,
            None => false,
        }
    }
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCredential")
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Strategy producing the secret for one connection attempt
#[async_trait]
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Authentication mode implemented by this provider
    fn mode(&self) -> AuthMode;

    /// Produce a current secret for this attempt
    async fn acquire(&self) -> Result<ResolvedCredential>;
}

/// Static password, used verbatim (may be empty for passwordless accounts)
#[derive(Debug, Clone)]
pub struct StaticPasswordProvider {
    password: Option<SecretString>,
}

impl StaticPasswordProvider {
    /// Create a provider for the given password
    pub fn new(password: Option<SecretString>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl CredentialProvider for StaticPasswordProvider {
    fn mode(&self) -> AuthMode {
        AuthMode::Static
    }

    async fn acquire(&self) -> Result<ResolvedCredential> {
        Ok(ResolvedCredential::from_static(self.password.clone()))
    }
}

/// Data API mode: requests are signed by the AWS SDK, no password is produced
#[derive(Debug, Clone, Default)]
pub struct DataApiProvider;

#[async_trait]
impl CredentialProvider for DataApiProvider {
    fn mode(&self) -> AuthMode {
        AuthMode::DataApi
    }

    async fn acquire(&self) -> Result<ResolvedCredential> {
        Ok(ResolvedCredential::none())
    }
}

/// Cloud SQL IAM database authentication.
///
/// The caller supplies a short-lived OAuth2 access token in the password field;
/// no token is minted here.
#[derive(Debug, Clone)]
pub struct CloudSqlIamProvider {
    token: Option<SecretString>,
}

impl CloudSqlIamProvider {
    /// Create a provider, emitting a hint if the password does not look like a token
    pub fn new(token: Option<SecretString>) -> Self {
        match &token {
            Some(t) if looks_like_google_token(t.expose()) => {}
            Some(_) => tracing::warn!(
                "iam_database_authentication is enabled but the password does not look like an OAuth2 access token"
            ),
            None => tracing::warn!(
                "iam_database_authentication is enabled but no OAuth2 access token was supplied as password"
            ),
        }
        Self { token }
    }
}

fn looks_like_google_token(value: &str) -> bool {
    value.starts_with("ya29.")
}

#[async_trait]
impl CredentialProvider for CloudSqlIamProvider {
    fn mode(&self) -> AuthMode {
        AuthMode::CloudSqlIam
    }

    async fn acquire(&self) -> Result<ResolvedCredential> {
        Ok(ResolvedCredential::from_static(self.token.clone()))
    }
}

/// Azure AD access token scoped to the Azure Database for MySQL audience
#[derive(Debug, Clone)]
pub struct AzureAdTokenProvider {
    chain: Arc<AzureCredentialChain>,
}

impl AzureAdTokenProvider {
    /// Create a provider over a resolved credential chain
    pub fn new(chain: Arc<AzureCredentialChain>) -> Self {
        Self { chain }
    }
}

#[async_trait]
impl CredentialProvider for AzureAdTokenProvider {
    fn mode(&self) -> AuthMode {
        AuthMode::AzureAd
    }

    async fn acquire(&self) -> Result<ResolvedCredential> {
        let token = self.chain.get_token().await?;
        Ok(ResolvedCredential::expiring(token.token, token.expires_at))
    }
}

/// Select the provider for the connection spec's authentication mode
pub fn select_provider(
    spec: &ConnectionSpec,
    cloud: &ResolvedCloudConfig,
) -> Result<Arc<dyn CredentialProvider>> {
    let provider: Arc<dyn CredentialProvider> = match spec.auth_mode() {
        AuthMode::DataApi => Arc::new(DataApiProvider),
        AuthMode::RdsIam => {
            let aws = cloud.aws().ok_or_else(|| {
                Error::Config("RDS IAM authentication requires a resolved AWS configuration".into())
            })?;
            let (host, port) = spec
                .endpoint()
                .and_then(|ep| ep.host_port())
                .ok_or_else(|| {
                    Error::Config("RDS IAM authentication requires a TCP endpoint hostname".into())
                })?;
            Arc::new(RdsIamTokenProvider::from_resolved(
                aws,
                RdsTokenRequest::new(host, port, spec.username()),
            )?)
        }
        AuthMode::AzureAd => {
            let chain = cloud.azure().ok_or_else(|| {
                Error::Config("Azure AD authentication requires a resolved Azure configuration".into())
            })?;
            Arc::new(AzureAdTokenProvider::new(chain))
        }
        AuthMode::CloudSqlIam => Arc::new(CloudSqlIamProvider::new(spec.password().cloned())),
        AuthMode::Static => Arc::new(StaticPasswordProvider::new(spec.password().cloned())),
    };

    tracing::debug!(mode = %provider.mode(), "selected credential provider");
    Ok(provider)
}

/// Acquire a credential through `provider`, bounded by `timeout` and `cancel`.
pub async fn acquire_with(
    provider: &dyn CredentialProvider,
    cancel: &CancellationToken,
    timeout: Duration,
) -> Result<ResolvedCredential> {
    let mode = provider.mode();
    let started = Instant::now();

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled(format!("credential acquisition ({}) cancelled", mode))),
        r = tokio::time::timeout(timeout, provider.acquire()) => match r {
            Ok(r) => r,
            Err(_) => Err(Error::Connection(format!(
                "credential acquisition ({}) timed out after {:?}",
                mode, timeout
            ))),
        },
    };

    match &result {
        Ok(_) => {
            crate::metrics::counters::credential_acquired(mode.as_str());
            crate::metrics::histograms::credential_duration(mode.as_str(), started.elapsed());
            tracing::debug!(mode = %mode, "credential acquired");
        }
        Err(e) => {
            crate::metrics::counters::credential_failed(mode.as_str(), e.kind().as_str());
            tracing::warn!(mode = %mode, kind = %e.kind(), "credential acquisition failed");
        }
    }

    result
}

/// Acquire a credential for one connection attempt.
///
/// Selects the provider for `spec` and produces a fresh credential.
pub async fn acquire(
    spec: &ConnectionSpec,
    cloud: &ResolvedCloudConfig,
    cancel: &CancellationToken,
) -> Result<ResolvedCredential> {
    let provider = select_provider(spec, cloud)?;
    acquire_with(provider.as_ref(), cancel, DEFAULT_ACQUIRE_TIMEOUT).await
}
