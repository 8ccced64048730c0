//! Azure AD credential chain for Azure Database for MySQL
//!
//! Token sources, tried in order:
//! * client secret, when client id, secret and tenant id are all configured
//! * workload identity (federated token file), when running in a federated pod
//! * managed identity through the instance metadata service
//!
//! Building the chain performs no network I/O; tokens are requested per
//! connection attempt by [`AzureCredentialChain::get_token`].

use super::AccessToken;
use crate::auth::SecretString;
use crate::config::AzureConfigBlock;
use crate::{Error, Result};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

/// Default instance metadata service endpoint for managed identity
pub const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

const IMDS_API_VERSION: &str = "2018-02-01";
const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Federated token rejected as not yet valid or expired; the file is rotated by the platform
const AADSTS_ASSERTION_TIME_RANGE: &str = "AADSTS700024";

/// Sovereign cloud selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AzureEnvironment {
    /// Azure public cloud
    #[default]
    Public,
    /// Azure China (21Vianet)
    China,
    /// Azure Germany
    German,
    /// Azure US Government
    UsGovernment,
}

impl AzureEnvironment {
    /// Parse an environment name (empty means public)
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "public" | "azurepublic" | "azurepubliccloud" | "azurecloud" => Ok(Self::Public),
            "china" | "azurechina" | "azurechinacloud" => Ok(Self::China),
            "german" | "germany" | "azuregerman" | "azuregermancloud" => Ok(Self::German),
            "usgovernment" | "usgov" | "azureusgovernment" | "azureusgovernmentcloud" => {
                Ok(Self::UsGovernment)
            }
            other => Err(Error::Config(format!(
                "unknown azure environment '{}': expected public, china, german or usgovernment",
                other
            ))),
        }
    }

    /// Azure AD authority host
    pub fn authority_host(&self) -> &'static str {
        match self {
            Self::Public => "https://login.microsoftonline.com",
            Self::China => "https://login.chinacloudapi.cn",
            Self::German => "https://login.microsoftonline.de",
            Self::UsGovernment => "https://login.microsoftonline.us",
        }
    }

    /// Resource identifier of Azure Database for MySQL/PostgreSQL in this cloud
    pub fn ossrdbms_resource(&self) -> &'static str {
        match self {
            Self::Public => "https://ossrdbms-aad.database.windows.net",
            Self::China => "https://ossrdbms-aad.database.chinacloudapi.cn",
            Self::German => "https://ossrdbms-aad.database.cloudapi.de",
            Self::UsGovernment => "https://ossrdbms-aad.database.usgovcloudapi.net",
        }
    }

    /// OAuth2 scope for the database audience
    pub fn ossrdbms_scope(&self) -> String {
        format!("{}/.default", self.ossrdbms_resource())
    }
}

/// Validated Azure configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AzureConfig {
    /// Application (client) id
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<SecretString>,
    /// Tenant id
    pub tenant_id: Option<String>,
    /// Sovereign cloud
    pub environment: AzureEnvironment,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl AzureConfig {
    /// Validate an `azure_config` block
    pub fn from_block(block: &AzureConfigBlock) -> Result<Self> {
        Ok(Self {
            client_id: non_empty(&block.client_id),
            client_secret: non_empty(&block.client_secret).map(SecretString::new),
            tenant_id: non_empty(&block.tenant_id),
            environment: AzureEnvironment::parse(&block.environment)?,
        })
    }

    /// Whether every field needed for the client-secret flow is present
    pub fn has_client_secret_credentials(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.tenant_id.is_some()
    }
}

/// One way of obtaining an Azure AD token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AzureTokenSource {
    /// Confidential client with a secret
    ClientSecret {
        /// Tenant id
        tenant_id: String,
        /// Client id
        client_id: String,
        /// Client secret
        client_secret: SecretString,
    },
    /// Federated credential read from a projected token file
    WorkloadIdentity {
        /// Tenant id
        tenant_id: String,
        /// Client id
        client_id: String,
        /// Federated token file
        token_file: PathBuf,
    },
    /// Managed identity (user-assigned when a client id is given)
    ManagedIdentity {
        /// User-assigned identity client id
        client_id: Option<String>,
    },
}

impl AzureTokenSource {
    fn name(&self) -> &'static str {
        match self {
            Self::ClientSecret { .. } => "client_secret",
            Self::WorkloadIdentity { .. } => "workload_identity",
            Self::ManagedIdentity { .. } => "managed_identity",
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<NumberOrString>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    String(String),
}

impl NumberOrString {
    fn as_secs(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Ordered Azure token sources sharing one HTTP client
#[derive(Clone)]
pub struct AzureCredentialChain {
    sources: Vec<AzureTokenSource>,
    environment: AzureEnvironment,
    authority_host: String,
    imds_endpoint: String,
    http: reqwest::Client,
}

impl fmt::Debug for AzureCredentialChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureCredentialChain")
            .field("sources", &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("environment", &self.environment)
            .field("authority_host", &self.authority_host)
            .finish()
    }
}

impl AzureCredentialChain {
    /// Build the chain, reading ambient settings from the process environment
    pub fn new(config: &AzureConfig, http: reqwest::Client) -> Self {
        Self::with_env_lookup(config, http, |name| std::env::var(name).ok())
    }

    /// Build the chain with a custom environment lookup.
    ///
    /// Explicit client-secret credentials are used alone. Otherwise workload
    /// identity (`AZURE_FEDERATED_TOKEN_FILE`) and managed identity are tried in order.
    pub fn with_env_lookup<F>(config: &AzureConfig, http: reqwest::Client, env_lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| env_lookup(name).filter(|v| !v.is_empty());
        let mut sources = Vec::new();

        if let (Some(tenant_id), Some(client_id), Some(client_secret)) =
            (&config.tenant_id, &config.client_id, &config.client_secret)
        {
            sources.push(AzureTokenSource::ClientSecret {
                tenant_id: tenant_id.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            });
        } else {
            let client_id = config.client_id.clone().or_else(|| env("AZURE_CLIENT_ID"));
            let tenant_id = config.tenant_id.clone().or_else(|| env("AZURE_TENANT_ID"));

            if let (Some(token_file), Some(tenant_id), Some(client_id)) =
                (env("AZURE_FEDERATED_TOKEN_FILE"), &tenant_id, &client_id)
            {
                sources.push(AzureTokenSource::WorkloadIdentity {
                    tenant_id: tenant_id.clone(),
                    client_id: client_id.clone(),
                    token_file: PathBuf::from(token_file),
                });
            }

            sources.push(AzureTokenSource::ManagedIdentity { client_id });
        }

        let authority_host = env("AZURE_AUTHORITY_HOST")
            .unwrap_or_else(|| config.environment.authority_host().to_string());

        Self {
            sources,
            environment: config.environment,
            authority_host: authority_host.trim_end_matches('/').to_string(),
            imds_endpoint: DEFAULT_IMDS_ENDPOINT.to_string(),
            http,
        }
    }

    /// Override the Azure AD authority host
    pub fn authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the managed identity endpoint
    pub fn imds_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.imds_endpoint = endpoint.into();
        self
    }

    /// Token sources in the order they are tried
    pub fn sources(&self) -> &[AzureTokenSource] {
        &self.sources
    }

    /// Sovereign cloud
    pub fn environment(&self) -> AzureEnvironment {
        self.environment
    }

    /// Request a fresh token for the database audience.
    ///
    /// Returns the first source's token that succeeds. When all fail, the
    /// error of the last source is returned.
    pub async fn get_token(&self) -> Result<AccessToken> {
        let mut last_err = None;

        for source in &self.sources {
            match self.token_from(source).await {
                Ok(token) => {
                    tracing::debug!(source = source.name(), "obtained Azure AD token");
                    return Ok(token);
                }
                Err(e) => {
                    tracing::debug!(source = source.name(), error = %e, "Azure token source failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Auth("no Azure credential source is available".into())))
    }

    async fn token_from(&self, source: &AzureTokenSource) -> Result<AccessToken> {
        let scope = self.environment.ossrdbms_scope();

        let request = match source {
            AzureTokenSource::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => self.http.post(self.token_url(tenant_id)).form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.expose()),
                ("scope", scope.as_str()),
            ]),
            AzureTokenSource::WorkloadIdentity {
                tenant_id,
                client_id,
                token_file,
            } => {
                let assertion = tokio::fs::read_to_string(token_file).await.map_err(|e| {
                    Error::Auth(format!(
                        "failed to read federated token file '{}': {}",
                        token_file.display(),
                        e
                    ))
                })?;
                self.http.post(self.token_url(tenant_id)).form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_assertion_type", CLIENT_ASSERTION_TYPE),
                    ("client_assertion", assertion.trim()),
                    ("scope", scope.as_str()),
                ])
            }
            AzureTokenSource::ManagedIdentity { client_id } => {
                let mut query = vec![
                    ("api-version", IMDS_API_VERSION),
                    ("resource", self.environment.ossrdbms_resource()),
                ];
                if let Some(id) = client_id {
                    query.push(("client_id", id.as_str()));
                }
                self.http
                    .get(&self.imds_endpoint)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let response = request.send().await.map_err(|e| {
            Error::Connection(format!("Azure token request ({}) failed: {}", source.name(), e.without_url()))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body: ErrorResponse = response.json().await.unwrap_or_default();
            return Err(classify_token_error(source.name(), status, &body));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            Error::Auth(format!(
                "invalid Azure token response ({}): {}",
                source.name(),
                e.without_url()
            ))
        })?;

        let lifetime = body
            .expires_in
            .as_ref()
            .and_then(NumberOrString::as_secs)
            .unwrap_or(3600);

        Ok(AccessToken {
            token: SecretString::new(body.access_token),
            expires_at: SystemTime::now() + Duration::from_secs(lifetime),
        })
    }

    fn token_url(&self, tenant_id: &str) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority_host, tenant_id)
    }
}

fn classify_token_error(source: &str, status: reqwest::StatusCode, body: &ErrorResponse) -> Error {
    let description = body.error_description.lines().next().unwrap_or_default();
    let msg = format!(
        "Azure token request ({}) returned {}: {} {}",
        source,
        status.as_u16(),
        body.error,
        description
    );

    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || body.error_description.contains(AADSTS_ASSERTION_TIME_RANGE)
    {
        Error::Connection(msg.trim_end().to_string())
    } else {
        Error::Auth(msg.trim_end().to_string())
    }
}
