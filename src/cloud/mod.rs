//! Cloud configuration resolution
//!
//! Turns the `aws_config` / `azure_config` blocks into resolved SDK
//! configuration and credential chains. Resolution performs no token fetch;
//! tokens are minted per connection attempt by the credential providers.

pub mod aws;
pub mod azure;
pub mod gcp;

pub use aws::{
    AwsConfig, AwsMode, AwsResolver, DataApiTarget, ResolvedAwsConfig, RoleCheck, StaticKeys,
};
pub use azure::{AzureConfig, AzureCredentialChain, AzureEnvironment, AzureTokenSource};
pub use gcp::{
    ClientKeyPair, CloudSqlIpType, CloudSqlResolver, ConnectSettings, EphemeralCert,
    GoogleCredentials, CLOUD_SQL_SERVER_PORT,
};

use crate::auth::SecretString;
use crate::config::{AwsConfigBlock, AzureConfigBlock, ConnectionSpec};
use crate::connection::ProxyConfig;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Timeout for identity and control-plane HTTP calls
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// OAuth2 bearer token with its expiry
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// Bearer token
    pub token: SecretString,
    /// Expiry instant
    pub expires_at: SystemTime,
}

/// Validated cloud block: at most one cloud is configured
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CloudConfig {
    /// No cloud block
    #[default]
    None,
    /// AWS
    Aws(AwsConfig),
    /// Azure
    Azure(AzureConfig),
}

impl CloudConfig {
    /// Validate the raw blocks
    pub fn from_blocks(
        aws: Option<&AwsConfigBlock>,
        azure: Option<&AzureConfigBlock>,
    ) -> Result<Self> {
        match (aws, azure) {
            (Some(_), Some(_)) => Err(Error::Config(
                "aws_config and azure_config cannot both be set".into(),
            )),
            (Some(block), None) => Ok(CloudConfig::Aws(AwsConfig::from_block(block)?)),
            (None, Some(block)) => Ok(CloudConfig::Azure(AzureConfig::from_block(block)?)),
            (None, None) => Ok(CloudConfig::None),
        }
    }

    /// AWS configuration, if any
    pub fn aws(&self) -> Option<&AwsConfig> {
        match self {
            CloudConfig::Aws(aws) => Some(aws),
            _ => None,
        }
    }

    /// Azure configuration, if any
    pub fn azure(&self) -> Option<&AzureConfig> {
        match self {
            CloudConfig::Azure(azure) => Some(azure),
            _ => None,
        }
    }

    /// Data API target when Data API mode is enabled
    pub fn data_api(&self) -> Option<&DataApiTarget> {
        self.aws().and_then(AwsConfig::data_api)
    }
}

/// Cloud configuration ready for credential acquisition
#[derive(Debug, Clone)]
pub struct ResolvedCloudConfig {
    aws: Option<ResolvedAwsConfig>,
    azure: Option<Arc<AzureCredentialChain>>,
    http: reqwest::Client,
}

impl ResolvedCloudConfig {
    /// Nothing to resolve (static credentials, plain endpoints)
    pub fn none(http: reqwest::Client) -> Self {
        Self {
            aws: None,
            azure: None,
            http,
        }
    }

    /// Resolved AWS configuration
    pub fn aws(&self) -> Option<&ResolvedAwsConfig> {
        self.aws.as_ref()
    }

    /// Azure credential chain
    pub fn azure(&self) -> Option<Arc<AzureCredentialChain>> {
        self.azure.clone()
    }

    /// HTTP client for identity and control-plane calls (proxied when configured)
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }
}

/// Resolves a spec's cloud block
#[derive(Debug, Clone, Default)]
pub struct CloudResolver {
    aws: AwsResolver,
    azure_authority_host: Option<String>,
    azure_imds_endpoint: Option<String>,
}

impl CloudResolver {
    /// Resolver using the public cloud endpoints
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a customized AWS resolver
    pub fn aws_resolver(mut self, resolver: AwsResolver) -> Self {
        self.aws = resolver;
        self
    }

    /// Override the Azure AD authority host
    pub fn azure_authority_host(mut self, host: impl Into<String>) -> Self {
        self.azure_authority_host = Some(host.into());
        self
    }

    /// Override the Azure managed identity endpoint
    pub fn azure_imds_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.azure_imds_endpoint = Some(endpoint.into());
        self
    }

    /// Resolve the cloud block of `spec`
    pub async fn resolve(
        &self,
        spec: &ConnectionSpec,
        http: reqwest::Client,
    ) -> Result<ResolvedCloudConfig> {
        match spec.cloud() {
            CloudConfig::None => Ok(ResolvedCloudConfig::none(http)),
            CloudConfig::Aws(aws) => {
                let host = spec.endpoint().and_then(|ep| ep.host_port()).map(|(h, _)| h);
                let resolved = self.aws.resolve(aws, host).await?;
                Ok(ResolvedCloudConfig {
                    aws: Some(resolved),
                    azure: None,
                    http,
                })
            }
            CloudConfig::Azure(azure) => {
                let mut chain = AzureCredentialChain::new(azure, http.clone());
                if let Some(host) = &self.azure_authority_host {
                    chain = chain.authority_host(host.clone());
                }
                if let Some(endpoint) = &self.azure_imds_endpoint {
                    chain = chain.imds_endpoint(endpoint.clone());
                }
                tracing::debug!(
                    environment = ?chain.environment(),
                    sources = chain.sources().len(),
                    "resolved Azure credential chain"
                );
                Ok(ResolvedCloudConfig {
                    aws: None,
                    azure: Some(Arc::new(chain)),
                    http,
                })
            }
        }
    }
}

/// Resolve the cloud block of `spec` against the public cloud endpoints
pub async fn resolve(spec: &ConnectionSpec, http: reqwest::Client) -> Result<ResolvedCloudConfig> {
    CloudResolver::new().resolve(spec, http).await
}

/// HTTP client for identity and control-plane calls
pub fn http_client(proxy: Option<&ProxyConfig>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .user_agent(concat!("mysql-provider/", env!("CARGO_PKG_VERSION")));

    if let Some(proxy) = proxy {
        builder = builder.proxy(proxy.to_reqwest()?);
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_blocks_rejected() {
        let err = CloudConfig::from_blocks(
            Some(&AwsConfigBlock::default()),
            Some(&AzureConfigBlock::default()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_single_block() {
        let cloud = CloudConfig::from_blocks(None, Some(&AzureConfigBlock::default())).unwrap();
        assert!(cloud.azure().is_some());
        assert!(cloud.aws().is_none());
        assert!(cloud.data_api().is_none());

        assert_eq!(CloudConfig::from_blocks(None, None).unwrap(), CloudConfig::None);
    }

    #[test]
    fn test_data_api_target() {
        let block = AwsConfigBlock {
            region: "us-east-1".into(),
            use_rds_data_api: true,
            cluster_arn: "arn:aws:rds:us-east-1:123456789012:cluster:c".into(),
            secret_arn: "arn:aws:secretsmanager:us-east-1:123456789012:secret:s".into(),
            ..Default::default()
        };
        let cloud = CloudConfig::from_blocks(Some(&block), None).unwrap();
        assert!(cloud.data_api().is_some());
    }

    #[test]
    fn test_http_client_with_proxy() {
        let proxy = ProxyConfig::parse("socks5h://user:pw@127.0.0.1:1080").unwrap();
        assert!(http_client(Some(&proxy)).is_ok());
        assert!(http_client(None).is_ok());
    }
}
