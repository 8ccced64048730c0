//! AWS configuration resolution
//!
//! [`AwsConfig::from_block`] validates the `aws_config` block without touching
//! the network. [`AwsResolver::resolve`] then loads the SDK configuration
//! (region, profile, static keys or the default chain) and wraps it in an
//! assume-role provider when `role_arn` is set.

use crate::auth::{infer_rds_region, SecretString};
use crate::config::AwsConfigBlock;
use crate::{Error, Result};
use aws_config::sts::AssumeRoleProvider;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_types::region::Region;
use aws_types::SdkConfig;
use std::fmt;
use std::time::Duration;

/// Session name used when assuming `role_arn`
const ROLE_SESSION_NAME: &str = "mysql-provider";

/// Bound on the eager assume-role credential check
const ROLE_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Static access key pair
#[derive(Clone, PartialEq, Eq)]
pub struct StaticKeys {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: SecretString,
}

impl fmt::Debug for StaticKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeys")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &self.secret_access_key)
            .finish()
    }
}

/// Aurora cluster and secret addressed by the Data API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataApiTarget {
    /// Aurora cluster ARN
    pub cluster_arn: String,
    /// Secrets Manager secret ARN holding the database credentials
    pub secret_arn: String,
}

/// What the AWS block is used for
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AwsMode {
    /// Credentials only (no auth mode selected by flags)
    #[default]
    Credentials,
    /// RDS IAM authentication tokens
    RdsIam,
    /// RDS Data API
    DataApi(DataApiTarget),
}

/// Validated AWS configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AwsConfig {
    /// Explicit region
    pub region: Option<String>,
    /// Shared-config profile
    pub profile: Option<String>,
    /// Static key pair (both-or-neither)
    pub static_keys: Option<StaticKeys>,
    /// Role to assume
    pub role_arn: Option<String>,
    /// Mode selected by the flags
    pub mode: AwsMode,
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl AwsConfig {
    /// Validate an `aws_config` block.
    ///
    /// Checked in order: access/secret key pairing, mutually exclusive mode
    /// flags, Data API ARNs.
    pub fn from_block(block: &AwsConfigBlock) -> Result<Self> {
        let static_keys = match (non_empty(&block.access_key), non_empty(&block.secret_key)) {
            (Some(access_key_id), Some(secret)) => Some(StaticKeys {
                access_key_id,
                secret_access_key: SecretString::new(secret),
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(Error::Config(
                    "aws_config.access_key is set but aws_config.secret_key is missing".into(),
                ))
            }
            (None, Some(_)) => {
                return Err(Error::Config(
                    "aws_config.secret_key is set but aws_config.access_key is missing".into(),
                ))
            }
        };

        if block.use_rds_data_api && block.aws_rds_iam_auth {
            return Err(Error::Config(
                "aws_config.use_rds_data_api and aws_config.aws_rds_iam_auth are mutually exclusive"
                    .into(),
            ));
        }

        let mode = if block.use_rds_data_api {
            let cluster_arn = non_empty(&block.cluster_arn);
            let secret_arn = non_empty(&block.secret_arn);
            match (cluster_arn, secret_arn) {
                (Some(cluster_arn), Some(secret_arn)) => AwsMode::DataApi(DataApiTarget {
                    cluster_arn,
                    secret_arn,
                }),
                _ => {
                    return Err(Error::Config(
                        "aws_config.use_rds_data_api requires both cluster_arn and secret_arn"
                            .into(),
                    ))
                }
            }
        } else if block.aws_rds_iam_auth {
            AwsMode::RdsIam
        } else {
            AwsMode::Credentials
        };

        Ok(Self {
            region: non_empty(&block.region),
            profile: non_empty(&block.profile),
            static_keys,
            role_arn: non_empty(&block.role_arn),
            mode,
        })
    }

    /// Data API target, if Data API mode is selected
    pub fn data_api(&self) -> Option<&DataApiTarget> {
        match &self.mode {
            AwsMode::DataApi(target) => Some(target),
            _ => None,
        }
    }

    /// Whether RDS IAM authentication is requested by flag
    pub fn rds_iam(&self) -> bool {
        self.mode == AwsMode::RdsIam
    }
}

/// Outcome of the eager assume-role credential check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleCheck {
    /// No `role_arn` configured
    NotApplicable,
    /// The assumed role produced credentials
    Verified,
    /// Retrieval failed; the first real use will fail the same way if the problem persists
    Unverified(String),
}

/// Resolved AWS SDK configuration, shared by every credential acquisition
#[derive(Clone)]
pub struct ResolvedAwsConfig {
    config: AwsConfig,
    sdk: SdkConfig,
    role_check: RoleCheck,
}

impl fmt::Debug for ResolvedAwsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAwsConfig")
            .field("config", &self.config)
            .field("region", &self.region())
            .field("role_check", &self.role_check)
            .finish()
    }
}

impl ResolvedAwsConfig {
    /// The validated input
    pub fn config(&self) -> &AwsConfig {
        &self.config
    }

    /// SDK configuration for building service clients
    pub fn sdk_config(&self) -> &SdkConfig {
        &self.sdk
    }

    /// Effective region
    pub fn region(&self) -> Option<&str> {
        self.sdk.region().map(|r| r.as_ref())
    }

    /// Effective credential chain (assume-role wrapped when `role_arn` is set)
    pub fn credentials_provider(&self) -> Option<SharedCredentialsProvider> {
        self.sdk.credentials_provider()
    }

    /// Result of the eager assume-role check
    pub fn role_check(&self) -> &RoleCheck {
        &self.role_check
    }

    /// Fail with `Error::Auth` unless the assumed role was verified (or none is configured)
    pub fn require_verified_role(&self) -> Result<()> {
        match &self.role_check {
            RoleCheck::NotApplicable | RoleCheck::Verified => Ok(()),
            RoleCheck::Unverified(reason) => Err(Error::Auth(format!(
                "could not assume role {}: {}",
                self.config.role_arn.as_deref().unwrap_or_default(),
                reason
            ))),
        }
    }
}

/// Loads SDK configuration for a validated [`AwsConfig`]
#[derive(Debug, Clone)]
pub struct AwsResolver {
    endpoint_url: Option<String>,
    role_check_timeout: Duration,
}

impl Default for AwsResolver {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            role_check_timeout: ROLE_CHECK_TIMEOUT,
        }
    }
}

impl AwsResolver {
    /// Create a resolver using the public AWS endpoints
    pub fn new() -> Self {
        Self::default()
    }

    /// Override every service endpoint (local emulators, tests)
    pub fn endpoint_url(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }

    /// Bound on the eager assume-role check
    pub fn role_check_timeout(mut self, timeout: Duration) -> Self {
        self.role_check_timeout = timeout;
        self
    }

    /// Resolve the SDK configuration.
    ///
    /// `endpoint_host` is used to infer the region from an RDS hostname when
    /// neither the block nor the environment provides one.
    pub async fn resolve(
        &self,
        config: &AwsConfig,
        endpoint_host: Option<&str>,
    ) -> Result<ResolvedAwsConfig> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let Some(keys) = &config.static_keys {
            loader = loader.credentials_provider(Credentials::new(
                keys.access_key_id.clone(),
                keys.secret_access_key.expose().to_string(),
                None,
                None,
                "mysql-provider-static",
            ));
        }
        if let Some(url) = &self.endpoint_url {
            loader = loader.endpoint_url(url);
        }

        let mut sdk = loader.load().await;

        if sdk.region().is_none() {
            if let Some(region) = endpoint_host.and_then(infer_rds_region) {
                tracing::debug!(region = %region, "inferred AWS region from endpoint");
                sdk = sdk.into_builder().region(Region::new(region)).build();
            }
        }

        let role_check = match &config.role_arn {
            None => RoleCheck::NotApplicable,
            Some(role_arn) => {
                let provider = AssumeRoleProvider::builder(role_arn.clone())
                    .session_name(ROLE_SESSION_NAME)
                    .configure(&sdk)
                    .build()
                    .await;
                let shared = SharedCredentialsProvider::new(provider);
                let check = self.check_role(&shared, role_arn).await;
                sdk = sdk.into_builder().credentials_provider(shared).build();
                check
            }
        };

        tracing::debug!(
            region = ?sdk.region().map(|r| r.as_ref().to_string()),
            profile = ?config.profile,
            static_keys = config.static_keys.is_some(),
            role = ?config.role_arn,
            "resolved AWS configuration"
        );

        Ok(ResolvedAwsConfig {
            config: config.clone(),
            sdk,
            role_check,
        })
    }

    /// One eager credential retrieval through the assumed role.
    ///
    /// A failure is reported as [`RoleCheck::Unverified`] and logged; it is not
    /// an error at this layer because the environment may lack live AWS access
    /// until the first real connection.
    async fn check_role(&self, provider: &SharedCredentialsProvider, role_arn: &str) -> RoleCheck {
        match tokio::time::timeout(self.role_check_timeout, provider.provide_credentials()).await {
            Ok(Ok(_)) => {
                tracing::debug!(role = %role_arn, "assumed role verified");
                RoleCheck::Verified
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                tracing::warn!(
                    role = %role_arn,
                    error = %reason,
                    "could not verify assumed role; connection attempts will fail if this persists"
                );
                RoleCheck::Unverified(reason)
            }
            Err(_) => {
                let reason = format!("timed out after {:?}", self.role_check_timeout);
                tracing::warn!(role = %role_arn, error = %reason, "could not verify assumed role");
                RoleCheck::Unverified(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> AwsConfigBlock {
        AwsConfigBlock::default()
    }

    #[test]
    fn test_empty_block_is_valid() {
        let config = AwsConfig::from_block(&block()).unwrap();
        assert_eq!(config, AwsConfig::default());
    }

    #[test]
    fn test_region_only() {
        let config = AwsConfig::from_block(&AwsConfigBlock {
            region: "us-west-2".into(),
            ..block()
        })
        .unwrap();
        assert_eq!(config.region.as_deref(), Some("us-west-2"));
    }

    #[test]
    fn test_key_pair() {
        let config = AwsConfig::from_block(&AwsConfigBlock {
            access_key: "AKID".into(),
            secret_key: "SECRET".into(),
            ..block()
        })
        .unwrap();
        let keys = config.static_keys.unwrap();
        assert_eq!(keys.access_key_id, "AKID");
        assert!(!format!("{:?}", keys).contains("SECRET"));
    }

    #[test]
    fn test_partial_key_pair_fails() {
        for (ak, sk) in [("AKID", ""), ("", "SECRET")] {
            let err = AwsConfig::from_block(&AwsConfigBlock {
                access_key: ak.into(),
                secret_key: sk.into(),
                ..block()
            })
            .unwrap_err();
            assert!(matches!(err, Error::Config(_)));
            assert!(!err.to_string().contains("SECRET"));
        }
    }

    #[test]
    fn test_mode_flags_are_exclusive() {
        let err = AwsConfig::from_block(&AwsConfigBlock {
            aws_rds_iam_auth: true,
            use_rds_data_api: true,
            cluster_arn: "arn:c".into(),
            secret_arn: "arn:s".into(),
            ..block()
        })
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_data_api_requires_both_arns() {
        for (c, s) in [("arn:c", ""), ("", "arn:s"), ("", "")] {
            let err = AwsConfig::from_block(&AwsConfigBlock {
                use_rds_data_api: true,
                cluster_arn: c.into(),
                secret_arn: s.into(),
                ..block()
            })
            .unwrap_err();
            assert!(matches!(err, Error::Config(_)));
        }
    }

    #[test]
    fn test_key_pairing_checked_before_flags() {
        let err = AwsConfig::from_block(&AwsConfigBlock {
            access_key: "AKID".into(),
            aws_rds_iam_auth: true,
            use_rds_data_api: true,
            ..block()
        })
        .unwrap_err();
        assert!(err.to_string().contains("secret_key"));
    }

    #[test]
    fn test_data_api_target() {
        let config = AwsConfig::from_block(&AwsConfigBlock {
            use_rds_data_api: true,
            cluster_arn: "arn:aws:rds:us-east-1:123:cluster:c".into(),
            secret_arn: "arn:aws:secretsmanager:us-east-1:123:secret:s".into(),
            ..block()
        })
        .unwrap();
        assert!(config.data_api().is_some());
        assert!(!config.rds_iam());
    }

    #[tokio::test]
    async fn test_resolve_with_static_keys() {
        let config = AwsConfig::from_block(&AwsConfigBlock {
            region: "eu-west-1".into(),
            access_key: "AKID".into(),
            secret_key: "SECRET".into(),
            ..block()
        })
        .unwrap();
        let resolved = AwsResolver::new().resolve(&config, None).await.unwrap();
        assert_eq!(resolved.region(), Some("eu-west-1"));
        assert_eq!(resolved.role_check(), &RoleCheck::NotApplicable);

        let creds = resolved
            .credentials_provider()
            .unwrap()
            .provide_credentials()
            .await
            .unwrap();
        assert_eq!(creds.access_key_id(), "AKID");
    }

    #[tokio::test]
    async fn test_region_inferred_from_rds_host() {
        let config = AwsConfig::from_block(&AwsConfigBlock {
            access_key: "AKID".into(),
            secret_key: "SECRET".into(),
            ..block()
        })
        .unwrap();
        let resolved = AwsResolver::new()
            .resolve(&config, Some("db.abc.ap-south-1.rds.amazonaws.com"))
            .await
            .unwrap();
        // the environment may already provide a region
        assert!(resolved.region().is_some());
    }

    #[tokio::test]
    async fn test_role_check_failure_is_tolerated() {
        let config = AwsConfig::from_block(&AwsConfigBlock {
            region: "us-east-1".into(),
            access_key: "AKID".into(),
            secret_key: "SECRET".into(),
            role_arn: "arn:aws:iam::123456789012:role/test".into(),
            ..block()
        })
        .unwrap();

        // nothing listens on port 9: STS calls fail fast
        let resolved = AwsResolver::new()
            .endpoint_url("http://127.0.0.1:9")
            .role_check_timeout(Duration::from_secs(5))
            .resolve(&config, None)
            .await
            .unwrap();

        assert!(matches!(resolved.role_check(), RoleCheck::Unverified(_)));
        let err = resolved.require_verified_role().unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }
}
