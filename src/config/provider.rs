//! Provider configuration input
//!
//! [`ProviderConfig`] is the raw configuration block handed over by the host.
//! Nothing here is validated; [`ConnectionSpec::resolve`](super::ConnectionSpec::resolve)
//! turns it into an immutable, validated spec.
//!
//! Unset fields can be filled from environment variables. Explicit values always
//! win, and empty environment values count as unset.

use serde::Deserialize;
use std::collections::BTreeMap;

/// Default total budget for connection retries (five minutes)
pub const DEFAULT_CONNECT_RETRY_TIMEOUT_SEC: u64 = 300;

/// Top-level environment variable fallbacks (field, candidates in priority order)
const PROVIDER_ENV_MAPPING: &[(&str, &[&str])] = &[
    ("endpoint", &["MYSQL_ENDPOINT"]),
    ("username", &["MYSQL_USERNAME"]),
    ("password", &["MYSQL_PASSWORD"]),
    ("tls", &["MYSQL_TLS_CONFIG"]),
    ("proxy", &["ALL_PROXY", "all_proxy"]),
];

/// Azure block environment variable fallbacks
const AZURE_ENV_MAPPING: &[(&str, &[&str])] = &[
    ("client_id", &["AZURE_CLIENT_ID", "ARM_CLIENT_ID"]),
    ("client_secret", &["AZURE_CLIENT_SECRET", "ARM_CLIENT_SECRET"]),
    ("tenant_id", &["AZURE_TENANT_ID", "ARM_TENANT_ID"]),
    ("environment", &["AZURE_ENVIRONMENT", "ARM_ENVIRONMENT"]),
];

/// Provider configuration block
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Server endpoint (host:port, socket path, or aws:// azure:// cloudsql:// URL)
    pub endpoint: Option<String>,
    /// Username
    pub username: Option<String>,
    /// Password. `Some("")` (passwordless) is distinct from `None` (unset).
    pub password: Option<String>,
    /// SOCKS5 proxy URL
    pub proxy: Option<String>,
    /// TLS mode: false, true, skip-verify or custom
    pub tls: Option<String>,
    /// Custom TLS material
    pub custom_tls: Option<CustomTlsBlock>,
    /// Maximum lifetime of a pooled connection in seconds (0 = unlimited)
    pub max_conn_lifetime_sec: u64,
    /// Maximum number of open connections (0 = driver default)
    pub max_open_conns: usize,
    /// Total retry budget for establishing the first connection
    pub connect_retry_timeout_sec: Option<u64>,
    /// Session variables passed verbatim to the server on connect
    pub conn_params: BTreeMap<String, String>,
    /// Authentication plugin: native or cleartext
    pub authentication_plugin: Option<String>,
    /// Cloud SQL IAM database authentication
    pub iam_database_authentication: bool,
    /// Use the private IP of a Cloud SQL instance
    pub private_ip: bool,
    /// Azure credential block
    pub azure_config: Option<AzureConfigBlock>,
    /// AWS credential block
    pub aws_config: Option<AwsConfigBlock>,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("proxy", &self.proxy.as_ref().map(|_| "<proxy>"))
            .field("tls", &self.tls)
            .field("custom_tls", &self.custom_tls)
            .field("max_conn_lifetime_sec", &self.max_conn_lifetime_sec)
            .field("max_open_conns", &self.max_open_conns)
            .field("connect_retry_timeout_sec", &self.connect_retry_timeout_sec)
            .field("conn_params", &self.conn_params)
            .field("authentication_plugin", &self.authentication_plugin)
            .field("iam_database_authentication", &self.iam_database_authentication)
            .field("private_ip", &self.private_ip)
            .field("azure_config", &self.azure_config)
            .field("aws_config", &self.aws_config)
            .finish()
    }
}

/// Custom TLS material block
///
/// Each PEM field is either inline PEM content or a filesystem path.
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustomTlsBlock {
    /// Registry key for the composed TLS configuration (generated if absent)
    pub config_key: Option<String>,
    /// CA certificate
    pub ca_cert: Option<String>,
    /// Client certificate
    pub client_cert: Option<String>,
    /// Client private key
    pub client_key: Option<String>,
}

impl std::fmt::Debug for CustomTlsBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomTlsBlock")
            .field("config_key", &self.config_key)
            .field("ca_cert", &self.ca_cert.as_ref().map(|_| "<pem>"))
            .field("client_cert", &self.client_cert.as_ref().map(|_| "<pem>"))
            .field("client_key", &self.client_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// AWS configuration block
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AwsConfigBlock {
    /// AWS region
    pub region: String,
    /// Shared-config profile name
    pub profile: String,
    /// Static access key id (requires `secret_key`)
    pub access_key: String,
    /// Static secret access key (requires `access_key`)
    pub secret_key: String,
    /// Role to assume on top of the base credential chain
    pub role_arn: String,
    /// Authenticate with RDS IAM tokens
    pub aws_rds_iam_auth: bool,
    /// Use the RDS Data API instead of a network connection
    pub use_rds_data_api: bool,
    /// Aurora cluster ARN (Data API)
    pub cluster_arn: String,
    /// Secrets Manager secret ARN (Data API)
    pub secret_arn: String,
}

impl std::fmt::Debug for AwsConfigBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsConfigBlock")
            .field("region", &self.region)
            .field("profile", &self.profile)
            .field("access_key", &self.access_key)
            .field("secret_key", &if self.secret_key.is_empty() { "" } else { "***" })
            .field("role_arn", &self.role_arn)
            .field("aws_rds_iam_auth", &self.aws_rds_iam_auth)
            .field("use_rds_data_api", &self.use_rds_data_api)
            .field("cluster_arn", &self.cluster_arn)
            .field("secret_arn", &self.secret_arn)
            .finish()
    }
}

/// Azure configuration block
#[derive(Clone, Default, Deserialize)]
#[serde(default)]
pub struct AzureConfigBlock {
    /// Application (client) id
    pub client_id: String,
    /// Client secret
    pub client_secret: String,
    /// Directory (tenant) id
    pub tenant_id: String,
    /// Cloud environment: public, china, german or usgovernment
    pub environment: String,
}

impl std::fmt::Debug for AzureConfigBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureConfigBlock")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &if self.client_secret.is_empty() { "" } else { "***" },
            )
            .field("tenant_id", &self.tenant_id)
            .field("environment", &self.environment)
            .finish()
    }
}

impl ProviderConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the username
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the password
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the proxy URL
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Set the TLS mode string
    pub fn tls(mut self, tls: impl Into<String>) -> Self {
        self.tls = Some(tls.into());
        self
    }

    /// Set the custom TLS block
    pub fn custom_tls(mut self, block: CustomTlsBlock) -> Self {
        self.custom_tls = Some(block);
        self
    }

    /// Set the pool limits
    pub fn pool_limits(mut self, max_open_conns: usize, max_conn_lifetime_sec: u64) -> Self {
        self.max_open_conns = max_open_conns;
        self.max_conn_lifetime_sec = max_conn_lifetime_sec;
        self
    }

    /// Set the connect retry budget in seconds
    pub fn connect_retry_timeout_sec(mut self, secs: u64) -> Self {
        self.connect_retry_timeout_sec = Some(secs);
        self
    }

    /// Add a session parameter
    pub fn conn_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.conn_params.insert(key.into(), value.into());
        self
    }

    /// Set the authentication plugin
    pub fn authentication_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.authentication_plugin = Some(plugin.into());
        self
    }

    /// Enable Cloud SQL IAM database authentication
    pub fn iam_database_authentication(mut self, enabled: bool) -> Self {
        self.iam_database_authentication = enabled;
        self
    }

    /// Use the private IP path for Cloud SQL
    pub fn private_ip(mut self, enabled: bool) -> Self {
        self.private_ip = enabled;
        self
    }

    /// Set the AWS block
    pub fn aws_config(mut self, block: AwsConfigBlock) -> Self {
        self.aws_config = Some(block);
        self
    }

    /// Set the Azure block
    pub fn azure_config(mut self, block: AzureConfigBlock) -> Self {
        self.azure_config = Some(block);
        self
    }

    /// Fill unset fields from the process environment
    pub fn with_env_fallback(self) -> Self {
        self.with_env_lookup(|name| std::env::var(name).ok())
    }

    /// Fill unset fields using a custom environment lookup function.
    ///
    /// Allows injecting values without mutating the process environment.
    pub fn with_env_lookup<F>(mut self, env_lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for (field, candidates) in PROVIDER_ENV_MAPPING {
            let slot = match *field {
                "endpoint" => &mut self.endpoint,
                "username" => &mut self.username,
                "password" => &mut self.password,
                "tls" => &mut self.tls,
                "proxy" => &mut self.proxy,
                _ => continue,
            };
            if slot.is_none() {
                *slot = first_non_empty(&env_lookup, candidates);
            }
        }

        let azure_endpoint = self
            .endpoint
            .as_deref()
            .is_some_and(|ep| ep.trim_start().starts_with("azure://"));
        if azure_endpoint && self.azure_config.is_none() {
            self.azure_config = Some(AzureConfigBlock::default());
        }

        if let Some(azure) = self.azure_config.as_mut() {
            for (field, candidates) in AZURE_ENV_MAPPING {
                let slot = match *field {
                    "client_id" => &mut azure.client_id,
                    "client_secret" => &mut azure.client_secret,
                    "tenant_id" => &mut azure.tenant_id,
                    "environment" => &mut azure.environment,
                    _ => continue,
                };
                if slot.is_empty() {
                    if let Some(value) = first_non_empty(&env_lookup, candidates) {
                        *slot = value;
                    }
                }
            }
        }

        self
    }
}

fn first_non_empty<F>(env_lookup: &F, candidates: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    candidates
        .iter()
        .filter_map(|name| env_lookup(name))
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_fills_unset_fields() {
        let config = ProviderConfig::new().with_env_lookup(lookup(&[
            ("MYSQL_ENDPOINT", "db:3306"),
            ("MYSQL_USERNAME", "app"),
            ("MYSQL_PASSWORD", "pw"),
            ("MYSQL_TLS_CONFIG", "true"),
        ]));
        assert_eq!(config.endpoint.as_deref(), Some("db:3306"));
        assert_eq!(config.username.as_deref(), Some("app"));
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert_eq!(config.tls.as_deref(), Some("true"));
    }

    #[test]
    fn test_explicit_values_win() {
        let config = ProviderConfig::new()
            .endpoint("explicit:3306")
            .password("")
            .with_env_lookup(lookup(&[
                ("MYSQL_ENDPOINT", "env:3306"),
                ("MYSQL_PASSWORD", "from-env"),
            ]));
        assert_eq!(config.endpoint.as_deref(), Some("explicit:3306"));
        // explicit empty password is kept: passwordless auth
        assert_eq!(config.password.as_deref(), Some(""));
    }

    #[test]
    fn test_empty_env_value_is_unset() {
        let config = ProviderConfig::new().with_env_lookup(lookup(&[("MYSQL_PASSWORD", "")]));
        assert!(config.password.is_none());
    }

    #[test]
    fn test_proxy_lowercase_fallback() {
        let config =
            ProviderConfig::new().with_env_lookup(lookup(&[("all_proxy", "socks5://p:1080")]));
        assert_eq!(config.proxy.as_deref(), Some("socks5://p:1080"));

        let config = ProviderConfig::new().with_env_lookup(lookup(&[
            ("ALL_PROXY", "socks5://upper:1080"),
            ("all_proxy", "socks5://lower:1080"),
        ]));
        assert_eq!(config.proxy.as_deref(), Some("socks5://upper:1080"));
    }

    #[test]
    fn test_azure_env_prefers_azure_over_arm() {
        let config = ProviderConfig::new()
            .azure_config(AzureConfigBlock::default())
            .with_env_lookup(lookup(&[
                ("AZURE_CLIENT_ID", "azure-id"),
                ("ARM_CLIENT_ID", "arm-id"),
                ("ARM_TENANT_ID", "arm-tenant"),
                ("ARM_ENVIRONMENT", "china"),
            ]));
        let azure = config.azure_config.unwrap();
        assert_eq!(azure.client_id, "azure-id");
        assert_eq!(azure.tenant_id, "arm-tenant");
        assert_eq!(azure.environment, "china");
        assert!(azure.client_secret.is_empty());
    }

    #[test]
    fn test_azure_env_ignored_without_block() {
        let config =
            ProviderConfig::new().with_env_lookup(lookup(&[("AZURE_CLIENT_ID", "azure-id")]));
        assert!(config.azure_config.is_none());
    }

    #[test]
    fn test_azure_endpoint_creates_block_from_env() {
        let config = ProviderConfig::new()
            .endpoint("azure://srv.mysql.database.azure.com")
            .with_env_lookup(lookup(&[("ARM_TENANT_ID", "tenant")]));
        assert_eq!(config.azure_config.unwrap().tenant_id, "tenant");
    }

    #[test]
    fn test_deserialize_from_json() {
        let json = serde_json::json!({
            "endpoint": "aws://db.us-east-1.rds.amazonaws.com:3306",
            "username": "app",
            "max_open_conns": 5,
            "conn_params": { "sql_mode": "'STRICT_ALL_TABLES'" },
            "aws_config": { "region": "us-east-1", "aws_rds_iam_auth": true }
        });
        let config: ProviderConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.max_open_conns, 5);
        assert_eq!(config.conn_params["sql_mode"], "'STRICT_ALL_TABLES'");
        let aws = config.aws_config.unwrap();
        assert!(aws.aws_rds_iam_auth);
        assert_eq!(aws.region, "us-east-1");
        assert!(config.password.is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let aws = AwsConfigBlock {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "wJalrXUtnFEMI".into(),
            ..Default::default()
        };
        let debug = format!("{:?}", aws);
        assert!(!debug.contains("wJalrXUtnFEMI"));

        let azure = AzureConfigBlock {
            client_secret: "very-secret".into(),
            ..Default::default()
        };
        assert!(!format!("{:?}", azure).contains("very-secret"));

        let config = ProviderConfig::new()
            .password("hunter2")
            .proxy("socks5://user:proxy-pass@p:1080");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("proxy-pass"));
    }
}
