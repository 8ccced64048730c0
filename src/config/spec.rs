//! Validated connection spec
//!
//! [`ConnectionSpec::resolve`] validates a [`ProviderConfig`] once, before any
//! secret is fetched or socket opened, and produces an immutable spec. Every
//! contradiction in the input is a [`Error::Config`].

use super::provider::{ProviderConfig, DEFAULT_CONNECT_RETRY_TIMEOUT_SEC};
use crate::auth::{AuthMode, SecretString};
use crate::client::Endpoint;
use crate::cloud::{AwsConfig, AzureConfig, CloudConfig, CloudSqlIpType, DataApiTarget};
use crate::connection::{CustomTls, ProxyConfig};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// How the server is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportScheme {
    /// TCP or Unix socket dial
    Direct,
    /// Cloud SQL instance, address looked up through the Admin API
    CloudSql,
    /// Stateless RDS Data API calls
    AwsDataApi,
}

impl TransportScheme {
    /// Stable lowercase label (used in metrics and logs)
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportScheme::Direct => "direct",
            TransportScheme::CloudSql => "cloudsql",
            TransportScheme::AwsDataApi => "data_api",
        }
    }
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TlsMode {
    /// Plaintext
    #[default]
    Off,
    /// TLS verified against the system roots
    On,
    /// TLS without certificate verification
    SkipVerify,
    /// TLS with the custom material of `custom_tls`
    Custom,
}

impl TlsMode {
    /// Parse a `tls` value. `custom_key` is the custom block's `config_key`,
    /// which is accepted as an alias of `custom`.
    pub fn parse(value: &str, custom_key: Option<&str>) -> Result<Self> {
        let value = value.trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "false" | "off" => Ok(TlsMode::Off),
            "true" | "on" => Ok(TlsMode::On),
            "skip-verify" | "preferred" => Ok(TlsMode::SkipVerify),
            "custom" => Ok(TlsMode::Custom),
            _ if custom_key == Some(value) => Ok(TlsMode::Custom),
            other => Err(Error::Config(format!(
                "invalid tls value '{}': expected false, true, skip-verify or custom",
                other
            ))),
        }
    }

    /// Whether the connection is encrypted
    pub fn is_enabled(&self) -> bool {
        *self != TlsMode::Off
    }
}

/// Client authentication plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AuthPlugin {
    /// `mysql_native_password` / `caching_sha2_password` negotiation
    #[default]
    Native,
    /// `mysql_clear_password`, needed for IAM and AD tokens
    Cleartext,
}

impl AuthPlugin {
    /// Parse an `authentication_plugin` value
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "native" | "mysql_native_password" => Ok(AuthPlugin::Native),
            "cleartext" | "mysql_clear_password" => Ok(AuthPlugin::Cleartext),
            other => Err(Error::Config(format!(
                "invalid authentication_plugin '{}': expected native or cleartext",
                other
            ))),
        }
    }
}

/// Pool sizing and recycling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolPolicy {
    /// Maximum lifetime of a connection (`None` = unlimited)
    pub max_lifetime: Option<Duration>,
    /// Maximum number of open connections (`None` = driver default)
    pub max_open_conns: Option<usize>,
}

impl PoolPolicy {
    /// Build from the raw config values (0 means unset)
    pub fn new(max_lifetime_sec: u64, max_open_conns: usize) -> Self {
        Self {
            max_lifetime: (max_lifetime_sec > 0).then(|| Duration::from_secs(max_lifetime_sec)),
            max_open_conns: (max_open_conns > 0).then_some(max_open_conns),
        }
    }

    /// Whether any limit is configured
    pub fn is_configured(&self) -> bool {
        self.max_lifetime.is_some() || self.max_open_conns.is_some()
    }
}

/// Immutable, validated connection spec
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    endpoint: Option<Endpoint>,
    username: String,
    password: Option<SecretString>,
    transport: TransportScheme,
    auth_mode: AuthMode,
    tls: TlsMode,
    custom_tls: Option<CustomTls>,
    auth_plugin: AuthPlugin,
    conn_params: BTreeMap<String, String>,
    pool: PoolPolicy,
    cloud: CloudConfig,
    private_ip: bool,
    iam_database_auth: bool,
    proxy: Option<ProxyConfig>,
    connect_retry_timeout: Duration,
}

impl ConnectionSpec {
    /// Validate `config` into a spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if:
    /// - the cloud blocks are contradictory (see [`AwsConfig::from_block`])
    /// - the endpoint or username is missing outside Data API mode
    /// - the endpoint scheme does not match the configured cloud block
    /// - RDS IAM authentication is requested for a non-TCP endpoint
    /// - `tls`, `authentication_plugin`, `proxy` or a `conn_params` key is invalid
    pub fn resolve(config: &ProviderConfig) -> Result<Self> {
        let mut cloud =
            CloudConfig::from_blocks(config.aws_config.as_ref(), config.azure_config.as_ref())?;
        let data_api = cloud.data_api().is_some();

        let endpoint = match config.endpoint.as_deref().map(str::trim) {
            Some(ep) if !ep.is_empty() => Some(Endpoint::parse(ep)?),
            _ => None,
        };

        let username = config
            .username
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        if data_api {
            if endpoint.is_some() {
                tracing::warn!("endpoint is ignored in Data API mode");
            }
            if config.password.is_some() {
                tracing::warn!("password is ignored in Data API mode; the secret_arn supplies credentials");
            }
        } else {
            if endpoint.is_none() {
                return Err(Error::Config("endpoint is required".into()));
            }
            if username.is_empty() {
                return Err(Error::Config("username is required".into()));
            }
        }

        match (&endpoint, &cloud) {
            (Some(Endpoint::Aws { .. }), CloudConfig::Azure(_)) => {
                return Err(Error::Config(
                    "aws:// endpoint cannot be used with azure_config".into(),
                ))
            }
            (Some(Endpoint::Azure { .. }), CloudConfig::Aws(_)) => {
                return Err(Error::Config(
                    "azure:// endpoint cannot be used with aws_config".into(),
                ))
            }
            (Some(Endpoint::Aws { .. }), CloudConfig::None) if !data_api => {
                cloud = CloudConfig::Aws(AwsConfig::default());
            }
            (Some(Endpoint::Azure { .. }), CloudConfig::None) => {
                cloud = CloudConfig::Azure(AzureConfig::default());
            }
            _ => {}
        }

        let auth_mode = select_auth_mode(&cloud, endpoint.as_ref(), config.iam_database_authentication)?;

        let transport = if data_api {
            TransportScheme::AwsDataApi
        } else if matches!(endpoint, Some(Endpoint::CloudSql(_))) {
            TransportScheme::CloudSql
        } else {
            TransportScheme::Direct
        };

        let (tls, custom_tls) = select_tls(config, auth_mode, data_api)?;

        let mut auth_plugin = AuthPlugin::parse(config.authentication_plugin.as_deref().unwrap_or(""))?;
        if auth_mode.is_token() && auth_plugin != AuthPlugin::Cleartext {
            if config.authentication_plugin.is_some() {
                tracing::warn!(
                    mode = %auth_mode,
                    "token authentication requires the cleartext plugin; overriding authentication_plugin"
                );
            }
            auth_plugin = AuthPlugin::Cleartext;
        }

        for key in config.conn_params.keys() {
            validate_param_key(key)?;
        }

        let proxy = match config.proxy.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => Some(ProxyConfig::parse(p)?),
            _ => None,
        };
        let proxy = match proxy {
            Some(_) if data_api => {
                tracing::warn!("proxy is ignored in Data API mode");
                None
            }
            Some(_) if matches!(endpoint, Some(Endpoint::Unix(_))) => {
                return Err(Error::Config(
                    "proxy cannot be used with a Unix socket endpoint".into(),
                ))
            }
            other => other,
        };

        let spec = Self {
            endpoint: if data_api { None } else { endpoint },
            username,
            password: if data_api {
                None
            } else {
                config.password.clone().map(SecretString::new)
            },
            transport,
            auth_mode,
            tls,
            custom_tls,
            auth_plugin,
            conn_params: config.conn_params.clone(),
            pool: PoolPolicy::new(config.max_conn_lifetime_sec, config.max_open_conns),
            cloud,
            private_ip: config.private_ip,
            iam_database_auth: config.iam_database_authentication,
            proxy,
            connect_retry_timeout: Duration::from_secs(
                config
                    .connect_retry_timeout_sec
                    .unwrap_or(DEFAULT_CONNECT_RETRY_TIMEOUT_SEC),
            ),
        };

        tracing::debug!(
            endpoint = ?spec.endpoint.as_ref().map(|e| e.to_string()),
            transport = %spec.transport,
            auth_mode = %spec.auth_mode,
            tls = ?spec.tls,
            proxy = spec.proxy.is_some(),
            "resolved connection spec"
        );
        Ok(spec)
    }

    /// Parsed endpoint (`None` in Data API mode)
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Username (may be empty in Data API mode)
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Static password. `Some("")` means passwordless.
    pub fn password(&self) -> Option<&SecretString> {
        self.password.as_ref()
    }

    /// Transport scheme
    pub fn transport(&self) -> TransportScheme {
        self.transport
    }

    /// Effective authentication mode
    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    /// Effective TLS mode
    pub fn tls(&self) -> TlsMode {
        self.tls
    }

    /// Custom TLS material (set iff the TLS mode is `Custom`)
    pub fn custom_tls(&self) -> Option<&CustomTls> {
        self.custom_tls.as_ref()
    }

    /// Effective authentication plugin
    pub fn auth_plugin(&self) -> AuthPlugin {
        self.auth_plugin
    }

    /// Session parameters
    pub fn conn_params(&self) -> &BTreeMap<String, String> {
        &self.conn_params
    }

    /// Pool policy (ignored in Data API mode)
    pub fn pool(&self) -> PoolPolicy {
        self.pool
    }

    /// Cloud configuration
    pub fn cloud(&self) -> &CloudConfig {
        &self.cloud
    }

    /// Data API target in Data API mode
    pub fn data_api(&self) -> Option<&DataApiTarget> {
        self.cloud.data_api()
    }

    /// Whether the Cloud SQL private IP is used
    pub fn private_ip(&self) -> bool {
        self.private_ip
    }

    /// Cloud SQL attachment path
    pub fn cloud_sql_ip_type(&self) -> CloudSqlIpType {
        CloudSqlIpType::from_private_ip(self.private_ip)
    }

    /// Whether Cloud SQL IAM database authentication was requested
    pub fn iam_database_auth(&self) -> bool {
        self.iam_database_auth
    }

    /// SOCKS5 proxy
    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    /// Total retry budget for the first connection
    pub fn connect_retry_timeout(&self) -> Duration {
        self.connect_retry_timeout
    }
}

/// Exactly one secret source is active; the first match wins.
fn select_auth_mode(
    cloud: &CloudConfig,
    endpoint: Option<&Endpoint>,
    iam_database_auth: bool,
) -> Result<AuthMode> {
    if cloud.data_api().is_some() {
        return Ok(AuthMode::DataApi);
    }

    let rds_iam = cloud.aws().is_some_and(AwsConfig::rds_iam)
        || endpoint.is_some_and(Endpoint::is_aws);
    if rds_iam {
        return match endpoint {
            Some(Endpoint::Unix(_)) | Some(Endpoint::CloudSql(_)) => Err(Error::Config(
                "aws_rds_iam_auth requires a TCP endpoint (host:port or aws://)".into(),
            )),
            _ => Ok(AuthMode::RdsIam),
        };
    }

    if endpoint.is_some_and(Endpoint::is_azure) {
        return Ok(AuthMode::AzureAd);
    }

    if iam_database_auth {
        if endpoint.and_then(Endpoint::cloud_sql).is_some() {
            return Ok(AuthMode::CloudSqlIam);
        }
        tracing::warn!("iam_database_authentication only applies to cloudsql:// endpoints; using the static password");
    }

    Ok(AuthMode::Static)
}

fn select_tls(
    config: &ProviderConfig,
    auth_mode: AuthMode,
    data_api: bool,
) -> Result<(TlsMode, Option<CustomTls>)> {
    if data_api {
        if config.tls.is_some() || config.custom_tls.is_some() {
            tracing::warn!("tls settings are ignored in Data API mode");
        }
        return Ok((TlsMode::Off, None));
    }

    let custom_key = config
        .custom_tls
        .as_ref()
        .and_then(|block| block.config_key.as_deref());

    let mut mode = match (config.tls.as_deref(), &config.custom_tls) {
        // a custom block alone selects custom TLS
        (None, Some(_)) => TlsMode::Custom,
        (value, _) => TlsMode::parse(value.unwrap_or(""), custom_key)?,
    };

    let custom_tls = match (mode, &config.custom_tls) {
        (TlsMode::Custom, Some(block)) => Some(CustomTls::from_block(block)?),
        (TlsMode::Custom, None) => {
            return Err(Error::Config(
                "tls = \"custom\" requires a custom_tls block".into(),
            ))
        }
        (_, Some(_)) => {
            tracing::warn!(tls = ?mode, "custom_tls is ignored because tls is not custom");
            None
        }
        (_, None) => None,
    };

    if auth_mode.is_token() && mode == TlsMode::Off {
        tracing::warn!(mode = %auth_mode, "token authentication requires TLS; enabling tls");
        mode = TlsMode::On;
    }

    Ok((mode, custom_tls))
}

/// Session variable names: letters, digits, `_`, `.` and `@`
fn validate_param_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@'));
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid conn_params key '{}'", key)))
    }
}
