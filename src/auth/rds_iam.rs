//! RDS IAM authentication tokens
//!
//! An IAM token is a SigV4-presigned `connect` request for the `rds-db` service,
//! scoped to one `host:port` and database user. The server validates the
//! signature against the endpoint it is reached on, so the exact endpoint from
//! the connection spec is signed. Tokens are valid for 15 minutes and are minted
//! fresh for every connection attempt.

use super::{AuthMode, CredentialProvider, ResolvedCredential, SecretString};
use crate::cloud::ResolvedAwsConfig;
use crate::client::join_host_port;
use crate::{Error, Result};
use async_trait::async_trait;
use aws_credential_types::provider::error::CredentialsError;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
};
use aws_sigv4::sign::v4;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, SystemTime};
use url::Url;

/// Validity window of an RDS IAM token
pub const TOKEN_VALIDITY: Duration = Duration::from_secs(900);

const SERVICE: &str = "rds-db";

/// Endpoint and user a token is scoped to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdsTokenRequest {
    host: String,
    port: u16,
    username: String,
}

impl RdsTokenRequest {
    /// Create a request for `username` at `host:port`
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }

    /// Signed host header value
    fn host_header(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

/// Mints RDS IAM tokens from a shared AWS credential chain
#[derive(Clone)]
pub struct RdsIamTokenProvider {
    credentials: SharedCredentialsProvider,
    region: String,
    request: RdsTokenRequest,
}

impl fmt::Debug for RdsIamTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdsIamTokenProvider")
            .field("region", &self.region)
            .field("request", &self.request)
            .finish()
    }
}

impl RdsIamTokenProvider {
    /// Create a provider with an explicit credential chain and region
    pub fn new(
        credentials: SharedCredentialsProvider,
        region: impl Into<String>,
        request: RdsTokenRequest,
    ) -> Self {
        Self {
            credentials,
            region: region.into(),
            request,
        }
    }

    /// Create a provider from a resolved AWS configuration.
    ///
    /// The region is taken from the configuration, or inferred from the RDS
    /// hostname when none was configured or discovered.
    pub fn from_resolved(aws: &ResolvedAwsConfig, request: RdsTokenRequest) -> Result<Self> {
        let region = match aws.region() {
            Some(region) => region.to_string(),
            None => infer_rds_region(&request.host).ok_or_else(|| {
                Error::Config(format!(
                    "no AWS region configured and none could be inferred from host '{}'",
                    request.host
                ))
            })?,
        };

        let credentials = aws.credentials_provider().ok_or_else(|| {
            Error::Config("no AWS credential provider is available for RDS IAM authentication".into())
        })?;

        Ok(Self::new(credentials, region, request))
    }

    /// Region the token is signed for
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Sign a token for the given instant
    pub fn sign_at(&self, creds: &Credentials, now: DateTime<Utc>) -> Result<String> {
        sign_token(&self.request, &self.region, creds, now)
    }
}

#[async_trait]
impl CredentialProvider for RdsIamTokenProvider {
    fn mode(&self) -> AuthMode {
        AuthMode::RdsIam
    }

    async fn acquire(&self) -> Result<ResolvedCredential> {
        let creds = self
            .credentials
            .provide_credentials()
            .await
            .map_err(map_credentials_error)?;

        let now = Utc::now();
        let token = self.sign_at(&creds, now)?;

        let mut expires_at = SystemTime::from(now) + TOKEN_VALIDITY;
        if let Some(creds_expiry) = creds.expiry() {
            expires_at = expires_at.min(creds_expiry);
        }

        tracing::debug!(
            region = %self.region,
            host = %self.request.host,
            user = %self.request.username,
            "minted RDS IAM token"
        );

        Ok(ResolvedCredential::expiring(SecretString::new(token), expires_at))
    }
}

fn map_credentials_error(err: CredentialsError) -> Error {
    match err {
        CredentialsError::ProviderTimedOut(_) => {
            Error::Connection("timed out loading AWS credentials for RDS IAM token".into())
        }
        other => Error::Auth(format!(
            "failed to load AWS credentials for RDS IAM token: {}",
            credentials_error_chain(&other)
        )),
    }
}

fn credentials_error_chain(err: &CredentialsError) -> String {
    use std::error::Error as _;
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        msg.push_str(": ");
        msg.push_str(&s.to_string());
        source = s.source();
    }
    msg
}

/// Infer the region from an RDS hostname (`<id>.<hash>.<region>.rds.amazonaws.com`)
pub fn infer_rds_region(host: &str) -> Option<String> {
    let labels: Vec<&str> = host.split('.').collect();
    let rds = labels
        .windows(2)
        .position(|w| w[0].eq_ignore_ascii_case("rds") && w[1].eq_ignore_ascii_case("amazonaws"))?;
    if rds < 2 {
        return None;
    }
    let region = labels[rds - 1];
    let looks_like_region = region.contains('-') && region.chars().any(|c| c.is_ascii_digit());
    looks_like_region.then(|| region.to_ascii_lowercase())
}

/// Build the presigned token `host:port/?Action=connect&...&X-Amz-Signature=...`
pub(crate) fn sign_token(
    request: &RdsTokenRequest,
    region: &str,
    creds: &Credentials,
    now: DateTime<Utc>,
) -> Result<String> {
    let mut url = Url::parse(&format!("https://{}/", request.host_header()))
        .map_err(|e| Error::Config(format!("invalid RDS host '{}': {}", request.host, e)))?;
    url.query_pairs_mut()
        .append_pair("Action", "connect")
        .append_pair("DBUser", &request.username);

    let identity = creds.clone().into();
    let mut settings = SigningSettings::default();
    settings.signature_location = SignatureLocation::QueryParams;
    settings.expires_in = Some(TOKEN_VALIDITY);

    let params = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(SERVICE)
        .time(SystemTime::from(now))
        .settings(settings)
        .build()
        .map_err(|e| Error::Auth(format!("invalid RDS IAM signing parameters: {}", e)))?
        .into();

    let signable = SignableRequest::new(
        "GET",
        url.as_str(),
        std::iter::empty(),
        SignableBody::Bytes(&[]),
    )
    .map_err(|e| Error::Auth(format!("failed to build RDS IAM signing request: {}", e)))?;

    let (instructions, _signature) = sign(signable, &params)
        .map_err(|e| Error::Auth(format!("failed to sign RDS IAM token: {}", e)))?
        .into_parts();

    {
        let mut query = url.query_pairs_mut();
        for (name, value) in instructions.params() {
            query.append_pair(name, &value);
        }
    }

    Ok(format!("{}/?{}", request.host_header(), url.query().unwrap_or_default()))
}
