//! Google Cloud access tokens and Cloud SQL instance lookup
//!
//! Token sources are discovered in this order:
//! 1. `GOOGLE_OAUTH_ACCESS_TOKEN` (a ready-made bearer token)
//! 2. the key file named by `GOOGLE_APPLICATION_CREDENTIALS`
//! 3. gcloud application default credentials
//! 4. the GCE metadata server
//!
//! Service account keys are exchanged through a self-signed RS256 assertion,
//! signed with the same ring-backed signer the TLS layer uses.
//!
//! Cloud SQL instances are reached the way the connector libraries reach them:
//! `connectSettings` yields the address and server CA, `generateEphemeralCert`
//! signs a short-lived client certificate for a local RSA key, and the server
//! accepts mutual TLS on port 3307.

use super::AccessToken;
use crate::auth::SecretString;
use crate::client::CloudSqlInstance;
use crate::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::DateTime;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustls::SignatureScheme;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// OAuth2 scope required by the Cloud SQL Admin API
pub const SQLADMIN_SCOPE: &str = "https://www.googleapis.com/auth/sqlservice.admin";

/// Cloud SQL Admin API base URL
pub const DEFAULT_SQLADMIN_API: &str = "https://sqladmin.googleapis.com";

/// Port of the Cloud SQL server-side proxy, which requires a client certificate
pub const CLOUD_SQL_SERVER_PORT: u16 = 3307;

/// Lifetime assumed when the Admin API omits `expirationTime`
pub const EPHEMERAL_CERT_VALIDITY: Duration = Duration::from_secs(3600);

const CLIENT_KEY_BITS: usize = 2048;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME: Duration = Duration::from_secs(3600);
const ADC_FILE: &str = "application_default_credentials.json";

/// Which address of a Cloud SQL instance to dial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudSqlIpType {
    /// Public IP (`PRIMARY` in the Admin API)
    Public,
    /// VPC private IP (`PRIVATE` in the Admin API)
    Private,
}

impl CloudSqlIpType {
    /// Select the attachment path from the `private_ip` flag
    pub fn from_private_ip(private_ip: bool) -> Self {
        if private_ip {
            CloudSqlIpType::Private
        } else {
            CloudSqlIpType::Public
        }
    }

    /// Admin API address type
    pub fn api_name(&self) -> &'static str {
        match self {
            CloudSqlIpType::Public => "PRIMARY",
            CloudSqlIpType::Private => "PRIVATE",
        }
    }
}

impl fmt::Display for CloudSqlIpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudSqlIpType::Public => f.write_str("public"),
            CloudSqlIpType::Private => f.write_str("private"),
        }
    }
}

/// Service account key material
#[derive(Clone)]
pub struct ServiceAccountKey {
    /// Service account e-mail (JWT issuer)
    pub client_email: String,
    /// PEM-encoded RSA private key
    pub private_key: SecretString,
    /// Token endpoint
    pub token_uri: String,
}

/// gcloud user credentials (refresh token)
#[derive(Clone)]
pub struct AuthorizedUser {
    /// OAuth client id
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: SecretString,
    /// Long-lived refresh token
    pub refresh_token: SecretString,
    /// Token endpoint
    pub token_uri: String,
}

/// A source of Google OAuth2 access tokens
#[derive(Clone)]
pub enum GoogleCredentials {
    /// Pre-issued bearer token
    AccessToken(SecretString),
    /// Service account key
    ServiceAccount(ServiceAccountKey),
    /// User credentials from `gcloud auth application-default login`
    AuthorizedUser(AuthorizedUser),
    /// Metadata server of the current GCE/GKE/Cloud Run instance
    Metadata {
        /// Metadata server host
        host: String,
    },
}

impl fmt::Debug for GoogleCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoogleCredentials::AccessToken(_) => f.write_str("AccessToken(***)"),
            GoogleCredentials::ServiceAccount(key) => f
                .debug_struct("ServiceAccount")
                .field("client_email", &key.client_email)
                .finish_non_exhaustive(),
            GoogleCredentials::AuthorizedUser(user) => f
                .debug_struct("AuthorizedUser")
                .field("client_id", &user.client_id)
                .finish_non_exhaustive(),
            GoogleCredentials::Metadata { host } => {
                f.debug_struct("Metadata").field("host", host).finish()
            }
        }
    }
}

#[derive(Deserialize)]
struct CredentialsFile {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    client_email: String,
    #[serde(default)]
    private_key: String,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    client_secret: String,
    #[serde(default)]
    refresh_token: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

impl GoogleCredentials {
    /// Discover credentials from the process environment
    pub async fn discover() -> Result<Self> {
        Self::discover_with(|name| std::env::var(name).ok()).await
    }

    /// Discover credentials with a custom environment lookup
    pub async fn discover_with<F>(env_lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| env_lookup(name).filter(|v| !v.is_empty());

        if let Some(token) = env("GOOGLE_OAUTH_ACCESS_TOKEN") {
            tracing::debug!("using Google access token from environment");
            return Ok(GoogleCredentials::AccessToken(SecretString::new(token)));
        }

        if let Some(path) = env("GOOGLE_APPLICATION_CREDENTIALS") {
            let path = PathBuf::from(path);
            tracing::debug!(path = %path.display(), "using Google credentials file");
            return Self::from_file(&path).await;
        }

        let adc_dir = env("CLOUDSDK_CONFIG")
            .map(PathBuf::from)
            .or_else(|| env("HOME").map(|home| Path::new(&home).join(".config").join("gcloud")));
        if let Some(adc) = adc_dir.map(|dir| dir.join(ADC_FILE)) {
            if tokio::fs::try_exists(&adc).await.unwrap_or(false) {
                tracing::debug!(path = %adc.display(), "using gcloud application default credentials");
                return Self::from_file(&adc).await;
            }
        }

        let host = env("GCE_METADATA_HOST").unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        tracing::debug!(host = %host, "falling back to the GCE metadata server");
        Ok(GoogleCredentials::Metadata { host })
    }

    async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!(
                "failed to read Google credentials file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json(&contents)
    }

    /// Parse a `service_account` or `authorized_user` credentials document
    pub fn from_json(json: &str) -> Result<Self> {
        // serde errors can echo field values; keep only the position
        let file: CredentialsFile = serde_json::from_str(json).map_err(|e| {
            Error::Config(format!(
                "invalid Google credentials JSON at line {} column {}",
                e.line(),
                e.column()
            ))
        })?;
        let token_uri = file
            .token_uri
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string());

        match file.kind.as_str() {
            "service_account" => {
                if file.client_email.is_empty() || file.private_key.is_empty() {
                    return Err(Error::Config(
                        "service account credentials need client_email and private_key".into(),
                    ));
                }
                Ok(GoogleCredentials::ServiceAccount(ServiceAccountKey {
                    client_email: file.client_email,
                    private_key: SecretString::new(file.private_key),
                    token_uri,
                }))
            }
            "authorized_user" => {
                if file.client_id.is_empty() || file.refresh_token.is_empty() {
                    return Err(Error::Config(
                        "authorized_user credentials need client_id and refresh_token".into(),
                    ));
                }
                Ok(GoogleCredentials::AuthorizedUser(AuthorizedUser {
                    client_id: file.client_id,
                    client_secret: SecretString::new(file.client_secret),
                    refresh_token: SecretString::new(file.refresh_token),
                    token_uri,
                }))
            }
            other => Err(Error::Config(format!(
                "unsupported Google credentials type '{}'",
                other
            ))),
        }
    }

    /// Obtain an access token with the Cloud SQL Admin scope
    pub async fn access_token(&self, http: &reqwest::Client) -> Result<AccessToken> {
        let request = match self {
            GoogleCredentials::AccessToken(token) => {
                // lifetime unknown; treat as valid for the token's usual hour
                return Ok(AccessToken {
                    token: token.clone(),
                    expires_at: SystemTime::now() + ASSERTION_LIFETIME,
                });
            }
            GoogleCredentials::ServiceAccount(key) => {
                let assertion = sign_assertion(key, SystemTime::now())?;
                http.post(&key.token_uri).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ])
            }
            GoogleCredentials::AuthorizedUser(user) => http.post(&user.token_uri).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", user.client_id.as_str()),
                ("client_secret", user.client_secret.expose()),
                ("refresh_token", user.refresh_token.expose()),
            ]),
            GoogleCredentials::Metadata { host } => http
                .get(format!(
                    "http://{}/computeMetadata/v1/instance/service-accounts/default/token",
                    host
                ))
                .header("Metadata-Flavor", "Google")
                .query(&[("scopes", SQLADMIN_SCOPE)]),
        };

        let response = request.send().await.map_err(|e| {
            Error::Connection(format!("Google token request failed: {}", e.without_url()))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let msg = format!(
                "Google token request returned {}: {}",
                status.as_u16(),
                oauth_error_code(&body)
            );
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                Error::Connection(msg)
            } else {
                Error::Auth(msg)
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            Error::Auth(format!("invalid Google token response: {}", e.without_url()))
        })?;

        Ok(AccessToken {
            token: SecretString::new(body.access_token),
            expires_at: SystemTime::now()
                + Duration::from_secs(body.expires_in.unwrap_or(ASSERTION_LIFETIME.as_secs())),
        })
    }
}

/// The `error` field of an OAuth2 error document, never the description
fn oauth_error_code(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unexpected response".to_string())
}

/// Build the self-signed RS256 assertion for the token exchange
fn sign_assertion(key: &ServiceAccountKey, now: SystemTime) -> Result<String> {
    let iat = now
        .duration_since(UNIX_EPOCH)
        .map_err(|_| Error::Config("system clock is before the Unix epoch".into()))?
        .as_secs();

    let header = serde_json::json!({ "alg": "RS256", "typ": "JWT" });
    let claims = serde_json::json!({
        "iss": key.client_email,
        "scope": SQLADMIN_SCOPE,
        "aud": key.token_uri,
        "iat": iat,
        "exp": iat + ASSERTION_LIFETIME.as_secs(),
    });

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header.to_string()),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    );

    let der = crate::connection::tls::load_private_key(key.private_key.expose().as_bytes())
        .map_err(|_| Error::Config("service account private_key is not a valid PEM key".into()))?;
    let signing_key = rustls::crypto::ring::default_provider()
        .key_provider
        .load_private_key(der)
        .map_err(|e| Error::Config(format!("unsupported service account key: {}", e)))?;
    let signer = signing_key
        .choose_scheme(&[SignatureScheme::RSA_PKCS1_SHA256])
        .ok_or_else(|| Error::Config("service account key is not an RSA key".into()))?;
    let signature = signer
        .sign(signing_input.as_bytes())
        .map_err(|e| Error::Auth(format!("failed to sign service account assertion: {}", e)))?;

    Ok(format!("{}.{}", signing_input, URL_SAFE_NO_PAD.encode(signature)))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpMapping {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    ip_address: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SslCert {
    #[serde(default)]
    cert: String,
    expiration_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EphemeralCertResponse {
    ephemeral_cert: Option<SslCert>,
}

/// RSA key pair whose public half is signed by `generateEphemeralCert`
#[derive(Clone)]
pub struct ClientKeyPair {
    private_key_pem: SecretString,
    public_key_pem: String,
}

impl fmt::Debug for ClientKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeyPair")
            .field("private_key_pem", &"***")
            .finish_non_exhaustive()
    }
}

impl ClientKeyPair {
    /// Generate a fresh 2048-bit key. CPU bound; run it off the async workers.
    pub fn generate() -> Result<Self> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), CLIENT_KEY_BITS)
            .map_err(|e| Error::Config(format!("failed to generate Cloud SQL client key: {}", e)))?;
        Self::from_key(&key)
    }

    /// Use an existing RSA private key (PKCS#8 or PKCS#1 PEM)
    pub fn from_private_key_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| Error::Config("Cloud SQL client key is not an RSA private key".into()))?;
        Self::from_key(&key)
    }

    fn from_key(key: &RsaPrivateKey) -> Result<Self> {
        let private_key_pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::Config(format!("failed to encode Cloud SQL client key: {}", e)))?;
        let public_key_pem = RsaPublicKey::from(key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Config(format!("failed to encode Cloud SQL public key: {}", e)))?;
        Ok(Self {
            private_key_pem: SecretString::new(private_key_pem.as_str()),
            public_key_pem,
        })
    }

    /// PKCS#8 private key PEM
    pub fn private_key_pem(&self) -> &SecretString {
        &self.private_key_pem
    }

    /// SubjectPublicKeyInfo PEM sent to the Admin API
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }
}

/// Client certificate signed by the instance's CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralCert {
    /// Certificate PEM
    pub cert_pem: String,
    /// Instant the server stops accepting the certificate
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectSettingsResponse {
    #[serde(default)]
    ip_addresses: Vec<IpMapping>,
    server_ca_cert: Option<SslCert>,
    #[serde(default)]
    database_version: String,
    #[serde(default)]
    region: String,
}

/// Connection metadata of a Cloud SQL instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectSettings {
    /// Instance the settings belong to
    pub instance: CloudSqlInstance,
    /// Public (`PRIMARY`) address
    pub public_ip: Option<String>,
    /// Private (`PRIVATE`) address
    pub private_ip: Option<String>,
    /// Server CA certificate (PEM)
    pub server_ca_pem: Option<String>,
    /// Engine version, e.g. `MYSQL_8_0`
    pub database_version: String,
}

impl ConnectSettings {
    /// Address for the requested attachment path
    pub fn address(&self, ip_type: CloudSqlIpType) -> Result<&str> {
        let addr = match ip_type {
            CloudSqlIpType::Public => self.public_ip.as_deref(),
            CloudSqlIpType::Private => self.private_ip.as_deref(),
        };
        addr.ok_or_else(|| {
            Error::Config(format!(
                "Cloud SQL instance '{}' has no {} IP address",
                self.instance, ip_type
            ))
        })
    }
}

/// Client for the Cloud SQL Admin `connectSettings` call
#[derive(Debug, Clone)]
pub struct CloudSqlResolver {
    http: reqwest::Client,
    api_base: String,
}

impl CloudSqlResolver {
    /// Create a resolver against the public Admin API
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            api_base: DEFAULT_SQLADMIN_API.to_string(),
        }
    }

    /// Override the Admin API base URL
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Fetch the addresses and server CA of `instance`
    pub async fn connect_settings(
        &self,
        instance: &CloudSqlInstance,
        token: &AccessToken,
    ) -> Result<ConnectSettings> {
        let url = format!(
            "{}/sql/v1beta4/projects/{}/instances/{}/connectSettings",
            self.api_base, instance.project, instance.name
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(token.token.expose())
            .send()
            .await
            .map_err(|e| request_failed(instance, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, instance));
        }

        let body: ConnectSettingsResponse = response
            .json()
            .await
            .map_err(|e| invalid_response(instance, e))?;

        if !body.region.is_empty() && body.region != instance.region {
            return Err(Error::Config(format!(
                "Cloud SQL instance '{}' is in region '{}', not '{}'",
                instance, body.region, instance.region
            )));
        }

        let find = |kind: CloudSqlIpType| {
            body.ip_addresses
                .iter()
                .find(|m| m.kind == kind.api_name() && !m.ip_address.is_empty())
                .map(|m| m.ip_address.clone())
        };

        let settings = ConnectSettings {
            instance: instance.clone(),
            public_ip: find(CloudSqlIpType::Public),
            private_ip: find(CloudSqlIpType::Private),
            server_ca_pem: body
                .server_ca_cert
                .map(|c| c.cert)
                .filter(|c| !c.is_empty()),
            database_version: body.database_version,
        };

        tracing::debug!(
            instance = %instance,
            public_ip = ?settings.public_ip,
            private_ip = ?settings.private_ip,
            version = %settings.database_version,
            "fetched Cloud SQL connect settings"
        );
        Ok(settings)
    }

    /// Have the instance CA sign `keys` into a short-lived client certificate.
    ///
    /// With IAM database authentication the login token is bound into the
    /// certificate, so the server accepts the same token as the password.
    pub async fn generate_ephemeral_cert(
        &self,
        instance: &CloudSqlInstance,
        token: &AccessToken,
        keys: &ClientKeyPair,
        login_token: Option<&SecretString>,
    ) -> Result<EphemeralCert> {
        let url = format!(
            "{}/sql/v1beta4/projects/{}/instances/{}:generateEphemeralCert",
            self.api_base, instance.project, instance.name
        );

        let mut body = serde_json::json!({ "public_key": keys.public_key_pem() });
        if let Some(login) = login_token {
            body["access_token"] = serde_json::Value::String(login.expose().to_string());
        }

        let response = self
            .http
            .post(&url)
            .bearer_auth(token.token.expose())
            .json(&body)
            .send()
            .await
            .map_err(|e| request_failed(instance, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, instance));
        }

        let body: EphemeralCertResponse = response
            .json()
            .await
            .map_err(|e| invalid_response(instance, e))?;
        let cert = body
            .ephemeral_cert
            .filter(|c| !c.cert.is_empty())
            .ok_or_else(|| {
                Error::Connection(format!(
                    "Cloud SQL Admin API returned no ephemeral certificate for '{}'",
                    instance
                ))
            })?;

        let expires_at = match cert.expiration_time.as_deref() {
            Some(ts) => DateTime::parse_from_rfc3339(ts)
                .map(SystemTime::from)
                .map_err(|_| {
                    Error::Connection(format!(
                        "invalid ephemeral certificate expiration '{}' for '{}'",
                        ts, instance
                    ))
                })?,
            None => SystemTime::now() + EPHEMERAL_CERT_VALIDITY,
        };

        tracing::debug!(instance = %instance, iam_authn = login_token.is_some(), "issued Cloud SQL ephemeral certificate");
        Ok(EphemeralCert {
            cert_pem: cert.cert,
            expires_at,
        })
    }
}

fn request_failed(instance: &CloudSqlInstance, e: reqwest::Error) -> Error {
    Error::Connection(format!(
        "Cloud SQL Admin request for '{}' failed: {}",
        instance,
        e.without_url()
    ))
}

fn invalid_response(instance: &CloudSqlInstance, e: reqwest::Error) -> Error {
    Error::Connection(format!(
        "invalid Cloud SQL Admin response for '{}': {}",
        instance,
        e.without_url()
    ))
}

fn status_error(status: reqwest::StatusCode, instance: &CloudSqlInstance) -> Error {
    let msg = format!(
        "Cloud SQL Admin API returned {} for instance '{}'",
        status.as_u16(),
        instance
    );
    match status.as_u16() {
        401 | 403 => Error::Auth(msg),
        404 | 400 => Error::Config(msg),
        _ => Error::Connection(msg),
    }
}
