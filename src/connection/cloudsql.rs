//! Cloud SQL client certificates
//!
//! The server-side proxy on port 3307 only accepts clients presenting a
//! certificate signed by the instance CA. [`CloudSqlTls`] obtains one through
//! `generateEphemeralCert` and renews it shortly before it expires, so every
//! new physical connection presents a valid certificate.

use super::pool::TlsSource;
use super::tls::{TlsMaterial, TlsRegistry};
use crate::auth::SecretString;
use crate::client::CloudSqlInstance;
use crate::cloud::{ClientKeyPair, CloudSqlResolver, EphemeralCert, GoogleCredentials};
use crate::Result;
use async_trait::async_trait;
use mysql_async::SslOpts;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// Certificates this close to expiry are renewed before the next dial
pub const CERT_REFRESH_MARGIN: Duration = Duration::from_secs(300);

struct IssuedCert {
    ssl: SslOpts,
    expires_at: SystemTime,
}

/// Per-dial TLS options carrying a Cloud SQL ephemeral client certificate
pub struct CloudSqlTls {
    instance: CloudSqlInstance,
    server_ca_pem: String,
    keys: Arc<ClientKeyPair>,
    login_token: Option<SecretString>,
    resolver: CloudSqlResolver,
    google: GoogleCredentials,
    http: reqwest::Client,
    registry: Arc<TlsRegistry>,
    current: Mutex<Option<IssuedCert>>,
}

impl fmt::Debug for CloudSqlTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudSqlTls")
            .field("instance", &self.instance)
            .field("iam_authn", &self.login_token.is_some())
            .finish_non_exhaustive()
    }
}

impl CloudSqlTls {
    /// Create a source for `instance`, trusting `server_ca_pem`
    pub fn new(
        instance: CloudSqlInstance,
        server_ca_pem: impl Into<String>,
        keys: Arc<ClientKeyPair>,
        resolver: CloudSqlResolver,
        google: GoogleCredentials,
        http: reqwest::Client,
        registry: Arc<TlsRegistry>,
    ) -> Self {
        Self {
            instance,
            server_ca_pem: server_ca_pem.into(),
            keys,
            login_token: None,
            resolver,
            google,
            http,
            registry,
            current: Mutex::new(None),
        }
    }

    /// Bind an IAM database-authentication token into issued certificates
    pub fn login_token(mut self, token: Option<SecretString>) -> Self {
        self.login_token = token;
        self
    }

    /// Registry key the current material is stored under
    pub fn registry_key(&self) -> String {
        format!("cloudsql:{}", self.instance)
    }

    /// TLS material for an issued certificate.
    ///
    /// Server certificates name the instance rather than the dialed address,
    /// so only the chain is verified.
    pub fn material(&self, cert: &EphemeralCert) -> Result<TlsMaterial> {
        TlsMaterial::builder()
            .ca_pem(self.server_ca_pem.as_bytes().to_vec())
            .client_identity(
                cert.cert_pem.as_bytes().to_vec(),
                self.keys.private_key_pem().expose().as_bytes().to_vec(),
            )
            .danger_skip_domain_validation(true)
            .build()
    }

    async fn issue(&self) -> Result<IssuedCert> {
        let token = self.google.access_token(&self.http).await?;
        let cert = self
            .resolver
            .generate_ephemeral_cert(&self.instance, &token, &self.keys, self.login_token.as_ref())
            .await?;

        let material = self.material(&cert)?;
        let ssl = material.to_ssl_opts();
        self.registry.register(Some(&self.registry_key()), material);

        tracing::info!(
            instance = %self.instance,
            expires_in = ?cert.expires_at.duration_since(SystemTime::now()).unwrap_or_default(),
            "issued Cloud SQL client certificate"
        );
        Ok(IssuedCert {
            ssl,
            expires_at: cert.expires_at,
        })
    }
}

#[async_trait]
impl TlsSource for CloudSqlTls {
    async fn ssl_opts(&self) -> Result<Option<SslOpts>> {
        let mut current = self.current.lock().await;
        if let Some(issued) = current.as_ref() {
            if SystemTime::now() + CERT_REFRESH_MARGIN < issued.expires_at {
                return Ok(Some(issued.ssl.clone()));
            }
        }

        let issued = self.issue().await?;
        let ssl = issued.ssl.clone();
        *current = Some(issued);
        Ok(Some(ssl))
    }
}
