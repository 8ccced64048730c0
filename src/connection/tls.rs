//! TLS material loading and the per-provider TLS registry.
//!
//! Certificate and key material comes either inline (PEM text) or from a
//! filesystem path. Material is parsed and checked by constructing a rustls
//! client configuration, so a key that does not belong to its certificate is
//! reported before any connection attempt.
//!
//! Composed configurations are stored in a [`TlsRegistry`] owned by the provider
//! instance and handed to the driver as [`mysql_async::SslOpts`].

use crate::config::CustomTlsBlock;
use crate::{Error, Result};
use mysql_async::{ClientIdentity, SslOpts};
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::Item;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const PEM_MARKER: &str = "-----BEGIN";

/// Where a piece of PEM material comes from
#[derive(Clone, PartialEq, Eq)]
pub enum PemSource {
    /// PEM content given inline
    Inline(String),
    /// Path to a PEM file
    Path(PathBuf),
}

impl PemSource {
    /// Classify a configuration value: inline when it starts with a PEM header, otherwise a path
    pub fn parse(value: &str) -> Self {
        if value.trim_start().starts_with(PEM_MARKER) {
            PemSource::Inline(value.to_string())
        } else {
            PemSource::Path(PathBuf::from(value.trim()))
        }
    }

    /// Whether the material is inline
    pub fn is_inline(&self) -> bool {
        matches!(self, PemSource::Inline(_))
    }

    /// Resolve to bytes, reading the file for path sources
    pub fn load(&self) -> Result<Vec<u8>> {
        self.load_with(|path| std::fs::read(path))
    }

    /// Resolve to bytes with a custom file reader.
    ///
    /// The reader is never called for inline material.
    pub fn load_with<F>(&self, read: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&Path) -> io::Result<Vec<u8>>,
    {
        match self {
            PemSource::Inline(pem) => Ok(pem.as_bytes().to_vec()),
            PemSource::Path(path) => read(path).map_err(|e| {
                Error::Config(format!(
                    "failed to read PEM file '{}': {}",
                    path.display(),
                    e
                ))
            }),
        }
    }
}

impl std::fmt::Debug for PemSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PemSource::Inline(_) => f.write_str("PemSource::Inline(<pem>)"),
            PemSource::Path(path) => write!(f, "PemSource::Path({})", path.display()),
        }
    }
}

/// Validated custom TLS settings, before the material is read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomTls {
    /// Registry key (generated when absent)
    pub config_key: Option<String>,
    /// CA certificate source
    pub ca_cert: Option<PemSource>,
    /// Client certificate source
    pub client_cert: Option<PemSource>,
    /// Client private key source
    pub client_key: Option<PemSource>,
}

impl CustomTls {
    /// Validate a custom TLS block.
    ///
    /// Client certificate and key must be given together.
    pub fn from_block(block: &CustomTlsBlock) -> Result<Self> {
        let source = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(PemSource::parse)
        };

        let custom = Self {
            config_key: block.config_key.clone().filter(|k| !k.is_empty()),
            ca_cert: source(&block.ca_cert),
            client_cert: source(&block.client_cert),
            client_key: source(&block.client_key),
        };

        if custom.client_cert.is_some() != custom.client_key.is_some() {
            return Err(Error::Config(
                "custom_tls client_cert and client_key must be set together".into(),
            ));
        }
        if custom.ca_cert.is_none() && custom.client_cert.is_none() {
            return Err(Error::Config(
                "custom_tls requires ca_cert or a client_cert/client_key pair".into(),
            ));
        }

        Ok(custom)
    }
}

/// Parsed, validated TLS material ready to hand to the driver.
#[derive(Clone)]
pub struct TlsMaterial {
    ca_pem: Option<Vec<u8>>,
    client_cert_pem: Option<Vec<u8>>,
    client_key_pem: Option<Vec<u8>>,
    danger_accept_invalid_certs: bool,
    danger_skip_domain_validation: bool,
    client_config: Arc<ClientConfig>,
}

impl TlsMaterial {
    /// Create a new TLS material builder.
    pub fn builder() -> TlsMaterialBuilder {
        TlsMaterialBuilder::default()
    }

    /// Load custom TLS material, reading path sources from the filesystem.
    pub fn load(custom: &CustomTls) -> Result<Self> {
        Self::load_with(custom, |path| std::fs::read(path))
    }

    /// Load custom TLS material with a custom file reader.
    pub fn load_with<F>(custom: &CustomTls, read: F) -> Result<Self>
    where
        F: Fn(&Path) -> io::Result<Vec<u8>>,
    {
        let mut builder = Self::builder();

        if let Some(ca) = &custom.ca_cert {
            builder = builder.ca_pem(ca.load_with(&read)?);
        }
        if let (Some(cert), Some(key)) = (&custom.client_cert, &custom.client_key) {
            builder = builder.client_identity(cert.load_with(&read)?, key.load_with(&read)?);
        }

        builder.build()
    }

    /// The rustls client configuration built from this material
    pub fn client_config(&self) -> Arc<ClientConfig> {
        self.client_config.clone()
    }

    /// Whether a client certificate is presented
    pub fn has_client_identity(&self) -> bool {
        self.client_cert_pem.is_some()
    }

    /// Whether a custom CA bundle is configured
    pub fn has_custom_ca(&self) -> bool {
        self.ca_pem.is_some()
    }

    /// Copy of this material with hostname validation disabled.
    ///
    /// Used when the driver dials a local forwarder instead of the server name.
    pub fn without_domain_validation(&self) -> Self {
        Self {
            danger_skip_domain_validation: true,
            ..self.clone()
        }
    }

    /// Driver TLS options.
    ///
    /// The driver trusts the custom CA in addition to its bundled webpki
    /// roots; [`TlsMaterial::client_config`] trusts the custom CA only.
    pub fn to_ssl_opts(&self) -> SslOpts {
        let mut opts = SslOpts::default()
            .with_danger_accept_invalid_certs(self.danger_accept_invalid_certs)
            .with_danger_skip_domain_validation(self.danger_skip_domain_validation);

        if let Some(ca) = &self.ca_pem {
            opts = opts.with_root_certs(vec![ca.clone().into()]);
        }

        if let (Some(cert), Some(key)) = (&self.client_cert_pem, &self.client_key_pem) {
            opts = opts.with_client_identity(Some(ClientIdentity::new(
                cert.clone().into(),
                key.clone().into(),
            )));
        }

        opts
    }
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("custom_ca", &self.ca_pem.is_some())
            .field("client_identity", &self.client_cert_pem.is_some())
            .field(
                "danger_accept_invalid_certs",
                &self.danger_accept_invalid_certs,
            )
            .field(
                "danger_skip_domain_validation",
                &self.danger_skip_domain_validation,
            )
            .field("client_config", &"<ClientConfig>")
            .finish()
    }
}

/// Builder for TLS material.
#[derive(Default)]
pub struct TlsMaterialBuilder {
    ca_pem: Option<Vec<u8>>,
    client_identity: Option<(Vec<u8>, Vec<u8>)>,
    danger_accept_invalid_certs: bool,
    danger_skip_domain_validation: bool,
}

impl TlsMaterialBuilder {
    /// Trust the certificates in this PEM bundle instead of the system roots.
    pub fn ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_pem = Some(pem.into());
        self
    }

    /// Present this certificate chain and private key to the server.
    pub fn client_identity(mut self, cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Self {
        self.client_identity = Some((cert_pem.into(), key_pem.into()));
        self
    }

    /// ⚠️ **DANGER**: Accept invalid server certificates.
    ///
    /// The connection is still encrypted but open to man-in-the-middle attacks.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.danger_accept_invalid_certs = accept;
        self
    }

    /// ⚠️ **DANGER**: Skip matching the certificate against the server hostname.
    ///
    /// The chain is still verified against the trusted roots.
    pub fn danger_skip_domain_validation(mut self, skip: bool) -> Self {
        self.danger_skip_domain_validation = skip;
        self
    }

    /// Build the TLS material.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if:
    /// - the CA bundle is not valid PEM or holds no certificate
    /// - the client certificate or key cannot be parsed
    /// - the client key does not match the client certificate
    pub fn build(self) -> Result<TlsMaterial> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let root_store = match &self.ca_pem {
            Some(pem) => load_ca_bundle(pem)?,
            None => system_roots(),
        };

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Config(format!("failed to configure TLS protocol versions: {}", e)))?
            .with_root_certificates(root_store);

        let client_config = match &self.client_identity {
            Some((cert_pem, key_pem)) => {
                let certs = load_cert_chain(cert_pem)?;
                let key = load_private_key(key_pem)?;
                check_key_matches(&provider, &certs, &key)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| Error::Config(format!("invalid client certificate or key: {}", e)))?
            }
            None => builder.with_no_client_auth(),
        };

        let (client_cert_pem, client_key_pem) = match self.client_identity {
            Some((cert, key)) => (Some(cert), Some(key)),
            None => (None, None),
        };

        Ok(TlsMaterial {
            ca_pem: self.ca_pem,
            client_cert_pem,
            client_key_pem,
            danger_accept_invalid_certs: self.danger_accept_invalid_certs,
            danger_skip_domain_validation: self.danger_skip_domain_validation,
            client_config: Arc::new(client_config),
        })
    }
}

/// Driver TLS options for the built-in roots (`tls = true` / `skip-verify`)
pub fn system_ssl_opts(skip_verify: bool) -> SslOpts {
    SslOpts::default().with_danger_accept_invalid_certs(skip_verify)
}

fn system_roots() -> RootCertStore {
    let result = rustls_native_certs::load_native_certs();

    let mut store = RootCertStore::empty();
    for cert in result.certs {
        let _ = store.add_parsable_certificates(std::iter::once(cert));
    }

    if store.is_empty() {
        tracing::debug!("no native root certificates found, using bundled webpki roots");
        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    store
}

fn load_ca_bundle(pem: &[u8]) -> Result<RootCertStore> {
    let mut reader = io::Cursor::new(pem);
    let mut root_store = RootCertStore::empty();
    let mut found_certs = 0;

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => {
                let (added, _) = root_store.add_parsable_certificates(std::iter::once(cert));
                found_certs += added;
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config("failed to parse CA certificate PEM".into()));
            }
        }
    }

    if found_certs == 0 {
        return Err(Error::Config("no valid certificates found in CA PEM".into()));
    }

    Ok(root_store)
}

fn load_cert_chain(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = io::Cursor::new(pem);
    let mut certs = Vec::new();

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::X509Certificate(cert))) => certs.push(cert),
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(_) => {
                return Err(Error::Config("failed to parse client certificate PEM".into()));
            }
        }
    }

    if certs.is_empty() {
        return Err(Error::Config("no certificate found in client certificate PEM".into()));
    }

    Ok(certs)
}

pub(crate) fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = io::Cursor::new(pem);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(Item::Pkcs8Key(key))) => return Ok(key.into()),
            Ok(Some(Item::Pkcs1Key(key))) => return Ok(key.into()),
            Ok(Some(Item::Sec1Key(key))) => return Ok(key.into()),
            Ok(Some(_)) => {}
            Ok(None) => break,
            // the parse error may quote key bytes
            Err(_) => return Err(Error::Config("failed to parse client key PEM".into())),
        }
    }

    Err(Error::Config("no private key found in client key PEM".into()))
}

fn check_key_matches(
    provider: &CryptoProvider,
    certs: &[CertificateDer<'static>],
    key: &PrivateKeyDer<'static>,
) -> Result<()> {
    let signing_key = provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|e| Error::Config(format!("unsupported client key: {}", e)))?;

    match CertifiedKey::new(certs.to_vec(), signing_key).keys_match() {
        Err(rustls::Error::InconsistentKeys(_)) => Err(Error::Config(
            "client key does not match client certificate".into(),
        )),
        // an unknown key type cannot be compared; the handshake will tell
        _ => Ok(()),
    }
}

/// Named TLS configurations owned by one provider instance.
///
/// Created with the provider and cleared when it is closed.
#[derive(Debug, Default)]
pub struct TlsRegistry {
    entries: Mutex<HashMap<String, Arc<TlsMaterial>>>,
    next_id: AtomicU64,
}

impl TlsRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register material under `key`, or under a generated key when `None`.
    ///
    /// Returns the key the material was stored under.
    pub fn register(&self, key: Option<&str>, material: TlsMaterial) -> String {
        let key = match key {
            Some(k) => k.to_string(),
            None => format!("custom-{}", self.next_id.fetch_add(1, Ordering::Relaxed)),
        };

        let mut entries = self.lock();
        if entries.insert(key.clone(), Arc::new(material)).is_some() {
            tracing::debug!(key = %key, "replaced TLS configuration");
        } else {
            tracing::debug!(key = %key, "registered TLS configuration");
        }
        key
    }

    /// Look up material by key
    pub fn get(&self, key: &str) -> Option<Arc<TlsMaterial>> {
        self.lock().get(key).cloned()
    }

    /// Remove one entry
    pub fn remove(&self, key: &str) -> Option<Arc<TlsMaterial>> {
        self.lock().remove(key)
    }

    /// Number of registered configurations
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TlsMaterial>>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
