//! Connection resolution and credential acquisition for a MySQL resource provider
//!
//! Given a declarative configuration block, `mysql-provider`:
//!
//! * validates it into an immutable [`ConnectionSpec`] (every contradiction is
//!   reported before a secret is fetched or a socket opened)
//! * resolves the optional `aws_config` / `azure_config` block into SDK credential chains
//! * selects one transport: TCP, Unix socket, Cloud SQL, or the RDS Data API
//! * mints a fresh credential per dial (static password, RDS IAM token,
//!   Azure AD token, Cloud SQL OAuth2 token)
//! * builds the pooled connection under a bounded retry budget and probes
//!   the server's vendor and version once
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> mysql_provider::Result<()> {
//! use mysql_provider::{AwsConfigBlock, MysqlProvider, ProviderConfig, QueryExecutor};
//!
//! let config = ProviderConfig::new()
//!     .endpoint("aws://mydb.abc123.us-east-1.rds.amazonaws.com:3306")
//!     .username("iam_user")
//!     .aws_config(AwsConfigBlock {
//!         region: "us-east-1".into(),
//!         aws_rds_iam_auth: true,
//!         ..Default::default()
//!     });
//!
//! let provider = MysqlProvider::configure(config).await?;
//! let rows = provider.query("SELECT user FROM mysql.user").await?;
//! provider.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Secrets never appear in error messages or log lines: passwords and tokens
//! are held in [`SecretString`], whose `Debug` and `Display` print `***`.

#![warn(missing_docs, rust_2018_idioms)]

pub mod auth;
pub mod client;
pub mod cloud;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;

pub use auth::{AuthMode, CredentialProvider, ResolvedCredential, SecretString};
pub use client::{Endpoint, MysqlProvider, MysqlProviderBuilder};
pub use cloud::{CloudResolver, ResolvedCloudConfig};
pub use config::{
    AwsConfigBlock, AzureConfigBlock, ConnectionSpec, CustomTlsBlock, ProviderConfig, TlsMode,
    TransportScheme,
};
pub use connection::{
    ProviderConnection, QueryExecutor, RetryPolicy, ServerCapabilities, ServerVendor, TlsRegistry,
};
pub use error::{Error, ErrorKind, Result};
