//! Server capability probe
//!
//! Runs once after the first successful connection so callers can branch on the
//! server dialect without querying again.

use crate::Result;
use mysql_async::prelude::Queryable;
use std::fmt;

/// SQL returning the server version string
pub const VERSION_QUERY: &str = "SELECT VERSION()";

/// SQL returning the server base directory (RDS installs under `rdsdbbin`)
pub const BASEDIR_QUERY: &str = "SELECT @@GLOBAL.basedir";

/// Server implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerVendor {
    /// Oracle MySQL (including RDS and Aurora MySQL)
    MySql,
    /// MariaDB
    MariaDb,
    /// TiDB
    TiDb,
}

impl fmt::Display for ServerVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerVendor::MySql => write!(f, "MySQL"),
            ServerVendor::MariaDb => write!(f, "MariaDB"),
            ServerVendor::TiDb => write!(f, "TiDB"),
        }
    }
}

/// Comparable `major.minor.patch` version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Patch version
    pub patch: u32,
}

impl ServerVersion {
    /// Create a version triple
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the leading numeric `x[.y[.z]]` of a version string (`v` prefix allowed)
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().trim_start_matches(['v', 'V']);
        let numeric_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());

        let mut parts = s[..numeric_end]
            .split('.')
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u32>());

        let major = parts.next()?.ok()?;
        let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
        Some(Self::new(major, minor, patch))
    }

    /// Whether this version is at least `major.minor.patch`
    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        *self >= Self::new(major, minor, patch)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// TiDB release and the MySQL version it reports compatibility with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiDbInfo {
    /// TiDB release (e.g. 7.5.0)
    pub release: ServerVersion,
    /// MySQL compatibility version (e.g. 8.0.11)
    pub mysql_compat: ServerVersion,
}

/// Result of the one-shot capability probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// Raw `VERSION()` output
    pub version_string: String,
    /// Detected vendor
    pub vendor: ServerVendor,
    /// Parsed engine version (TiDB: the MySQL compatibility version)
    pub version: Option<ServerVersion>,
    /// TiDB details
    pub tidb: Option<TiDbInfo>,
    /// Running on Amazon RDS
    pub rds: bool,
}

impl ServerCapabilities {
    /// Build capabilities from the version string and the optional base directory
    pub fn from_parts(version_string: &str, basedir: Option<&str>) -> Self {
        let vendor = if version_string.contains("TiDB") {
            ServerVendor::TiDb
        } else if version_string.contains("MariaDB") {
            ServerVendor::MariaDb
        } else {
            ServerVendor::MySql
        };

        let tidb = (vendor == ServerVendor::TiDb)
            .then(|| parse_tidb(version_string))
            .flatten();

        let version = match vendor {
            // replication handshake prefix: 5.5.5-10.6.12-MariaDB
            ServerVendor::MariaDb => ServerVersion::parse(
                version_string
                    .strip_prefix("5.5.5-")
                    .unwrap_or(version_string),
            ),
            _ => ServerVersion::parse(version_string),
        };

        Self {
            version_string: version_string.to_string(),
            vendor,
            version,
            tidb,
            rds: basedir.is_some_and(|dir| dir.contains("rdsdbbin")),
        }
    }

    /// Whether the server is MariaDB
    pub fn is_mariadb(&self) -> bool {
        self.vendor == ServerVendor::MariaDb
    }

    /// Whether the server is TiDB
    pub fn is_tidb(&self) -> bool {
        self.vendor == ServerVendor::TiDb
    }
}

/// `8.0.11-TiDB-v7.5.0[-suffix]`
fn parse_tidb(version_string: &str) -> Option<TiDbInfo> {
    let (compat, rest) = version_string.split_once("-TiDB-")?;
    Some(TiDbInfo {
        release: ServerVersion::parse(rest)?,
        mysql_compat: ServerVersion::parse(compat)?,
    })
}

/// Probe a live connection.
///
/// The base directory lookup is best effort: some managed offerings deny it.
pub async fn probe<C: Queryable + Send>(conn: &mut C) -> Result<ServerCapabilities> {
    let version: Option<String> = conn.query_first(VERSION_QUERY).await?;
    let version = version.unwrap_or_default();

    let basedir: Option<String> = match conn.query_first(BASEDIR_QUERY).await {
        Ok(dir) => dir,
        Err(e) => {
            tracing::debug!(error = %e, "basedir lookup failed, assuming non-RDS");
            None
        }
    };

    let caps = ServerCapabilities::from_parts(&version, basedir.as_deref());
    tracing::info!(
        vendor = %caps.vendor,
        version = %caps.version_string,
        rds = caps.rds,
        "server capabilities detected"
    );
    Ok(caps)
}
