//! Endpoint string parsing
//!
//! Supports formats:
//! * host[:port] (plain TCP, default port 3306)
//! * [ipv6]:port
//! * /path/to/mysqld.sock or ./relative.sock (Unix socket)
//! * aws://host[:port] (RDS, IAM token authentication)
//! * azure://host[:port] (Azure Database for MySQL, AD token authentication)
//! * cloudsql://project:region:instance or cloudsql://project/region/instance
//!
//! The endpoint is parsed once when the connection spec is built; the rest of the
//! connection path matches on [`Endpoint`] instead of re-inspecting strings.

use crate::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// Default MySQL TCP port
pub const DEFAULT_PORT: u16 = 3306;

const AWS_SCHEME: &str = "aws://";
const AZURE_SCHEME: &str = "azure://";
const CLOUDSQL_SCHEME: &str = "cloudsql://";

/// Parsed endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Plain TCP host and port
    Tcp {
        /// Hostname or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Unix domain socket
    Unix(PathBuf),
    /// `aws://` endpoint: RDS instance reached over TCP with an IAM token
    Aws {
        /// Hostname with the scheme stripped
        host: String,
        /// TCP port
        port: u16,
    },
    /// `azure://` endpoint: Azure Database for MySQL with an AD token
    Azure {
        /// Hostname with the scheme stripped
        host: String,
        /// TCP port
        port: u16,
    },
    /// `cloudsql://` endpoint: Google Cloud SQL instance connection name
    CloudSql(CloudSqlInstance),
}

/// Cloud SQL instance connection name (`project:region:instance`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloudSqlInstance {
    /// Google Cloud project id
    pub project: String,
    /// Region of the instance
    pub region: String,
    /// Instance name
    pub name: String,
}

impl CloudSqlInstance {
    /// Parse `project:region:instance` or `project/region/instance`.
    ///
    /// Exactly two separators are required and both must be the same character.
    pub fn parse(s: &str) -> Result<Self> {
        let colons = s.matches(':').count();
        let slashes = s.matches('/').count();

        let separator = match (colons, slashes) {
            (2, 0) => ':',
            (0, 2) => '/',
            _ => {
                return Err(Error::Config(format!(
                    "invalid Cloud SQL instance name '{}': expected project:region:instance or project/region/instance",
                    s
                )))
            }
        };

        let parts: Vec<&str> = s.split(separator).collect();
        if parts.iter().any(|p| p.trim().is_empty()) {
            return Err(Error::Config(format!(
                "invalid Cloud SQL instance name '{}': empty component",
                s
            )));
        }

        Ok(Self {
            project: parts[0].to_string(),
            region: parts[1].to_string(),
            name: parts[2].to_string(),
        })
    }

    /// Canonical `project:region:instance` form
    pub fn connection_name(&self) -> String {
        format!("{}:{}:{}", self.project, self.region, self.name)
    }
}

impl fmt::Display for CloudSqlInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.connection_name())
    }
}

impl Endpoint {
    /// Parse an endpoint string
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("endpoint must not be empty".into()));
        }

        if let Some(rest) = s.strip_prefix(AWS_SCHEME) {
            let (host, port) = parse_host_port(rest)?;
            return Ok(Endpoint::Aws { host, port });
        }

        if let Some(rest) = s.strip_prefix(AZURE_SCHEME) {
            let (host, port) = parse_host_port(rest)?;
            return Ok(Endpoint::Azure { host, port });
        }

        if let Some(rest) = s.strip_prefix(CLOUDSQL_SCHEME) {
            return Ok(Endpoint::CloudSql(CloudSqlInstance::parse(rest)?));
        }

        if let Some((scheme, _)) = s.split_once("://") {
            return Err(Error::Config(format!(
                "unrecognized endpoint scheme '{}://': expected aws://, azure://, cloudsql://, host:port or a socket path",
                scheme
            )));
        }

        if is_socket_path(s) {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }

        let (host, port) = parse_host_port(s)?;
        Ok(Endpoint::Tcp { host, port })
    }

    /// TCP host and port, if this endpoint is dialed over TCP
    pub fn host_port(&self) -> Option<(&str, u16)> {
        match self {
            Endpoint::Tcp { host, port }
            | Endpoint::Aws { host, port }
            | Endpoint::Azure { host, port } => Some((host.as_str(), *port)),
            Endpoint::Unix(_) | Endpoint::CloudSql(_) => None,
        }
    }

    /// Whether the endpoint scheme itself demands an IAM token
    pub fn is_aws(&self) -> bool {
        matches!(self, Endpoint::Aws { .. })
    }

    /// Whether the endpoint scheme itself demands an Azure AD token
    pub fn is_azure(&self) -> bool {
        matches!(self, Endpoint::Azure { .. })
    }

    /// Cloud SQL instance, if any
    pub fn cloud_sql(&self) -> Option<&CloudSqlInstance> {
        match self {
            Endpoint::CloudSql(instance) => Some(instance),
            _ => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}", join_host_port(host, *port)),
            Endpoint::Unix(path) => write!(f, "{}", path.display()),
            Endpoint::Aws { host, port } => write!(f, "{}{}", AWS_SCHEME, join_host_port(host, *port)),
            Endpoint::Azure { host, port } => {
                write!(f, "{}{}", AZURE_SCHEME, join_host_port(host, *port))
            }
            Endpoint::CloudSql(instance) => write!(f, "{}{}", CLOUDSQL_SCHEME, instance),
        }
    }
}

/// Format host and port, bracketing IPv6 literals
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

fn is_socket_path(s: &str) -> bool {
    s.starts_with('/') || s.starts_with("./") || s.starts_with("../") || s.ends_with(".sock")
}

/// Split `host[:port]` (or `[v6]:port`) into components
fn parse_host_port(s: &str) -> Result<(String, u16)> {
    if s.is_empty() {
        return Err(Error::Config("endpoint host must not be empty".into()));
    }

    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| Error::Config(format!("invalid IPv6 endpoint '{}'", s)))?;
        let port = match after {
            "" => DEFAULT_PORT,
            p => parse_port(p.strip_prefix(':').ok_or_else(|| {
                Error::Config(format!("invalid IPv6 endpoint '{}'", s))
            })?)?,
        };
        return Ok((host.to_string(), port));
    }

    match s.rsplit_once(':') {
        Some((host, port)) => {
            if host.is_empty() {
                return Err(Error::Config(format!("endpoint '{}' is missing a host", s)));
            }
            if host.contains(':') {
                return Err(Error::Config(format!(
                    "invalid endpoint '{}': IPv6 addresses must be bracketed",
                    s
                )));
            }
            Ok((host.to_string(), parse_port(port)?))
        }
        None => Ok((s.to_string(), DEFAULT_PORT)),
    }
}

fn parse_port(s: &str) -> Result<u16> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(Error::Config(format!("invalid port '{}'", s))),
        Ok(port) => Ok(port),
    }
}
