//! Transport selection
//!
//! The endpoint is parsed into a closed [`Endpoint`] enum when the connection spec is
//! built; this module maps it (plus the Data API flag) to a [`TransportPlan`].
//! A plan becomes a concrete [`DialTarget`] in the connection factory, once
//! Cloud SQL addresses are looked up and the proxy forwarder is running.

use crate::client::{join_host_port, CloudSqlInstance, Endpoint};
use crate::cloud::{CloudSqlIpType, DataApiTarget};
use crate::config::{ConnectionSpec, TransportScheme};
use crate::{Error, Result};
use std::fmt;
use std::path::PathBuf;

/// How a connection will be established
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportPlan {
    /// TCP dial (plain, `aws://` and `azure://` endpoints)
    Tcp {
        /// Hostname or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Unix domain socket dial
    Unix(PathBuf),
    /// Cloud SQL instance, dialed at the address of the selected attachment path
    CloudSql {
        /// Instance connection name
        instance: CloudSqlInstance,
        /// Public or private address
        ip_type: CloudSqlIpType,
    },
    /// No dial; queries become RDS Data API calls
    DataApi(DataApiTarget),
}

impl TransportPlan {
    /// Transport scheme of this plan
    pub fn scheme(&self) -> TransportScheme {
        match self {
            TransportPlan::Tcp { .. } | TransportPlan::Unix(_) => TransportScheme::Direct,
            TransportPlan::CloudSql { .. } => TransportScheme::CloudSql,
            TransportPlan::DataApi(_) => TransportScheme::AwsDataApi,
        }
    }

    /// Whether a network dial happens at all
    pub fn dials(&self) -> bool {
        !matches!(self, TransportPlan::DataApi(_))
    }
}

impl fmt::Display for TransportPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportPlan::Tcp { host, port } => write!(f, "tcp://{}", join_host_port(host, *port)),
            TransportPlan::Unix(path) => write!(f, "unix://{}", path.display()),
            TransportPlan::CloudSql { instance, ip_type } => {
                write!(f, "cloudsql://{} ({} ip)", instance, ip_type)
            }
            TransportPlan::DataApi(target) => write!(f, "data-api://{}", target.cluster_arn),
        }
    }
}

/// Select the transport for `spec`
pub fn select_transport(spec: &ConnectionSpec) -> Result<TransportPlan> {
    if let Some(target) = spec.data_api() {
        return Ok(TransportPlan::DataApi(target.clone()));
    }

    let endpoint = spec
        .endpoint()
        .ok_or_else(|| Error::Config("endpoint is required".into()))?;

    let plan = match endpoint {
        Endpoint::Tcp { host, port } | Endpoint::Aws { host, port } | Endpoint::Azure { host, port } => {
            TransportPlan::Tcp {
                host: host.clone(),
                port: *port,
            }
        }
        Endpoint::Unix(path) => TransportPlan::Unix(path.clone()),
        Endpoint::CloudSql(instance) => TransportPlan::CloudSql {
            instance: instance.clone(),
            ip_type: spec.cloud_sql_ip_type(),
        },
    };

    tracing::debug!(plan = %plan, "selected transport");
    Ok(plan)
}

/// Concrete address handed to the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// TCP host and port
    Tcp {
        /// Hostname or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Unix socket path
    Unix(PathBuf),
}

impl DialTarget {
    /// TCP target
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        DialTarget::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Tcp { host, port } => f.write_str(&join_host_port(host, *port)),
            DialTarget::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}
