//! Provider entry point and endpoint parsing

mod endpoint;
mod provider_client;

pub use endpoint::{join_host_port, CloudSqlInstance, Endpoint, DEFAULT_PORT};
pub use provider_client::{MysqlProvider, MysqlProviderBuilder};
